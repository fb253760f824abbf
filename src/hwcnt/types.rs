//! Core hardware counters types.

use super::SampleValuesType;

/// Hardware counters block type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Front end.
    Fe,
    /// Tiler.
    Tiler,
    /// Memory system.
    Memory,
    /// Shader core.
    Core,
    /// CSF firmware.
    Firmware,
    /// Firmware command stream group.
    Csg,
}

impl BlockType {
    /// All block types, in index order.
    pub const ALL: [BlockType; 6] = [
        BlockType::Fe,
        BlockType::Tiler,
        BlockType::Memory,
        BlockType::Core,
        BlockType::Firmware,
        BlockType::Csg,
    ];

    /// Index of this block type into per-type arrays.
    pub fn index(self) -> usize {
        match self {
            BlockType::Fe => 0,
            BlockType::Tiler => 1,
            BlockType::Memory => 2,
            BlockType::Core => 3,
            BlockType::Firmware => 4,
            BlockType::Csg => 5,
        }
    }
}

/// Performance counters set.
///
/// The hardware has a limited number of registers to accumulate counter
/// values, so the full set of counters is split into a few disjoint sets
/// of which one is collected per profiling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfcntSet {
    /// Primary set.
    Primary,
    /// Secondary set.
    Secondary,
    /// Tertiary set.
    Tertiary,
}

impl Default for PrfcntSet {
    fn default() -> Self {
        PrfcntSet::Primary
    }
}

/// Block state during the counters sample time.
///
/// If no bit is set the block state is unknown and the corresponding
/// [`Features`] flags are false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockState {
    /// The block was powered on for some portion of the sample.
    pub on: bool,
    /// The block was powered off for some portion of the sample.
    pub off: bool,
    /// The block was available to this VM for some portion of the sample.
    pub available: bool,
    /// The block was not available to this VM for some portion of the
    /// sample. No data is collected while unavailable.
    pub unavailable: bool,
    /// The block operated in non-protected mode for some portion of the
    /// sample.
    pub normal: bool,
    /// The block operated in protected mode for some portion of the
    /// sample. No data is collected in protected mode.
    pub protected_mode: bool,
}

/// Sample flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    /// The sample period was stretched because the counters ring buffer
    /// was full. Only meaningful when [`Features::has_stretched_flag`] is
    /// set.
    pub stretched: bool,
    /// The sample had an error condition for its duration.
    pub error: bool,
}

/// Hardware counters sample metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleMetadata {
    /// User data.
    pub user_data: u64,
    /// Sample flags.
    pub flags: SampleFlags,
    /// Sample number.
    pub sample_nr: u64,
    /// Earliest timestamp that values in this sample represent.
    pub timestamp_ns_begin: u64,
    /// Latest timestamp that values in this sample represent.
    pub timestamp_ns_end: u64,
    /// GPU cycles elapsed since the last sample. Undefined when
    /// [`Features::has_gpu_cycle`] is false.
    pub gpu_cycle: u64,
    /// Shader cores cycles elapsed since the last sample. Undefined when
    /// [`Features::has_gpu_cycle`] is false.
    pub sc_cycle: u64,
}

/// Features the kernel-side counters infrastructure supports.
///
/// Different ioctl interface generations annotate samples with different
/// metadata; this structure lists what this back-end instance provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Samples are annotated with GPU and shader cores cycle counts.
    pub has_gpu_cycle: bool,
    /// [`BlockState`] power values are set.
    pub has_power_states: bool,
    /// [`BlockState`] availability values are set.
    pub has_vm_states: bool,
    /// [`BlockState`] protected mode values are set.
    pub has_protection_states: bool,
    /// The back-end reports ring buffer overflow through
    /// [`SampleFlags::stretched`].
    pub has_stretched_flag: bool,
    /// Counter values saturate at their maximum instead of wrapping.
    pub overflow_behavior_defined: bool,
}

/// View over one block's counter values in the mapped sample buffer.
///
/// The view is only valid between the `get_sample` and `put_sample` calls
/// that bracket the sample it was decoded from; the borrow on the reader
/// enforces that statically.
#[derive(Debug, Clone, Copy)]
pub struct CounterValues<'a> {
    data: &'a [u8],
    values_type: SampleValuesType,
}

impl<'a> CounterValues<'a> {
    pub(crate) fn new(data: &'a [u8], values_type: SampleValuesType) -> Self {
        CounterValues { data, values_type }
    }

    /// Number of counter slots in this block.
    pub fn len(&self) -> usize {
        self.data.len() / self.values_type.width()
    }

    /// True if there are no counter slots.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the counter value at `index`, widened to `u64`.
    ///
    /// It is a programming error to index past [`CounterValues::len`].
    pub fn get(&self, index: usize) -> u64 {
        let width = self.values_type.width();
        let bytes = &self.data[index * width..(index + 1) * width];

        match self.values_type {
            SampleValuesType::U32 => {
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
            }
            SampleValuesType::U64 => u64::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
        }
    }

    /// Iterate over all counter values, widened to `u64`.
    pub fn iter(&self) -> impl Iterator<Item = u64> + 'a {
        let this = *self;
        (0..this.len()).map(move |index| this.get(index))
    }
}

/// Hardware counters block metadata.
///
/// A sample is structured as a sequence of blocks. Each block has a type
/// naming the hardware unit the counters were collected from, and an index
/// identifying the instance of that unit.
#[derive(Debug, Clone, Copy)]
pub struct BlockMetadata<'a> {
    /// Type of this block.
    pub block_type: BlockType,
    /// Index of this block within the blocks of its type.
    pub index: u8,
    /// Counter set this block stores.
    pub set: PrfcntSet,
    /// State of this block during the sample time.
    pub state: BlockState,
    /// The block's counter values.
    pub values: CounterValues<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_values_widths() {
        let data: Vec<u8> = (0u32..4).flat_map(|v| v.to_ne_bytes().to_vec()).collect();
        let values = CounterValues::new(&data, SampleValuesType::U32);
        assert_eq!(values.len(), 4);
        assert_eq!(values.get(0), 0);
        assert_eq!(values.get(3), 3);

        let data: Vec<u8> = (0u64..2).flat_map(|v| v.to_ne_bytes().to_vec()).collect();
        let values = CounterValues::new(&data, SampleValuesType::U64);
        assert_eq!(values.len(), 2);
        assert_eq!(values.iter().collect::<Vec<_>>(), vec![0, 1]);
    }
}
