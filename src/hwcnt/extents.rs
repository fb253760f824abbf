//! Block and clock extents.

use super::BlockType;

/// Number of distinct block types.
pub const NUM_BLOCK_TYPES: usize = 6;

/// Type of the hardware counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleValuesType {
    /// Counter values are 32 bit unsigned integers.
    U32,
    /// Counter values are 64 bit unsigned integers.
    U64,
}

impl SampleValuesType {
    /// Width of one counter value in bytes.
    pub fn width(self) -> usize {
        match self {
            SampleValuesType::U32 => 4,
            SampleValuesType::U64 => 8,
        }
    }
}

impl Default for SampleValuesType {
    fn default() -> Self {
        SampleValuesType::U32
    }
}

/// The shape of counter data for a device/back-end pair.
///
/// Stores how many blocks exist per block type, how many counters each
/// block carries and how wide the counter values are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockExtents {
    num_blocks_of_type: [u8; NUM_BLOCK_TYPES],
    counters_per_block: u16,
    values_type: SampleValuesType,
}

/// Hard protocol ceiling on counters per block.
pub(crate) const MAX_COUNTERS_PER_BLOCK: u16 = 128;

impl BlockExtents {
    /// Construct block extents.
    ///
    /// `counters_per_block` must not exceed the protocol ceiling of 128.
    pub fn new(
        num_blocks_of_type: [u8; NUM_BLOCK_TYPES],
        counters_per_block: u16,
        values_type: SampleValuesType,
    ) -> Self {
        debug_assert!(counters_per_block <= MAX_COUNTERS_PER_BLOCK);

        BlockExtents {
            num_blocks_of_type,
            counters_per_block,
            values_type,
        }
    }

    /// Total number of hardware counters blocks.
    pub fn num_blocks(&self) -> u8 {
        self.num_blocks_of_type
            .iter()
            .fold(0u8, |acc, &count| acc.wrapping_add(count))
    }

    /// Number of blocks of a given type.
    pub fn num_blocks_of_type(&self, block_type: BlockType) -> u8 {
        self.num_blocks_of_type[block_type.index()]
    }

    /// Number of counters per block.
    pub fn counters_per_block(&self) -> u16 {
        self.counters_per_block
    }

    /// Type of the hardware counter values.
    pub fn values_type(&self) -> SampleValuesType {
        self.values_type
    }
}

/// Which cycle counters annotate samples on this device.
///
/// Old kernel interfaces predate clock enumeration; an instance then has
/// no clock extents at all rather than an all-false value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockExtents {
    /// The GPU top clock cycle counter is reported.
    pub has_gpu_cycle: bool,
    /// The shader cores clock cycle counter is reported.
    pub has_sc_cycle: bool,
}

impl ClockExtents {
    /// Number of enabled cycle counters.
    pub fn num_enabled_clocks(&self) -> u16 {
        self.has_gpu_cycle as u16 + self.has_sc_cycle as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_extents_totals() {
        let extents = BlockExtents::new([1, 1, 2, 8, 0, 0], 64, SampleValuesType::U32);

        assert_eq!(extents.num_blocks(), 12);
        assert_eq!(extents.num_blocks_of_type(BlockType::Fe), 1);
        assert_eq!(extents.num_blocks_of_type(BlockType::Core), 8);
        assert_eq!(extents.num_blocks_of_type(BlockType::Firmware), 0);
        assert_eq!(extents.counters_per_block(), 64);
        assert_eq!(extents.values_type(), SampleValuesType::U32);
    }

    #[test]
    fn test_clock_extents() {
        let clocks = ClockExtents {
            has_gpu_cycle: true,
            has_sc_cycle: false,
        };
        assert_eq!(clocks.num_enabled_clocks(), 1);
    }
}
