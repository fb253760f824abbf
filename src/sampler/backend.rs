//! Sampler back-end plumbing shared by all protocol variants.

use super::guard::{FdGuard, MappedMemory};
use super::poll::check_ready_read;
use crate::hwcnt::{BlockExtents, BlockType, Features, Reader, NUM_BLOCK_TYPES};
use crate::syscall::{monotonic_now_ns, SyscallIface};
use crate::{Error, Result};

/// Per-block counters configuration.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    /// Block type to enable counters for.
    pub block_type: BlockType,
    /// Counters set to activate for this block type.
    pub set: crate::hwcnt::PrfcntSet,
    /// Bitmask of counter numbers to enable for this block type.
    ///
    /// One bit per counter, up to the protocol ceiling of 128 counters
    /// per block.
    pub enable_map: u128,
}

/// Sampling mode of a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerMode {
    /// Samples are taken on request only.
    Manual,
    /// Samples are taken periodically by the kernel.
    Periodic,
}

/// Narrow instance-level block extents to the configured block types.
///
/// Rejects configurations naming a block type the instance does not
/// advertise, and configurations naming the same block type twice.
pub fn filter_block_extents(
    extents: &BlockExtents,
    configs: &[Configuration],
) -> Result<BlockExtents> {
    let mut num_blocks_of_type = [0u8; NUM_BLOCK_TYPES];

    for config in configs {
        let advertised = extents.num_blocks_of_type(config.block_type);
        if advertised == 0 {
            return Err(Error::InvalidArgument(
                "block type not advertised by the instance",
            ));
        }

        let slot = &mut num_blocks_of_type[config.block_type.index()];
        if *slot != 0 {
            return Err(Error::InvalidArgument("block type configured twice"));
        }

        *slot = advertised;
    }

    Ok(BlockExtents::new(
        num_blocks_of_type,
        extents.counters_per_block(),
        extents.values_type(),
    ))
}

/// State shared by every back-end implementation: the session descriptor,
/// the mapped counters buffer and the sampling parameters.
#[derive(Debug)]
pub(crate) struct BackendBase<S: SyscallIface> {
    /// Counters session file descriptor.
    pub fd: FdGuard<S>,
    /// Sampling period in nanoseconds. Zero for manual sampling.
    pub period_ns: u64,
    /// Features of this back-end instance.
    pub features: Features,
    /// Block extents filtered to the requested block types.
    pub extents: BlockExtents,
    /// Read-only mapping of the kernel counters buffer.
    pub memory: MappedMemory<S>,
    /// Syscall interface.
    pub syscall: S,
}

impl<S: SyscallIface> BackendBase<S> {
    /// Sampling mode selected at creation time.
    pub fn mode(&self) -> SamplerMode {
        if self.period_ns == 0 {
            SamplerMode::Manual
        } else {
            SamplerMode::Periodic
        }
    }
}

/// The sampler back-end state machine.
///
/// One implementation exists per kernel counters interface generation,
/// selected once at creation time. A back-end is created idle; `start`
/// moves it to active, `stop` back to idle. `stop` takes one final
/// synchronous sample before halting accumulation, observable through the
/// reader like any other sample.
pub trait SamplerBackend {
    /// Start counters sampling (periodic mode) or accumulation (manual
    /// mode). No-op when already active.
    ///
    /// `user_data` is echoed back in every sample's metadata until changed
    /// by a subsequent call.
    fn start(&mut self, user_data: u64) -> Result<()>;

    /// Stop counters sampling or accumulation, taking one last synchronous
    /// sample first. No-op when idle.
    fn stop(&mut self, user_data: u64) -> Result<()>;

    /// Take one synchronous sample. Only valid for manual back-ends.
    fn request_sample(&mut self, user_data: u64) -> Result<()>;

    /// The reader decoding this back-end's samples.
    fn reader(&self) -> &dyn Reader;

    /// The reader decoding this back-end's samples, mutably.
    fn reader_mut(&mut self) -> &mut dyn Reader;
}

/// Shared `Reader::discard` implementation.
///
/// Consumes and returns every sample that is already waiting. Samples
/// taken after the call started are left alone so that discarding cannot
/// loop forever against a fast periodic producer.
pub(crate) fn discard_impl<R, S>(reader: &mut R, syscall: &S) -> Result<()>
where
    R: Reader + ?Sized,
    S: SyscallIface,
{
    let now = monotonic_now_ns();

    loop {
        if !check_ready_read(syscall, reader.fd())? {
            break;
        }

        let (metadata, handle) = reader.get_sample()?;
        reader.put_sample(handle)?;

        if metadata.timestamp_ns_end >= now {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwcnt::{PrfcntSet, SampleValuesType};

    fn config(block_type: BlockType) -> Configuration {
        Configuration {
            block_type,
            set: PrfcntSet::Primary,
            enable_map: u128::max_value(),
        }
    }

    fn extents() -> BlockExtents {
        BlockExtents::new([1, 1, 2, 8, 0, 0], 64, SampleValuesType::U32)
    }

    #[test]
    fn test_filter_keeps_requested_types_only() {
        let filtered =
            filter_block_extents(&extents(), &[config(BlockType::Fe), config(BlockType::Core)])
                .unwrap();

        assert_eq!(filtered.num_blocks_of_type(BlockType::Fe), 1);
        assert_eq!(filtered.num_blocks_of_type(BlockType::Core), 8);
        assert_eq!(filtered.num_blocks_of_type(BlockType::Tiler), 0);
        assert_eq!(filtered.num_blocks_of_type(BlockType::Memory), 0);
        assert_eq!(filtered.counters_per_block(), 64);
    }

    #[test]
    fn test_filter_rejects_unadvertised_block_type() {
        for configs in &[
            vec![config(BlockType::Firmware)],
            vec![config(BlockType::Fe), config(BlockType::Csg)],
            vec![config(BlockType::Csg), config(BlockType::Fe)],
        ] {
            match filter_block_extents(&extents(), configs) {
                Err(Error::InvalidArgument(_)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }

    #[test]
    fn test_filter_rejects_duplicates_in_both_orders() {
        for configs in &[
            vec![config(BlockType::Core), config(BlockType::Core)],
            vec![
                config(BlockType::Core),
                config(BlockType::Fe),
                config(BlockType::Core),
            ],
            vec![
                config(BlockType::Fe),
                config(BlockType::Core),
                config(BlockType::Fe),
            ],
        ] {
            match filter_block_extents(&extents(), configs) {
                Err(Error::InvalidArgument(_)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }
}
