//! Workaround kinstr_prfcnt back-end.
//!
//! Kernels in the window between the first kinstr_prfcnt release and its
//! fixes have two defects this wrapper compensates for:
//!
//! 1. Shader core block indices are physical core numbers, so a sparse
//!    core mask yields non-contiguous indices. Fixed by remapping the
//!    indices through the core mask (see
//!    [`super::kinstr_prfcnt::BlockIndexRemap`]).
//! 2. When the counters ring buffer is full, `stop` silently drops its
//!    implicit final sample. In manual mode this is fixed by probing the
//!    ring capacity at creation time and reserving one slot for the stop
//!    sample: `request_sample` refuses to fill the last free slot.

use super::backend::{SamplerBackend, SamplerMode};
use super::kinstr_prfcnt::{BlockIndexRemap, KinstrPrfcntBackend};
use super::Configuration;
use crate::device::Instance;
use crate::hwcnt::{
    BlockExtents, BlockHandle, BlockMetadata, Features, Reader, SampleHandle, SampleMetadata,
};
use crate::syscall::SyscallIface;
use crate::{Error, Result};
use std::os::unix::io::RawFd;

/// Upper bound for the ring capacity probe.
const PROBE_BUFFER_MAX: u64 = 1024;

/// Kinstr_prfcnt back-end with the early-kernel workarounds applied.
pub struct KinstrPrfcntWaBackend<S: SyscallIface + Clone> {
    inner: KinstrPrfcntBackend<S>,
    /// Ring capacity measured at creation time (manual mode only).
    num_buffers_max: u64,
    /// Free ring slots (manual mode only).
    num_buffers: u64,
    active: bool,
}

impl<S: SyscallIface + Clone> std::fmt::Debug for KinstrPrfcntWaBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinstrPrfcntWaBackend")
            .field("inner", &self.inner)
            .field("num_buffers", &self.num_buffers)
            .finish()
    }
}

impl<S: SyscallIface + Clone> KinstrPrfcntWaBackend<S> {
    /// Create a workaround back-end for `instance`.
    pub(crate) fn create(
        instance: &Instance<S>,
        period_ns: u64,
        configs: &[Configuration],
    ) -> Result<KinstrPrfcntWaBackend<S>> {
        let remap = BlockIndexRemap::new(instance.constants().shader_core_mask);
        let inner = KinstrPrfcntBackend::create(instance, period_ns, configs, Some(remap))?;

        let mut backend = KinstrPrfcntWaBackend {
            inner,
            num_buffers_max: 0,
            num_buffers: 0,
            active: false,
        };

        if backend.mode() == SamplerMode::Manual {
            backend.num_buffers_max = backend.probe_num_buffers()?;
            backend.num_buffers = backend.num_buffers_max;

            log::debug!(
                "kinstr_prfcnt workaround: {} sample buffers, one reserved for stop",
                backend.num_buffers_max
            );
        }

        Ok(backend)
    }

    /// Measure the ring capacity by sampling until the kernel refuses.
    fn probe_num_buffers(&mut self) -> Result<u64> {
        self.inner.start(0)?;

        let mut count = 0u64;
        while count <= PROBE_BUFFER_MAX {
            if self.inner.request_sample(0).is_err() {
                break;
            }
            count += 1;
        }

        self.inner.stop(0)?;
        self.inner.discard()?;

        Ok(count)
    }

    fn mode(&self) -> SamplerMode {
        self.inner.mode()
    }
}

impl<S: SyscallIface + Clone> SamplerBackend for KinstrPrfcntWaBackend<S> {
    fn start(&mut self, user_data: u64) -> Result<()> {
        if self.active {
            return Ok(());
        }

        if self.mode() == SamplerMode::Manual && self.num_buffers == 0 {
            return Err(Error::NotSupported("no free sample buffers"));
        }

        self.inner.start(user_data)?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self, user_data: u64) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        self.inner.stop(user_data)?;

        if self.mode() == SamplerMode::Manual {
            debug_assert!(self.num_buffers >= 1);
            // The implicit stop sample took the reserved slot.
            self.num_buffers -= 1;
        }

        self.active = false;
        Ok(())
    }

    fn request_sample(&mut self, user_data: u64) -> Result<()> {
        if self.mode() != SamplerMode::Manual {
            return Err(Error::NotSupported(
                "manual samples of a periodic back-end",
            ));
        }

        // Keep one slot free so that a later stop cannot lose its sample.
        if self.num_buffers <= 1 {
            return Err(Error::NotSupported("no free sample buffers"));
        }

        self.inner.request_sample(user_data)?;
        self.num_buffers -= 1;

        Ok(())
    }

    fn reader(&self) -> &dyn Reader {
        self
    }

    fn reader_mut(&mut self) -> &mut dyn Reader {
        self
    }
}

impl<S: SyscallIface + Clone> Reader for KinstrPrfcntWaBackend<S> {
    fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    fn features(&self) -> &Features {
        self.inner.features()
    }

    fn block_extents(&self) -> &BlockExtents {
        self.inner.block_extents()
    }

    fn get_sample(&mut self) -> Result<(SampleMetadata, SampleHandle)> {
        self.inner.get_sample()
    }

    fn next<'a>(
        &'a self,
        sample: &SampleHandle,
        block: &mut BlockHandle,
    ) -> Option<BlockMetadata<'a>> {
        self.inner.next(sample, block)
    }

    fn put_sample(&mut self, sample: SampleHandle) -> Result<()> {
        self.inner.put_sample(sample)?;

        if self.mode() == SamplerMode::Manual {
            self.num_buffers += 1;
            debug_assert!(self.num_buffers <= self.num_buffers_max);
        }

        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        self.inner.discard()
    }
}
