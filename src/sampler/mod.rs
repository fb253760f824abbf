//! Hardware counters samplers.
//!
//! Two sampler front-ends exist: [`Manual`] takes a sample whenever asked,
//! [`Periodic`] arms kernel-driven sampling at a fixed interval. Both are
//! thin wrappers over the back-end selected for the device instance at
//! creation time; the sampled data is read through
//! [`Reader`](crate::hwcnt::Reader).

mod backend;
mod guard;
mod kinstr_prfcnt;
mod kinstr_prfcnt_wa;
mod poll;
mod queue;
mod vinstr;

pub use backend::{filter_block_extents, Configuration, SamplerBackend, SamplerMode};
pub use guard::{FdGuard, MappedMemory};
pub use queue::Queue;

pub(crate) use kinstr_prfcnt::{
    construct_block_extents, construct_clock_extents, enum_info, EnumInfo,
};
pub(crate) use vinstr::is_v4_layout;

use crate::device::Instance;
use crate::hwcnt::{BackendType, Reader};
use crate::syscall::SyscallIface;
use crate::{Error, Result};

/// Create the back-end matching the instance's selected type.
pub(crate) fn create_backend<S>(
    instance: &Instance<S>,
    period_ns: u64,
    configs: &[Configuration],
) -> Result<Box<dyn SamplerBackend>>
where
    S: SyscallIface + Clone + 'static,
{
    log::debug!(
        "creating {} back-end, period {} ns, {} block configs",
        instance.backend_type(),
        period_ns,
        configs.len()
    );

    match instance.backend_type() {
        BackendType::Vinstr | BackendType::VinstrPreR21 => Ok(Box::new(
            vinstr::VinstrBackend::create(instance, period_ns, configs)?,
        )),
        BackendType::KinstrPrfcnt | BackendType::KinstrPrfcntBad => Ok(Box::new(
            kinstr_prfcnt::KinstrPrfcntBackend::create(instance, period_ns, configs, None)?,
        )),
        BackendType::KinstrPrfcntWa => Ok(Box::new(kinstr_prfcnt_wa::KinstrPrfcntWaBackend::create(
            instance, period_ns, configs,
        )?)),
    }
}

/// Manual hardware counters sampler.
///
/// Counters accumulate between [`Manual::accumulation_start`] and
/// [`Manual::accumulation_stop`]; [`Manual::request_sample`] stores the
/// values accumulated since the previous sample in the ring buffer.
pub struct Manual {
    backend: Box<dyn SamplerBackend>,
}

impl Manual {
    /// Create a manual sampler enabling the configured counters.
    pub fn new<S>(instance: &Instance<S>, configs: &[Configuration]) -> Result<Manual>
    where
        S: SyscallIface + Clone + 'static,
    {
        Ok(Manual {
            backend: create_backend(instance, 0, configs)?,
        })
    }

    /// Start counters accumulation. No-op when already started.
    pub fn accumulation_start(&mut self) -> Result<()> {
        self.backend.start(0)
    }

    /// Stop counters accumulation, taking one final synchronous sample
    /// first. No-op when already stopped.
    pub fn accumulation_stop(&mut self, user_data: u64) -> Result<()> {
        self.backend.stop(user_data)
    }

    /// Sample the counters accumulated since the previous sample.
    ///
    /// Accumulation must have been started. If counters are sampled
    /// rarely their values may saturate; see
    /// [`Features::overflow_behavior_defined`](crate::hwcnt::Features).
    pub fn request_sample(&mut self, user_data: u64) -> Result<()> {
        self.backend.request_sample(user_data)
    }

    /// The reader decoding this sampler's samples.
    pub fn reader(&self) -> &dyn Reader {
        self.backend.reader()
    }

    /// The reader decoding this sampler's samples, mutably.
    pub fn reader_mut(&mut self) -> &mut dyn Reader {
        self.backend.reader_mut()
    }
}

impl std::fmt::Debug for Manual {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manual").finish()
    }
}

/// Periodic hardware counters sampler.
///
/// The kernel takes samples at the configured interval once started. The
/// actual period may be coarsened when the requested one cannot be met.
pub struct Periodic {
    backend: Box<dyn SamplerBackend>,
}

impl Periodic {
    /// Create a periodic sampler with a `period_ns` nanosecond interval.
    ///
    /// A zero period is invalid; use [`Manual`] instead.
    pub fn new<S>(
        instance: &Instance<S>,
        period_ns: u64,
        configs: &[Configuration],
    ) -> Result<Periodic>
    where
        S: SyscallIface + Clone + 'static,
    {
        if period_ns == 0 {
            return Err(Error::InvalidArgument("zero sampling period"));
        }

        Ok(Periodic {
            backend: create_backend(instance, period_ns, configs)?,
        })
    }

    /// Start periodic sampling. No-op when already started.
    pub fn sampling_start(&mut self, user_data: u64) -> Result<()> {
        self.backend.start(user_data)
    }

    /// Stop periodic sampling, taking one final synchronous sample first.
    /// No-op when already stopped.
    pub fn sampling_stop(&mut self, user_data: u64) -> Result<()> {
        self.backend.stop(user_data)
    }

    /// The reader decoding this sampler's samples.
    pub fn reader(&self) -> &dyn Reader {
        self.backend.reader()
    }

    /// The reader decoding this sampler's samples, mutably.
    pub fn reader_mut(&mut self) -> &mut dyn Reader {
        self.backend.reader_mut()
    }
}

impl std::fmt::Debug for Periodic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Periodic").finish()
    }
}
