//! Mali device access.
//!
//! [`DeviceHandle`] owns (or borrows) the device file descriptor;
//! [`Instance`] queries everything the sampler layer needs from it once:
//! kernel version, GPU properties, counters enumeration and the counters
//! back-end to use.

mod handle;
mod instance;

pub use handle::DeviceHandle;
pub use instance::{GpuConstants, Instance};
