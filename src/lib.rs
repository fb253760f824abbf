//! Utilities to sample hardware performance counters from the Arm Mali
//! kernel driver.
//!
//! The driver exposes several mutually incompatible counters ioctl
//! interfaces across hardware and kernel generations. This crate discovers
//! at runtime which interface a given kernel/GPU pair supports, drives it
//! through a uniform sampler state machine, and decodes the memory mapped
//! counter data into a stable, version independent iteration model.
//!
//! ```no_run
//! use hwcnt_utils::device::{DeviceHandle, Instance};
//! use hwcnt_utils::hwcnt::{blocks_view, BlockType, PrfcntSet};
//! use hwcnt_utils::sampler::{Configuration, Manual};
//!
//! # fn main() -> hwcnt_utils::Result<()> {
//! let handle = DeviceHandle::create(0)?;
//! let instance = Instance::new(&handle)?;
//!
//! let configs = [Configuration {
//!     block_type: BlockType::Core,
//!     set: PrfcntSet::Primary,
//!     enable_map: u128::max_value(),
//! }];
//!
//! let mut sampler = Manual::new(&instance, &configs)?;
//! sampler.accumulation_start()?;
//! sampler.request_sample(0)?;
//!
//! let reader = sampler.reader_mut();
//! let (metadata, sample) = reader.get_sample()?;
//! println!("sample {} at {} ns", metadata.sample_nr, metadata.timestamp_ns_end);
//! for block in blocks_view(reader, sample) {
//!     println!("{:?}[{}]: {} counters", block.block_type, block.index, block.values.len());
//! }
//! reader.put_sample(sample)?;
//!
//! sampler.accumulation_stop(0)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, missing_debug_implementations)]

mod errors;
pub use errors::{Error, Result};

pub mod ioctl;

pub mod syscall;

pub mod product;
pub use product::{GpuFamily, GpuFrontend, ProductId};

mod version;
pub use version::{IoctlIface, KbaseVersion};

pub mod hwcnt;

pub mod sampler;

pub mod device;
pub use device::{DeviceHandle, Instance};

#[allow(dead_code)]
pub(crate) mod util;
