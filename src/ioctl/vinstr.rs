//! Vinstr counters reader ioctl interface.

use crate::syscall::SyscallIface;
use crate::Result;
use nix::libc;
use nix::{request_code_read, request_code_write};
use std::mem;
use std::os::unix::io::RawFd;

/// Counter dumping events.
#[allow(missing_docs)]
pub mod reader_event {
    pub const MANUAL: u32 = 0;
    pub const PERIODIC: u32 = 1;
    pub const PREJOB: u32 = 2;
    pub const POSTJOB: u32 = 3;
}

/// Features that the vinstr reader supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderFeatures(pub u32);

impl ReaderFeatures {
    /// Samples are annotated with the top cycle counter.
    pub const CYCLES_TOP: ReaderFeatures = ReaderFeatures(1 << 0);
    /// Samples are annotated with the shader cores cycle counter.
    pub const CYCLES_SHADER_CORE: ReaderFeatures = ReaderFeatures(1 << 1);

    /// True if no feature bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: ReaderFeatures) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Sample buffer metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderMetadata {
    /// Time when the sample was collected.
    pub timestamp: u64,
    /// Id of the event that triggered the sample collection.
    pub event_id: u32,
    /// Position in the sampling area where the sample was stored.
    pub buffer_idx: u32,
}

/// GPU clock cycles metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderMetadataCycles {
    /// Number of cycles of the GPU top clock.
    pub top: u64,
    /// Number of cycles elapsed on the shader cores.
    pub shader_cores: u64,
}

/// Sample buffer metadata annotated with cycle counts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderMetadataWithCycles {
    /// Reader metadata.
    pub metadata: ReaderMetadata,
    /// GPU cycles since the last sample.
    pub cycles: ReaderMetadataCycles,
}

/// Reader API version.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderApiVersion {
    /// API version.
    pub version: u32,
    /// Features available in this API version.
    pub features: u32,
}

/// Vinstr reader ioctl interface number.
const IFACE: u8 = 0xbe;

/// Get the counters dump buffer size.
pub const GET_BUFFER_SIZE: libc::c_ulong =
    request_code_read!(IFACE, 0x1, mem::size_of::<u32>()) as libc::c_ulong;
/// Request a manual counters dump.
pub const DUMP: libc::c_ulong =
    request_code_write!(IFACE, 0x10, mem::size_of::<u32>()) as libc::c_ulong;
/// Request a counters clear.
pub const CLEAR: libc::c_ulong =
    request_code_write!(IFACE, 0x11, mem::size_of::<u32>()) as libc::c_ulong;
/// Get a counters buffer.
pub const GET_BUFFER: libc::c_ulong =
    request_code_read!(IFACE, 0x20, mem::size_of::<ReaderMetadata>()) as libc::c_ulong;
/// Get a counters buffer with cycle counters.
pub const GET_BUFFER_WITH_CYCLES: libc::c_ulong =
    request_code_read!(IFACE, 0x20, mem::size_of::<ReaderMetadataWithCycles>()) as libc::c_ulong;
/// Put a counters buffer.
pub const PUT_BUFFER: libc::c_ulong =
    request_code_write!(IFACE, 0x21, mem::size_of::<ReaderMetadata>()) as libc::c_ulong;
/// Set the sampling interval. Zero for manual sampling.
pub const SET_INTERVAL: libc::c_ulong =
    request_code_write!(IFACE, 0x30, mem::size_of::<u32>()) as libc::c_ulong;
/// Get the reader API version.
pub const GET_API_VERSION: libc::c_ulong =
    request_code_write!(IFACE, 0xff, mem::size_of::<u32>()) as libc::c_ulong;
/// Get the reader API version with the features mask.
pub const GET_API_VERSION_WITH_FEATURES: libc::c_ulong =
    request_code_write!(IFACE, 0xff, mem::size_of::<ReaderApiVersion>()) as libc::c_ulong;

/// Get the counters dump buffer size.
pub fn get_buffer_size<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<u32> {
    let mut size: u32 = 0;
    unsafe { syscall.ioctl_ptr(fd, GET_BUFFER_SIZE, &mut size as *mut _ as *mut libc::c_void)? };
    Ok(size)
}

/// Request a manual counters dump.
pub fn dump<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<()> {
    syscall.ioctl_val(fd, DUMP, 0)?;
    Ok(())
}

/// Clear the accumulated counter values.
pub fn clear<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<()> {
    syscall.ioctl_val(fd, CLEAR, 0)?;
    Ok(())
}

/// Get a counters buffer.
pub fn get_buffer<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<ReaderMetadata> {
    let mut metadata = ReaderMetadata::default();
    unsafe { syscall.ioctl_ptr(fd, GET_BUFFER, &mut metadata as *mut _ as *mut libc::c_void)? };
    Ok(metadata)
}

/// Get a counters buffer annotated with cycle counters.
pub fn get_buffer_with_cycles<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
) -> Result<ReaderMetadataWithCycles> {
    let mut metadata = ReaderMetadataWithCycles::default();
    unsafe {
        syscall.ioctl_ptr(
            fd,
            GET_BUFFER_WITH_CYCLES,
            &mut metadata as *mut _ as *mut libc::c_void,
        )?
    };
    Ok(metadata)
}

/// Put a counters buffer back to the kernel.
pub fn put_buffer<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    metadata: &mut ReaderMetadata,
) -> Result<()> {
    unsafe { syscall.ioctl_ptr(fd, PUT_BUFFER, metadata as *mut _ as *mut libc::c_void)? };
    Ok(())
}

/// Set the periodic sampling interval. Zero stops periodic sampling.
pub fn set_interval<S: SyscallIface>(syscall: &S, fd: RawFd, interval_ns: u32) -> Result<()> {
    syscall.ioctl_val(fd, SET_INTERVAL, interval_ns as libc::c_ulong)?;
    Ok(())
}

/// Get the reader API version, preferring the variant with the feature mask.
pub fn get_api_version<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<ReaderApiVersion> {
    let mut version = ReaderApiVersion::default();

    let with_features = unsafe {
        syscall.ioctl_ptr(
            fd,
            GET_API_VERSION_WITH_FEATURES,
            &mut version as *mut _ as *mut libc::c_void,
        )
    };

    if with_features.is_err() {
        version = ReaderApiVersion::default();
        unsafe {
            syscall.ioctl_ptr(
                fd,
                GET_API_VERSION,
                &mut version.version as *mut _ as *mut libc::c_void,
            )?
        };
    }

    Ok(version)
}
