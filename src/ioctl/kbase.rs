//! Post R21 kbase device ioctl interface.

use super::Pointer64;
use crate::syscall::SyscallIface;
use crate::Result;
use nix::libc;
use nix::{request_code_readwrite, request_code_write};
use std::mem;
use std::os::unix::io::RawFd;

/// Check version compatibility between kernel and userspace.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionCheck {
    /// Major version number.
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
}

impl VersionCheck {
    /// True if the kernel filled in a version.
    pub fn is_set(&self) -> bool {
        self.major != 0 || self.minor != 0
    }
}

/// Set kernel context creation flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFlags {
    /// Kernel context creation flags.
    pub create_flags: u32,
}

/// Probe GPU properties.
///
/// The kernel returns the number of bytes needed when `size` is zero, and
/// fills `buffer` with tightly packed little-endian key/value pairs
/// otherwise. The low two bits of each `u32` key encode the value width.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetGpuprops {
    /// Properties buffer pointer.
    pub buffer: Pointer64<u8>,
    /// Size of the buffer.
    pub size: u32,
    /// Flags, must be zero.
    pub flags: u32,
}

/// GPU property codes used by this crate.
#[allow(missing_docs)]
pub mod gpuprop {
    pub const MINOR_REVISION: u32 = 3;
    pub const MAJOR_REVISION: u32 = 4;
    pub const L2_LOG2_CACHE_SIZE: u32 = 14;
    pub const L2_NUM_L2_SLICES: u32 = 15;
    pub const RAW_L2_FEATURES: u32 = 29;
    pub const RAW_CORE_FEATURES: u32 = 30;
    pub const RAW_GPU_ID: u32 = 55;
    pub const RAW_THREAD_FEATURES: u32 = 59;
    pub const COHERENCY_NUM_CORE_GROUPS: u32 = 62;
    pub const COHERENCY_GROUP_0: u32 = 64;
    pub const COHERENCY_GROUP_1: u32 = 65;
    pub const COHERENCY_GROUP_15: u32 = 79;
}

/// Setup the vinstr hardware counters reader.
///
/// The reader file descriptor is returned in the ioctl return value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HwcntReaderSetup {
    /// Requested number of dumping buffers. Must be a power of two.
    pub buffer_count: u32,
    /// Counters selection bitmask (front end).
    pub fe_bm: u32,
    /// Counters selection bitmask (shader).
    pub shader_bm: u32,
    /// Counters selection bitmask (tiler).
    pub tiler_bm: u32,
    /// Counters selection bitmask (MMU/L2).
    pub mmu_l2_bm: u32,
}

/// Enumerate the kinstr_prfcnt performance counter information.
///
/// A first call with a null `info_list_ptr` reports the item size and
/// count; a second call fills the caller-provided list.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KinstrPrfcntEnumInfo {
    /// Performance counter item size in bytes.
    pub info_item_size: u32,
    /// Performance counter item count.
    pub info_item_count: u32,
    /// Pointer to `info_item_count` items.
    pub info_list_ptr: Pointer64<super::kinstr_prfcnt::ItemHeader>,
}

/// Input parameters of [`KinstrPrfcntSetup`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KinstrPrfcntSetupIn {
    /// Number of requests in the requests array.
    pub request_item_count: u32,
    /// Size in bytes of each request in the requests array.
    pub request_item_size: u32,
    /// Pointer to the requests array.
    pub requests_ptr: Pointer64<super::kinstr_prfcnt::RequestItem>,
}

/// Output parameters of [`KinstrPrfcntSetup`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KinstrPrfcntSetupOut {
    /// Size of each item in the metadata array for each sample.
    pub prfcnt_metadata_item_size: u32,
    /// Size in bytes user space should mmap for reading counter samples.
    pub prfcnt_mmap_size_bytes: u32,
}

/// Setup the kinstr_prfcnt counters session.
///
/// The session file descriptor is returned in the ioctl return value; the
/// output members overlay the input members on return.
#[repr(C)]
#[derive(Clone, Copy)]
pub union KinstrPrfcntSetup {
    /// Input parameters.
    pub input: KinstrPrfcntSetupIn,
    /// Output parameters.
    pub output: KinstrPrfcntSetupOut,
}

impl Default for KinstrPrfcntSetup {
    fn default() -> Self {
        KinstrPrfcntSetup {
            input: KinstrPrfcntSetupIn::default(),
        }
    }
}

impl std::fmt::Debug for KinstrPrfcntSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KinstrPrfcntSetup {{ {:?} }}", unsafe { self.input })
    }
}

/// Kbase ioctl interface number.
const IFACE: u8 = 0x80;

/// `KBASE_IOCTL_VERSION_CHECK` (job manager kernels).
pub const VERSION_CHECK_JM: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x0, mem::size_of::<VersionCheck>()) as libc::c_ulong;
/// `KBASE_IOCTL_VERSION_CHECK` (CSF kernels).
pub const VERSION_CHECK_CSF: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x34, mem::size_of::<VersionCheck>()) as libc::c_ulong;
/// `KBASE_IOCTL_SET_FLAGS`.
pub const SET_FLAGS: libc::c_ulong =
    request_code_write!(IFACE, 0x1, mem::size_of::<SetFlags>()) as libc::c_ulong;
/// `KBASE_IOCTL_GET_GPUPROPS`.
pub const GET_GPUPROPS: libc::c_ulong =
    request_code_write!(IFACE, 0x3, mem::size_of::<GetGpuprops>()) as libc::c_ulong;
/// `KBASE_IOCTL_HWCNT_READER_SETUP`.
pub const HWCNT_READER_SETUP: libc::c_ulong =
    request_code_write!(IFACE, 0x8, mem::size_of::<HwcntReaderSetup>()) as libc::c_ulong;
/// `KBASE_IOCTL_KINSTR_PRFCNT_ENUM_INFO`.
pub const KINSTR_PRFCNT_ENUM_INFO: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x38, mem::size_of::<KinstrPrfcntEnumInfo>()) as libc::c_ulong;
/// `KBASE_IOCTL_KINSTR_PRFCNT_SETUP`.
pub const KINSTR_PRFCNT_SETUP: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x39, mem::size_of::<KinstrPrfcntSetup>()) as libc::c_ulong;

/// Issue a version check against a job manager or CSF kernel.
pub fn version_check<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    request: libc::c_ulong,
    args: &mut VersionCheck,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, request, args as *mut _ as *mut libc::c_void) }
}

/// Set kernel context creation flags.
pub fn set_flags<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut SetFlags,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, SET_FLAGS, args as *mut _ as *mut libc::c_void) }
}

/// Probe or fetch the GPU properties buffer.
pub fn get_gpuprops<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut GetGpuprops,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, GET_GPUPROPS, args as *mut _ as *mut libc::c_void) }
}

/// Setup a vinstr reader. Returns the reader file descriptor.
pub fn hwcnt_reader_setup<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut HwcntReaderSetup,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, HWCNT_READER_SETUP, args as *mut _ as *mut libc::c_void) }
}

/// Probe or fetch the kinstr_prfcnt enumeration list.
pub fn kinstr_prfcnt_enum_info<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut KinstrPrfcntEnumInfo,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, KINSTR_PRFCNT_ENUM_INFO, args as *mut _ as *mut libc::c_void) }
}

/// Setup a kinstr_prfcnt session. Returns the session file descriptor.
pub fn kinstr_prfcnt_setup<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut KinstrPrfcntSetup,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, KINSTR_PRFCNT_SETUP, args as *mut _ as *mut libc::c_void) }
}
