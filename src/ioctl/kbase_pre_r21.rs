//! Pre R21 kbase device ioctl interface.
//!
//! The legacy job manager kernels dispatch on a function id carried in a
//! header union at the start of every argument structure, rather than on
//! the ioctl command number alone.

use crate::syscall::SyscallIface;
use crate::Result;
use nix::libc;
use nix::request_code_readwrite;
use std::mem;
use std::os::unix::io::RawFd;

/// UK function ids.
#[allow(missing_docs)]
pub mod header_id {
    pub const VERSION_CHECK: u32 = 0x0;
    pub const UK_FUNC_ID: u32 = 512;
    pub const HWCNT_READER_SETUP: u32 = UK_FUNC_ID + 36;
    pub const GET_PROPS: u32 = UK_FUNC_ID + 14;
    pub const SET_FLAGS: u32 = UK_FUNC_ID + 18;
}

/// Message header at the start of every UK argument structure.
#[repr(C)]
#[derive(Clone, Copy)]
pub union UkHeader {
    /// Number identifying the UK function to be called.
    pub id: u32,
    /// The return code of the called UK function.
    pub ret: u32,
    /// Ensures 64 bit alignment of this union.
    pub sizer: u64,
}

impl UkHeader {
    /// Construct a header carrying a function id.
    pub fn with_id(id: u32) -> Self {
        let mut header = UkHeader { sizer: 0 };
        header.id = id;
        header
    }
}

impl Default for UkHeader {
    fn default() -> Self {
        UkHeader { sizer: 0 }
    }
}

impl std::fmt::Debug for UkHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UkHeader({:#x})", unsafe { self.id })
    }
}

/// Check version compatibility between kernel and userspace.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCheckArgs {
    /// UK header.
    pub header: UkHeader,
    /// Major version number.
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
}

impl VersionCheckArgs {
    /// True if the kernel filled in a version.
    pub fn is_set(&self) -> bool {
        self.major != 0 || self.minor != 0
    }
}

/// Set kernel context creation flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFlagsArgs {
    /// UK header.
    pub header: UkHeader,
    /// Kernel context creation flags.
    pub create_flags: u32,
    /// Padding.
    pub padding: u32,
}

/// Core properties.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpupropsCore {
    /// Product specific value.
    pub product_id: u32,
    /// Status of the GPU release.
    pub version_status: u16,
    /// Minor release number of the GPU.
    pub minor_revision: u16,
    /// Major release number of the GPU.
    pub major_revision: u16,
    /// Padding.
    pub padding: u16,
    /// Deprecated clock speed field, kept for layout compatibility.
    pub gpu_speed_mhz: u32,
    /// Maximum GPU clock speed.
    pub gpu_freq_khz_max: u32,
    /// Minimum GPU clock speed.
    pub gpu_freq_khz_min: u32,
    /// Size of the shader program counter, in bits.
    pub log2_program_counter_size: u32,
    /// `TEXTURE_FEATURES_x` registers.
    pub texture_features: [u32; 3],
    /// Theoretical maximum memory available to the GPU.
    pub gpu_available_memory_size: u64,
}

/// L2 cache properties.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpupropsL2Cache {
    /// Log2 line size.
    pub log2_line_size: u8,
    /// Log2 cache size.
    pub log2_cache_size: u8,
    /// Number of L2 slices.
    pub num_l2_slices: u8,
    /// Padding.
    pub padding: [u8; 5],
}

/// Tiler properties.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpupropsTiler {
    /// Bin size in bytes.
    pub bin_size_bytes: u32,
    /// Maximum number of active hierarchy levels.
    pub max_active_levels: u32,
}

/// GPU threading system properties.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpupropsThread {
    /// Maximum number of threads per core.
    pub max_threads: u32,
    /// Maximum number of threads per workgroup.
    pub max_workgroup_size: u32,
    /// Maximum number of threads per barrier.
    pub max_barrier_size: u32,
    /// Total size of the register file available per core.
    pub max_registers: u16,
    /// Maximum tasks a core queues before blocking.
    pub max_task_queue: u8,
    /// Maximum allowed thread group split value.
    pub max_thread_group_split: u8,
    /// Implementation technology.
    pub impl_tech: u8,
    /// Padding.
    pub padding: [u8; 7],
}

/// Raw hardware configuration discovery registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpupropsRaw {
    /// `SHADER_PRESENT` register.
    pub shader_present: u64,
    /// `TILER_PRESENT` register.
    pub tiler_present: u64,
    /// `L2_PRESENT` register.
    pub l2_present: u64,
    /// Unused.
    pub unused_1: u64,
    /// `L2_FEATURES` register.
    pub l2_features: u32,
    /// Suspend size.
    pub suspend_size: u32,
    /// `MEM_FEATURES` register.
    pub mem_features: u32,
    /// `MMU_FEATURES` register.
    pub mmu_features: u32,
    /// `AS_PRESENT` register.
    pub as_present: u32,
    /// `JS_PRESENT` register.
    pub js_present: u32,
    /// `JS_FEATURES_x` registers.
    pub js_features: [u32; 16],
    /// `TILER_FEATURES` register.
    pub tiler_features: u32,
    /// `TEXTURE_FEATURES_x` registers.
    pub texture_features: [u32; 3],
    /// `GPU_ID` register.
    pub gpu_id: u32,
    /// `THREAD_MAX_THREADS` register.
    pub thread_max_threads: u32,
    /// `THREAD_MAX_WORKGROUP_SIZE` register.
    pub thread_max_workgroup_size: u32,
    /// `THREAD_MAX_BARRIER_SIZE` register.
    pub thread_max_barrier_size: u32,
    /// `THREAD_FEATURES` register.
    pub thread_features: u32,
    /// Selected coherency mode.
    pub coherency_mode: u32,
}

/// Descriptor for one coherent core group.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CoherentGroup {
    /// Core restriction mask of the group.
    pub core_mask: u64,
    /// Number of cores in the group.
    pub num_cores: u16,
    /// Padding.
    pub padding: [u16; 3],
}

/// Maximum number of coherent groups reported.
pub const MAX_COHERENT_GROUPS: usize = 16;

/// Coherency group information.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CoherentGroupInfo {
    /// Number of groups.
    pub num_groups: u32,
    /// Number of core groups (equal to the number of L2 caches).
    pub num_core_groups: u32,
    /// Coherency features of the memory.
    pub coherency: u32,
    /// Padding.
    pub padding: u32,
    /// Coherent group descriptors.
    pub group: [CoherentGroup; MAX_COHERENT_GROUPS],
}

/// GPU properties probe arguments.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UkGpuprops {
    /// UK header.
    pub header: UkHeader,
    /// Core properties.
    pub core_props: GpupropsCore,
    /// L2 cache properties.
    pub l2_props: GpupropsL2Cache,
    /// Unused, kept for layout compatibility.
    pub unused: u64,
    /// Tiler properties.
    pub tiler_props: GpupropsTiler,
    /// Threading properties.
    pub thread_props: GpupropsThread,
    /// Raw register values.
    pub raw_props: GpupropsRaw,
    /// Coherency group information.
    pub coherency_info: CoherentGroupInfo,
}

/// Hardware counter reader setup arguments.
///
/// The reader file descriptor is returned through the `fd` member.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UkHwcntReaderSetup {
    /// UK header.
    pub header: UkHeader,
    /// Requested number of dumping buffers.
    pub buffer_count: u32,
    /// Counters selection bitmask (job manager).
    pub jm_bm: u32,
    /// Counters selection bitmask (shader).
    pub shader_bm: u32,
    /// Counters selection bitmask (tiler).
    pub tiler_bm: u32,
    /// Counters selection bitmask (MMU/L2).
    pub mmu_l2_bm: u32,
    /// Dumping notification file descriptor.
    pub fd: i32,
}

impl Default for UkHwcntReaderSetup {
    fn default() -> Self {
        UkHwcntReaderSetup {
            header: UkHeader::default(),
            buffer_count: 0,
            jm_bm: 0,
            shader_bm: 0,
            tiler_bm: 0,
            mmu_l2_bm: 0,
            fd: -1,
        }
    }
}

/// Kbase pre R21 ioctl interface number.
const IFACE: u8 = 0x80;

/// `KBASE_FUNC_VERSION_CHECK` command code.
pub const VERSION_CHECK: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x0, mem::size_of::<VersionCheckArgs>()) as libc::c_ulong;
/// `KBASE_FUNC_SET_FLAGS` command code.
pub const SET_FLAGS: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x212, mem::size_of::<SetFlagsArgs>()) as libc::c_ulong;
/// `KBASE_FUNC_GPU_PROPS_REG_DUMP` command code.
pub const GET_GPUPROPS: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x20e, mem::size_of::<UkGpuprops>()) as libc::c_ulong;
/// `KBASE_FUNC_HWCNT_READER_SETUP` command code.
pub const HWCNT_READER_SETUP: libc::c_ulong =
    request_code_readwrite!(IFACE, 0x224, mem::size_of::<UkHwcntReaderSetup>()) as libc::c_ulong;

/// Issue a legacy version check.
pub fn version_check<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut VersionCheckArgs,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, VERSION_CHECK, args as *mut _ as *mut libc::c_void) }
}

/// Set kernel context creation flags.
pub fn set_flags<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut SetFlagsArgs,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, SET_FLAGS, args as *mut _ as *mut libc::c_void) }
}

/// Fetch the fixed GPU properties structure.
pub fn get_gpuprops<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut UkGpuprops,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, GET_GPUPROPS, args as *mut _ as *mut libc::c_void) }
}

/// Setup a vinstr reader through the legacy dispatch.
pub fn hwcnt_reader_setup<S: SyscallIface>(
    syscall: &S,
    fd: RawFd,
    args: &mut UkHwcntReaderSetup,
) -> Result<libc::c_int> {
    unsafe { syscall.ioctl_ptr(fd, HWCNT_READER_SETUP, args as *mut _ as *mut libc::c_void) }
}
