//! Mali device driver instance.

use super::DeviceHandle;
use crate::hwcnt::{self, BackendType, BlockExtents, ClockExtents, SampleValuesType};
use crate::ioctl::{kbase, kbase_pre_r21, Pointer64};
use crate::product::{num_exec_engines, NumExecEnginesArgs, ProductId};
use crate::sampler::{self, EnumInfo};
use crate::syscall::SyscallIface;
use crate::version::{IoctlIface, KbaseVersion};
use crate::{Error, Result};
use byteorder::{NativeEndian, ReadBytesExt};
use std::io::Cursor;
use std::os::unix::io::RawFd;

/// Environment variable forcing the counters back-end selection.
const BACKEND_INTERFACE_VAR: &str = "HWCPIPE_BACKEND_INTERFACE";

/// Properties of a physical Mali GPU.
///
/// Do not use the constants to figure out how many counters blocks exist;
/// [`Instance::block_extents`] is authoritative for that.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuConstants {
    /// Raw `GPU_ID` register value.
    pub gpu_id: u64,
    /// The shader core mask.
    pub shader_core_mask: u64,
    /// Number of shader cores.
    pub num_shader_cores: u64,
    /// Number of L2 cache slices.
    pub num_l2_slices: u64,
    /// L2 cache slice size in bytes.
    pub l2_slice_size: u64,
    /// AXI bus width in bits.
    pub axi_bus_width: u64,
    /// Maximum number of execution engines per core, over all cores.
    pub num_exec_engines: u8,
}

/// Raw register values collected from the properties probe.
#[derive(Debug, Clone, Copy, Default)]
struct RawProps {
    gpu_id: u64,
    l2_log2_cache_size: u64,
    num_l2_slices: u64,
    l2_features: u64,
    core_features: u64,
    thread_features: u64,
    num_core_groups: u64,
    core_group_masks: [u64; kbase_pre_r21::MAX_COHERENT_GROUPS],
}

impl RawProps {
    /// Decode a post R21 key/value properties buffer.
    ///
    /// The buffer holds `u32` keys, each tightly followed by a value whose
    /// width is encoded in the key's low two bits. Everything is little
    /// endian; the kernel shares our byte order.
    fn from_buffer(buffer: &[u8]) -> Result<RawProps> {
        let mut props = RawProps {
            num_l2_slices: 1,
            ..Default::default()
        };

        let mut cursor = Cursor::new(buffer);

        while (cursor.position() as usize) < buffer.len() {
            let key = cursor.read_u32::<NativeEndian>()?;
            let prop_id = key >> 2;

            let value = match key & 0x3 {
                0 => cursor.read_u8()? as u64,
                1 => cursor.read_u16::<NativeEndian>()? as u64,
                2 => cursor.read_u32::<NativeEndian>()? as u64,
                _ => cursor.read_u64::<NativeEndian>()?,
            };

            match prop_id {
                kbase::gpuprop::RAW_GPU_ID => props.gpu_id = value,
                kbase::gpuprop::L2_LOG2_CACHE_SIZE => props.l2_log2_cache_size = value,
                kbase::gpuprop::L2_NUM_L2_SLICES => props.num_l2_slices = value,
                kbase::gpuprop::RAW_L2_FEATURES => props.l2_features = value,
                kbase::gpuprop::RAW_CORE_FEATURES => props.core_features = value,
                kbase::gpuprop::RAW_THREAD_FEATURES => props.thread_features = value,
                kbase::gpuprop::COHERENCY_NUM_CORE_GROUPS => props.num_core_groups = value,
                id if (kbase::gpuprop::COHERENCY_GROUP_0..=kbase::gpuprop::COHERENCY_GROUP_15)
                    .contains(&id) =>
                {
                    props.core_group_masks[(id - kbase::gpuprop::COHERENCY_GROUP_0) as usize] =
                        value
                }
                _ => {}
            }
        }

        Ok(props)
    }

    /// Derive the GPU constants and the product id.
    fn decode(&self) -> Result<(GpuConstants, ProductId)> {
        let mut constants = GpuConstants::default();

        constants.gpu_id = self.gpu_id;
        constants.l2_slice_size = 1u64 << self.l2_log2_cache_size;
        constants.num_l2_slices = self.num_l2_slices;
        // log2 of the bus width in bits lives in the register's top byte.
        constants.axi_bus_width = 1u64 << ((self.l2_features & 0xFF00_0000) >> 24);

        for group in 0..self.num_core_groups.min(kbase_pre_r21::MAX_COHERENT_GROUPS as u64) {
            constants.shader_core_mask |= self.core_group_masks[group as usize];
        }
        constants.num_shader_cores = constants.shader_core_mask.count_ones() as u64;

        let product = ProductId::from_raw_gpu_id(constants.gpu_id)?;

        constants.num_exec_engines = num_exec_engines(NumExecEnginesArgs {
            product,
            core_count: constants.num_shader_cores,
            core_features: self.core_features as u32,
            thread_features: self.thread_features as u32,
        })?;

        Ok((constants, product))
    }
}

/// Mali device driver instance.
///
/// An instance queries the kernel version and GPU properties once at
/// creation time, selects the counters back-end, and serves as the anchor
/// the samplers are created from. The [`DeviceHandle`] must outlive it.
#[derive(Debug)]
pub struct Instance<S: SyscallIface = crate::syscall::UnixSyscall> {
    fd: RawFd,
    syscall: S,
    version: KbaseVersion,
    constants: GpuConstants,
    product: ProductId,
    backend_type: BackendType,
    block_extents: BlockExtents,
    clock_extents: Option<ClockExtents>,
    enum_info: Option<EnumInfo>,
}

impl<S: SyscallIface + Clone> Instance<S> {
    /// Create an instance for `handle`.
    ///
    /// The back-end selection honors the `HWCPIPE_BACKEND_INTERFACE`
    /// environment variable.
    pub fn new(handle: &DeviceHandle<S>) -> Result<Instance<S>> {
        let name_override = std::env::var(BACKEND_INTERFACE_VAR).ok();
        Instance::with_backend_override(handle, name_override.as_deref())
    }

    /// Create an instance with an explicit back-end override.
    ///
    /// `None` selects the highest priority discovered back-end.
    pub fn with_backend_override(
        handle: &DeviceHandle<S>,
        name_override: Option<&str>,
    ) -> Result<Instance<S>> {
        let fd = handle.fd();
        let syscall = handle.syscall().clone();

        let version = version_check(&syscall, fd)?;
        set_flags(&syscall, fd, version)?;

        let (constants, product) = if version.iface == IoctlIface::JmPreR21 {
            props_pre_r21(&syscall, fd)?
        } else {
            let buffer = props_post_r21(&syscall, fd)?;
            RawProps::from_buffer(&buffer)?.decode()?
        };

        let available = hwcnt::discover(version, product);
        let backend_type = hwcnt::select(available, name_override)?;

        log::debug!(
            "device instance: {:?} on kernel {}, using the {} back-end",
            product,
            version,
            backend_type
        );

        let mut instance = Instance {
            fd,
            syscall,
            version,
            constants,
            product,
            backend_type,
            block_extents: BlockExtents::default(),
            clock_extents: None,
            enum_info: None,
        };

        instance.init_extents()?;

        Ok(instance)
    }

    /// Initialize block and clock extents for the selected back-end.
    fn init_extents(&mut self) -> Result<()> {
        match self.backend_type {
            BackendType::Vinstr | BackendType::VinstrPreR21 => {
                let num_memory_blocks = if sampler::is_v4_layout(self.product) {
                    1
                } else {
                    self.constants.num_l2_slices as u8
                };

                self.block_extents = BlockExtents::new(
                    [
                        1,
                        1,
                        num_memory_blocks,
                        self.constants.num_shader_cores as u8,
                        0,
                        0,
                    ],
                    64,
                    SampleValuesType::U32,
                );
                // Vinstr predates clock enumeration.
                self.clock_extents = None;
            }
            BackendType::KinstrPrfcnt | BackendType::KinstrPrfcntWa | BackendType::KinstrPrfcntBad => {
                let enum_info = sampler::enum_info(&self.syscall, self.fd)?;

                self.block_extents = sampler::construct_block_extents(&enum_info);
                self.clock_extents = Some(sampler::construct_clock_extents(&enum_info));
                self.enum_info = Some(enum_info);
            }
        }

        Ok(())
    }
}

impl<S: SyscallIface> Instance<S> {
    /// The device file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The syscall interface this instance was created with.
    pub(crate) fn syscall(&self) -> &S {
        &self.syscall
    }

    /// The kernel interface version.
    pub fn kbase_version(&self) -> KbaseVersion {
        self.version
    }

    /// The GPU product.
    pub fn product_id(&self) -> ProductId {
        self.product
    }

    /// The GPU constants.
    pub fn constants(&self) -> &GpuConstants {
        &self.constants
    }

    /// The counters back-end selected for this instance.
    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Block extents the device advertises.
    pub fn block_extents(&self) -> &BlockExtents {
        &self.block_extents
    }

    /// Clock extents, when the kernel interface enumerates clocks.
    pub fn clock_extents(&self) -> Option<&ClockExtents> {
        self.clock_extents.as_ref()
    }

    /// The parsed counters enumeration (kinstr_prfcnt back-ends only).
    pub(crate) fn enum_info(&self) -> Option<EnumInfo> {
        self.enum_info
    }
}

/// Detect the kernel ioctl interface flavor and version.
///
/// Tries the interpretations from oldest to newest: a kernel answering
/// the legacy version check is pre R21; otherwise the post R21 job
/// manager and CSF version checks disambiguate.
fn version_check<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<KbaseVersion> {
    const LEGACY_MIN_VERSION: KbaseVersion = KbaseVersion::new(10, 2, IoctlIface::JmPreR21);

    let mut legacy_args = kbase_pre_r21::VersionCheckArgs::default();
    legacy_args.header = kbase_pre_r21::UkHeader::with_id(kbase_pre_r21::header_id::VERSION_CHECK);

    let _ = kbase_pre_r21::version_check(syscall, fd, &mut legacy_args);
    if legacy_args.is_set() {
        let version = KbaseVersion::new(legacy_args.major, legacy_args.minor, IoctlIface::JmPreR21);
        if version >= LEGACY_MIN_VERSION {
            return Ok(version);
        }
    }

    let mut args = kbase::VersionCheck::default();
    let _ = kbase::version_check(syscall, fd, kbase::VERSION_CHECK_JM, &mut args);
    if args.is_set() {
        return Ok(KbaseVersion::new(args.major, args.minor, IoctlIface::JmPostR21));
    }

    let mut args = kbase::VersionCheck::default();
    let _ = kbase::version_check(syscall, fd, kbase::VERSION_CHECK_CSF, &mut args);
    if args.is_set() {
        return Ok(KbaseVersion::new(args.major, args.minor, IoctlIface::Csf));
    }

    Err(Error::NotSupported("unrecognized kernel interface"))
}

/// Put the kernel context into system monitoring mode.
fn set_flags<S: SyscallIface>(syscall: &S, fd: RawFd, version: KbaseVersion) -> Result<()> {
    const SYSTEM_MONITOR_FLAG_SUBMIT_DISABLED_BIT: u32 = 1;
    const SYSTEM_MONITOR_FLAG: u32 = 1 << SYSTEM_MONITOR_FLAG_SUBMIT_DISABLED_BIT;

    let result = if version.iface == IoctlIface::JmPreR21 {
        let mut args = kbase_pre_r21::SetFlagsArgs::default();
        args.header = kbase_pre_r21::UkHeader::with_id(kbase_pre_r21::header_id::SET_FLAGS);
        args.create_flags = SYSTEM_MONITOR_FLAG;

        kbase_pre_r21::set_flags(syscall, fd, &mut args).map(|_| ())
    } else {
        let mut args = kbase::SetFlags {
            create_flags: SYSTEM_MONITOR_FLAG,
        };

        kbase::set_flags(syscall, fd, &mut args).map(|_| ())
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => match err.errno() {
            // Set_flags fails with EPERM/EINVAL when the context is
            // already initialized, and old kernels report EFAULT.
            Some(nix::errno::Errno::EPERM) | Some(nix::errno::Errno::EINVAL) => Ok(()),
            Some(nix::errno::Errno::EFAULT) if version.iface == IoctlIface::JmPreR21 => Ok(()),
            _ => Err(err),
        },
    }
}

/// Query GPU properties through the legacy fixed structure.
fn props_pre_r21<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<(GpuConstants, ProductId)> {
    let mut args = kbase_pre_r21::UkGpuprops::default();
    args.header = kbase_pre_r21::UkHeader::with_id(kbase_pre_r21::header_id::GET_PROPS);

    kbase_pre_r21::get_gpuprops(syscall, fd, &mut args)?;

    let mut raw = RawProps {
        gpu_id: args.raw_props.gpu_id as u64,
        l2_log2_cache_size: args.l2_props.log2_cache_size as u64,
        num_l2_slices: args.l2_props.num_l2_slices as u64,
        l2_features: args.raw_props.l2_features as u64,
        // No core features in this interface generation.
        core_features: 0,
        thread_features: args.raw_props.thread_features as u64,
        num_core_groups: args.coherency_info.num_core_groups as u64,
        core_group_masks: [0; kbase_pre_r21::MAX_COHERENT_GROUPS],
    };

    for group in 0..kbase_pre_r21::MAX_COHERENT_GROUPS {
        raw.core_group_masks[group] = args.coherency_info.group[group].core_mask;
    }

    raw.decode()
}

/// Query the raw GPU properties buffer from a post R21 kernel.
fn props_post_r21<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<Vec<u8>> {
    let mut args = kbase::GetGpuprops::default();
    let size = kbase::get_gpuprops(syscall, fd, &mut args)?;

    let mut buffer = vec![0u8; size as usize];
    args.size = size as u32;
    args.buffer = Pointer64::from_ptr(buffer.as_ptr());

    kbase::get_gpuprops(syscall, fd, &mut args)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{NativeEndian, WriteBytesExt};

    fn push_prop(buffer: &mut Vec<u8>, prop_id: u32, size_code: u32, value: u64) {
        buffer
            .write_u32::<NativeEndian>((prop_id << 2) | size_code)
            .unwrap();
        match size_code {
            0 => buffer.write_u8(value as u8).unwrap(),
            1 => buffer.write_u16::<NativeEndian>(value as u16).unwrap(),
            2 => buffer.write_u32::<NativeEndian>(value as u32).unwrap(),
            _ => buffer.write_u64::<NativeEndian>(value).unwrap(),
        }
    }

    #[test]
    fn test_props_buffer_decode() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut buffer = Vec::new();

        // A G78 with 8 cores over two core groups and 4 L2 slices.
        push_prop(&mut buffer, kbase::gpuprop::RAW_GPU_ID, 3, (9 << 28) | (2 << 16));
        push_prop(&mut buffer, kbase::gpuprop::L2_LOG2_CACHE_SIZE, 0, 19);
        push_prop(&mut buffer, kbase::gpuprop::L2_NUM_L2_SLICES, 0, 4);
        push_prop(&mut buffer, kbase::gpuprop::RAW_L2_FEATURES, 2, 7 << 24);
        push_prop(&mut buffer, kbase::gpuprop::COHERENCY_NUM_CORE_GROUPS, 0, 2);
        push_prop(&mut buffer, kbase::gpuprop::COHERENCY_GROUP_0, 3, 0x0F);
        push_prop(&mut buffer, kbase::gpuprop::COHERENCY_GROUP_1, 3, 0xF0);
        // An unknown property is skipped over.
        push_prop(&mut buffer, 200, 1, 0xBEEF);

        let raw = RawProps::from_buffer(&buffer).unwrap();
        let (constants, product) = raw.decode().unwrap();

        assert_eq!(product, ProductId::G78);
        assert_eq!(constants.shader_core_mask, 0xFF);
        assert_eq!(constants.num_shader_cores, 8);
        assert_eq!(constants.num_l2_slices, 4);
        assert_eq!(constants.l2_slice_size, 1 << 19);
        assert_eq!(constants.axi_bus_width, 1 << 7);
        assert_eq!(constants.num_exec_engines, 1);
    }

    #[test]
    fn test_props_decode_unknown_product_fails() {
        let mut buffer = Vec::new();
        push_prop(&mut buffer, kbase::gpuprop::RAW_GPU_ID, 3, (5 << 28) | (5 << 16));
        push_prop(&mut buffer, kbase::gpuprop::COHERENCY_NUM_CORE_GROUPS, 0, 1);
        push_prop(&mut buffer, kbase::gpuprop::COHERENCY_GROUP_0, 3, 0x1);

        let raw = RawProps::from_buffer(&buffer).unwrap();
        match raw.decode() {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
