//! Kinstr_prfcnt counters back-end.
//!
//! Unlike vinstr, the kinstr_prfcnt interface describes itself: block
//! counts and counter widths are enumerated by the kernel, and every
//! sample carries a metadata item list describing its own blocks. The
//! item lists are strided arrays whose stride the kernel reports, so they
//! stay parseable when the kernel appends fields.

use super::backend::{
    filter_block_extents, BackendBase, Configuration, SamplerBackend, SamplerMode,
};
use super::guard::{FdGuard, MappedMemory};
use super::poll::wait_for_sample;
use crate::device::Instance;
use crate::hwcnt::{
    BlockExtents, BlockHandle, BlockMetadata, BlockState, BlockType, ClockExtents, CounterValues,
    Features, PrfcntSet, Reader, SampleFlags, SampleHandle, SampleMetadata, SampleValuesType,
    NUM_BLOCK_TYPES,
};
use crate::ioctl::kinstr_prfcnt as ioctl;
use crate::ioctl::{kbase, Pointer64};
use crate::syscall::SyscallIface;
use crate::version::{IoctlIface, KbaseVersion};
use crate::{Error, Result};
use std::os::unix::io::RawFd;

/// Maximum number of shader cores a core mask can name.
pub(crate) const MAX_SHADER_CORES: usize = 64;

/// Parsed counters enumeration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumInfo {
    /// Counter set served by this kernel.
    pub set: PrfcntSet,
    /// Number of counter values per block.
    pub num_values: u16,
    /// Number of block instances per block type.
    pub num_blocks_of_type: [u8; NUM_BLOCK_TYPES],
    /// True if the GPU reports the top clock cycle counter.
    pub has_cycles_top: bool,
    /// True if the GPU reports the shader cores cycle counter.
    pub has_cycles_sc: bool,
}

/// Block extents described by the enumeration.
pub(crate) fn construct_block_extents(enum_info: &EnumInfo) -> BlockExtents {
    BlockExtents::new(
        enum_info.num_blocks_of_type,
        enum_info.num_values,
        SampleValuesType::U64,
    )
}

/// Clock extents described by the enumeration.
pub(crate) fn construct_clock_extents(enum_info: &EnumInfo) -> ClockExtents {
    ClockExtents {
        has_gpu_cycle: enum_info.has_cycles_top,
        has_sc_cycle: enum_info.has_cycles_sc,
    }
}

fn convert_block_type(raw: u8) -> Option<BlockType> {
    match raw {
        ioctl::raw_block_type::FE => Some(BlockType::Fe),
        ioctl::raw_block_type::TILER => Some(BlockType::Tiler),
        ioctl::raw_block_type::MEMORY => Some(BlockType::Memory),
        ioctl::raw_block_type::SHADER_CORE => Some(BlockType::Core),
        ioctl::raw_block_type::FIRMWARE => Some(BlockType::Firmware),
        ioctl::raw_block_type::CSG => Some(BlockType::Csg),
        _ => None,
    }
}

fn convert_block_type_to_raw(block_type: BlockType) -> u8 {
    match block_type {
        BlockType::Fe => ioctl::raw_block_type::FE,
        BlockType::Tiler => ioctl::raw_block_type::TILER,
        BlockType::Memory => ioctl::raw_block_type::MEMORY,
        BlockType::Core => ioctl::raw_block_type::SHADER_CORE,
        BlockType::Firmware => ioctl::raw_block_type::FIRMWARE,
        BlockType::Csg => ioctl::raw_block_type::CSG,
    }
}

fn convert_set(raw: u8) -> PrfcntSet {
    match raw {
        ioctl::raw_prfcnt_set::SECONDARY => PrfcntSet::Secondary,
        ioctl::raw_prfcnt_set::TERTIARY => PrfcntSet::Tertiary,
        _ => PrfcntSet::Primary,
    }
}

fn convert_set_to_raw(set: PrfcntSet) -> u8 {
    match set {
        PrfcntSet::Primary => ioctl::raw_prfcnt_set::PRIMARY,
        PrfcntSet::Secondary => ioctl::raw_prfcnt_set::SECONDARY,
        PrfcntSet::Tertiary => ioctl::raw_prfcnt_set::TERTIARY,
    }
}

fn convert_block_state(raw: u32) -> BlockState {
    BlockState {
        on: raw & ioctl::block_state::ON != 0,
        off: raw & ioctl::block_state::OFF != 0,
        available: raw & ioctl::block_state::AVAILABLE != 0,
        unavailable: raw & ioctl::block_state::UNAVAILABLE != 0,
        normal: raw & ioctl::block_state::NORMAL_MODE != 0,
        protected_mode: raw & ioctl::block_state::PROTECTED_MODE != 0,
    }
}

fn convert_sample_flags(raw: u32) -> SampleFlags {
    SampleFlags {
        stretched: raw & ioctl::sample_flag::OVERFLOW != 0,
        error: raw & ioctl::sample_flag::ERROR != 0,
    }
}

/// Split a 128 bit counters enable map into the wire `[u64; 2]` form.
pub(crate) fn convert_enable_map(enable_map: u128) -> [u64; 2] {
    [enable_map as u64, (enable_map >> 64) as u64]
}

/// Read a `Copy` item out of a strided item list.
///
/// The caller guarantees `offset .. offset + size_of::<T>()` lies inside
/// `buffer`; items may be unaligned relative to the vector allocation.
fn read_item<T: Copy>(buffer: &[u8], offset: usize) -> T {
    debug_assert!(offset + std::mem::size_of::<T>() <= buffer.len());

    unsafe { std::ptr::read_unaligned(buffer.as_ptr().add(offset) as *const T) }
}

/// Parse the enumeration item list.
///
/// The list must carry mutually consistent block descriptors, a mode and
/// an enable request descriptor supporting our interface version, one
/// sample info descriptor, and a sentinel.
pub(crate) fn parse_enum_items(buffer: &[u8], item_size: usize) -> Result<EnumInfo> {
    debug_assert!(item_size >= std::mem::size_of::<ioctl::EnumItemBlock>());

    let mut result = EnumInfo::default();
    let mut parsed_blocks = [false; NUM_BLOCK_TYPES];
    let mut any_block_parsed = false;
    let mut parsed_mode_request = false;
    let mut parsed_enable_request = false;
    let mut parsed_sample_info = false;
    let mut parsed_sentinel = false;

    let num_items = buffer.len() / item_size;

    for item in 0..num_items {
        if parsed_sentinel {
            return Err(Error::Protocol("enumeration items after the sentinel"));
        }

        let offset = item * item_size;
        let header: ioctl::ItemHeader = read_item(buffer, offset);

        match header.item_type {
            ioctl::item_type::ENUM_BLOCK => {
                let block: ioctl::EnumItemBlock = read_item(buffer, offset);

                if block.num_values == 0 && block.num_instances == 0 {
                    parsed_sentinel = true;
                    continue;
                }

                if !any_block_parsed {
                    result.set = convert_set(block.set);
                    result.num_values = block.num_values;
                    any_block_parsed = true;
                }

                // All blocks must agree on the set and the value count.
                if result.set != convert_set(block.set) {
                    return Err(Error::Protocol("blocks disagree on the counter set"));
                }
                if result.num_values != block.num_values {
                    return Err(Error::Protocol("blocks disagree on the value count"));
                }
                if result.num_values > 128 {
                    return Err(Error::Protocol("counters per block above the ceiling"));
                }

                let block_type = match convert_block_type(block.block_type) {
                    Some(block_type) => block_type,
                    // Ignore block types newer than this crate.
                    None => continue,
                };

                if parsed_blocks[block_type.index()] {
                    return Err(Error::Protocol("duplicate block type enumerated"));
                }
                if block.num_instances > u8::max_value() as u16 {
                    return Err(Error::Protocol("block instance count out of range"));
                }

                parsed_blocks[block_type.index()] = true;
                result.num_blocks_of_type[block_type.index()] = block.num_instances as u8;
            }
            ioctl::item_type::ENUM_REQUEST => {
                let request: ioctl::EnumItemRequest = read_item(buffer, offset);

                let parsed = match request.request_item_type {
                    ioctl::enum_request_type::MODE => &mut parsed_mode_request,
                    ioctl::enum_request_type::ENABLE => &mut parsed_enable_request,
                    // Ignore requests newer than this crate.
                    _ => continue,
                };

                if request.versions_mask & (1 << ioctl::API_VERSION) == 0 {
                    return Err(Error::NotSupported(
                        "kernel does not serve our interface version",
                    ));
                }

                if *parsed {
                    return Err(Error::Protocol("duplicate request enumerated"));
                }
                *parsed = true;
            }
            ioctl::item_type::ENUM_SAMPLE_INFO => {
                let sample_info: ioctl::EnumItemSampleInfo = read_item(buffer, offset);

                if parsed_sample_info {
                    return Err(Error::Protocol("duplicate sample info enumerated"));
                }
                if sample_info.num_clock_domains > ioctl::MAX_REPORTED_DOMAINS as u32 {
                    return Err(Error::Protocol("clock domain count out of range"));
                }

                result.has_cycles_top = sample_info.num_clock_domains >= 1;
                result.has_cycles_sc = sample_info.num_clock_domains >= 2;

                parsed_sample_info = true;
            }
            _ => {}
        }
    }

    if !parsed_mode_request || !parsed_enable_request {
        return Err(Error::Protocol("request enumeration incomplete"));
    }
    if !parsed_sample_info || !parsed_sentinel {
        return Err(Error::Protocol("enumeration incomplete"));
    }

    Ok(result)
}

/// Fetch and parse the counters enumeration of a device.
pub(crate) fn enum_info<S: SyscallIface>(syscall: &S, device_fd: RawFd) -> Result<EnumInfo> {
    let mut args = kbase::KinstrPrfcntEnumInfo::default();
    kbase::kinstr_prfcnt_enum_info(syscall, device_fd, &mut args)?;

    let item_size = args.info_item_size as usize;
    let mut buffer = vec![0u8; item_size * args.info_item_count as usize];
    args.info_list_ptr = Pointer64::from_ptr(buffer.as_ptr() as *const ioctl::ItemHeader);

    kbase::kinstr_prfcnt_enum_info(syscall, device_fd, &mut args)?;

    if log::log_enabled!(log::Level::Trace) {
        log::trace!("enum info items:\n{}", crate::util::hexdump(&buffer));
    }

    parse_enum_items(&buffer, item_size)
}

/// Shader core block index remapper.
///
/// Kernels in the workaround window set a shader core block's index to the
/// physical core number, so a sparse core mask yields non-contiguous
/// indices. This re-enumerates them contiguously.
#[derive(Debug, Clone)]
pub(crate) struct BlockIndexRemap {
    map: [u8; MAX_SHADER_CORES],
}

/// Invalid index marker.
const INVALID_INDEX: u8 = u8::max_value();

impl BlockIndexRemap {
    pub(crate) fn new(sc_mask: u64) -> Self {
        let mut map = [INVALID_INDEX; MAX_SHADER_CORES];
        let mut block_index = 0u8;

        for core in 0..MAX_SHADER_CORES {
            if sc_mask & (1u64 << core) != 0 {
                map[core] = block_index;
                block_index += 1;
            }
        }

        BlockIndexRemap { map }
    }

    /// Remap a block index reported by the kernel.
    pub(crate) fn remap(&self, block_type: BlockType, index: u8) -> Result<u8> {
        if block_type != BlockType::Core {
            return Ok(index);
        }

        if index as usize >= self.map.len() || self.map[index as usize] == INVALID_INDEX {
            return Err(Error::Protocol("shader core index outside the core mask"));
        }

        Ok(self.map[index as usize])
    }
}

/// Validating parser for one sample's metadata item list.
struct MetadataParser<'a> {
    extents: &'a BlockExtents,
    remap: Option<&'a BlockIndexRemap>,
    mapping_size: usize,
    result: SampleMetadata,
    num_blocks_of_type: [u8; NUM_BLOCK_TYPES],
    num_blocks: u8,
    sample_parsed: bool,
    clock_parsed: bool,
}

impl<'a> MetadataParser<'a> {
    fn new(
        extents: &'a BlockExtents,
        remap: Option<&'a BlockIndexRemap>,
        mapping_size: usize,
    ) -> Self {
        MetadataParser {
            extents,
            remap,
            mapping_size,
            result: SampleMetadata::default(),
            num_blocks_of_type: [0; NUM_BLOCK_TYPES],
            num_blocks: 0,
            sample_parsed: false,
            clock_parsed: false,
        }
    }

    fn on_sample(&mut self, item: &ioctl::MetadataItemSample) -> Result<()> {
        if self.sample_parsed {
            return Err(Error::Protocol("duplicate sample metadata item"));
        }

        self.result.user_data = item.user_data;
        self.result.flags = convert_sample_flags(item.flags);
        self.result.sample_nr = item.seq;
        self.result.timestamp_ns_begin = item.timestamp_start;
        self.result.timestamp_ns_end = item.timestamp_stop;

        self.sample_parsed = true;
        Ok(())
    }

    fn on_clock(&mut self, item: &ioctl::MetadataItemClock) -> Result<()> {
        if self.clock_parsed {
            return Err(Error::Protocol("duplicate clock metadata item"));
        }

        if item.num_domains >= 1 {
            self.result.gpu_cycle = item.cycles[0];
            self.result.sc_cycle = item.cycles[0];
        }
        if item.num_domains >= 2 {
            self.result.sc_cycle = item.cycles[1];
        }

        self.clock_parsed = true;
        Ok(())
    }

    fn on_block(&mut self, item: &ioctl::MetadataItemBlock) -> Result<()> {
        let block_type = convert_block_type(item.block_type)
            .ok_or(Error::Protocol("unknown block type in sample metadata"))?;

        let index = match self.remap {
            Some(remap) => remap.remap(block_type, item.block_idx)?,
            None => item.block_idx,
        };

        // Block indices of one type must be contiguous and in order.
        let count = &mut self.num_blocks_of_type[block_type.index()];
        if *count != index {
            return Err(Error::Protocol("block indices out of order"));
        }

        *count += 1;
        if *count > self.extents.num_blocks_of_type(block_type) {
            return Err(Error::Protocol("more blocks than the extents advertise"));
        }

        let values_len =
            self.extents.counters_per_block() as usize * self.extents.values_type().width();
        if item.values_offset as usize + values_len > self.mapping_size {
            return Err(Error::Protocol("block values outside the mapping"));
        }

        self.num_blocks += 1;
        Ok(())
    }

    fn finish(self) -> Result<SampleMetadata> {
        if !self.sample_parsed || !self.clock_parsed {
            return Err(Error::Protocol("sample metadata incomplete"));
        }

        if self.num_blocks != self.extents.num_blocks() {
            return Err(Error::Protocol("fewer blocks than the extents advertise"));
        }

        Ok(self.result)
    }
}

/// Init features from the enumeration and the kernel version.
fn init_features(enum_info: &EnumInfo, version: KbaseVersion) -> Features {
    const MIN_BLOCK_STATE_JM: KbaseVersion = KbaseVersion::new(11, 41, IoctlIface::JmPostR21);
    const MIN_BLOCK_STATE_CSF: KbaseVersion = KbaseVersion::new(1, 23, IoctlIface::Csf);

    let mut result = Features::default();

    match version.iface {
        IoctlIface::Csf if version >= MIN_BLOCK_STATE_CSF => {
            result.has_power_states = true;
            result.has_protection_states = true;
        }
        IoctlIface::JmPostR21 if version >= MIN_BLOCK_STATE_JM => {
            result.has_power_states = true;
            result.has_vm_states = true;
        }
        _ => {}
    }

    result.has_gpu_cycle = enum_info.has_cycles_top;
    result.has_stretched_flag = true;
    result.overflow_behavior_defined = true;

    result
}

/// Counters back-end over the kinstr_prfcnt kernel ioctls.
pub struct KinstrPrfcntBackend<S: SyscallIface + Clone> {
    base: BackendBase<S>,
    /// Kernel-reported stride of the sample metadata items.
    metadata_item_size: usize,
    /// Shader core index remap, for kernels in the workaround window.
    remap: Option<BlockIndexRemap>,
    /// True while a sampling session is running.
    active: bool,
}

impl<S: SyscallIface + Clone> std::fmt::Debug for KinstrPrfcntBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinstrPrfcntBackend")
            .field("fd", &self.base.fd.get())
            .field("mode", &self.base.mode())
            .field("active", &self.active)
            .finish()
    }
}

impl<S: SyscallIface + Clone> KinstrPrfcntBackend<S> {
    /// Create a kinstr_prfcnt back-end for `instance`.
    ///
    /// `remap` is provided by the workaround wrapper when the kernel
    /// reports physical shader core numbers as block indices.
    pub(crate) fn create(
        instance: &Instance<S>,
        period_ns: u64,
        configs: &[Configuration],
        remap: Option<BlockIndexRemap>,
    ) -> Result<KinstrPrfcntBackend<S>> {
        let syscall = instance.syscall().clone();

        let extents = filter_block_extents(instance.block_extents(), configs)?;

        let enum_info = instance
            .enum_info()
            .ok_or(Error::NotSupported("no counters enumeration on this kernel"))?;

        // Mode and per-block enables, terminated by a sentinel.
        let mut requests = Vec::with_capacity(configs.len() + 2);
        requests.push(ioctl::RequestItem::mode(period_ns));
        for config in configs {
            requests.push(ioctl::RequestItem::enable(
                convert_block_type_to_raw(config.block_type),
                convert_set_to_raw(config.set),
                convert_enable_map(config.enable_map),
            ));
        }
        requests.push(ioctl::RequestItem::sentinel());

        let mut setup_args = kbase::KinstrPrfcntSetup::default();
        setup_args.input = kbase::KinstrPrfcntSetupIn {
            request_item_count: requests.len() as u32,
            request_item_size: std::mem::size_of::<ioctl::RequestItem>() as u32,
            requests_ptr: Pointer64::from_ptr(requests.as_ptr()),
        };

        let session_fd = kbase::kinstr_prfcnt_setup(&syscall, instance.fd(), &mut setup_args)?;
        let output = unsafe { setup_args.output };

        let fd = FdGuard::new(session_fd, syscall.clone());
        let memory = MappedMemory::map(
            fd.get(),
            output.prfcnt_mmap_size_bytes as usize,
            syscall.clone(),
        )?;

        log::debug!(
            "kinstr_prfcnt session up: {} byte mapping, {} byte metadata items",
            output.prfcnt_mmap_size_bytes,
            output.prfcnt_metadata_item_size
        );

        Ok(KinstrPrfcntBackend {
            base: BackendBase {
                fd,
                period_ns,
                features: init_features(&enum_info, instance.kbase_version()),
                extents,
                memory,
                syscall,
            },
            metadata_item_size: output.prfcnt_metadata_item_size as usize,
            remap,
            active: false,
        })
    }
}

impl<S: SyscallIface + Clone> KinstrPrfcntBackend<S> {
    /// Sampling mode selected at creation time.
    pub(crate) fn mode(&self) -> SamplerMode {
        self.base.mode()
    }

    fn issue_command(&self, cmd: u16, user_data: u64) -> Result<()> {
        ioctl::issue_command(&self.base.syscall, self.base.fd.get(), cmd, user_data)
    }

    /// Byte range of the mapping holding one sample's metadata items.
    fn metadata_buffer(&self, access: &ioctl::SampleAccess) -> &[u8] {
        let offset = access.sample_metadata_ptr.offset() as usize;
        debug_assert!(offset <= self.base.memory.size());

        // The mapping outlives `self`; the kernel does not recycle the
        // sample until it is put back.
        unsafe {
            std::slice::from_raw_parts(
                self.base.memory.data().add(offset),
                self.base.memory.size() - offset,
            )
        }
    }
}

impl<S: SyscallIface + Clone> SamplerBackend for KinstrPrfcntBackend<S> {
    fn start(&mut self, user_data: u64) -> Result<()> {
        if self.active {
            return Ok(());
        }

        self.issue_command(ioctl::control_cmd_code::START, user_data)?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self, user_data: u64) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        // The kernel takes the implicit final sample synchronously.
        self.issue_command(ioctl::control_cmd_code::STOP, user_data)?;
        self.active = false;
        Ok(())
    }

    fn request_sample(&mut self, user_data: u64) -> Result<()> {
        if self.base.mode() != SamplerMode::Manual {
            return Err(Error::NotSupported(
                "manual samples of a periodic back-end",
            ));
        }

        self.issue_command(ioctl::control_cmd_code::SAMPLE_SYNC, user_data)
    }

    fn reader(&self) -> &dyn Reader {
        self
    }

    fn reader_mut(&mut self) -> &mut dyn Reader {
        self
    }
}

impl<S: SyscallIface + Clone> Reader for KinstrPrfcntBackend<S> {
    fn fd(&self) -> RawFd {
        self.base.fd.get()
    }

    fn features(&self) -> &Features {
        &self.base.features
    }

    fn block_extents(&self) -> &BlockExtents {
        &self.base.extents
    }

    fn get_sample(&mut self) -> Result<(SampleMetadata, SampleHandle)> {
        wait_for_sample(&self.base.syscall, self.base.fd.get())?;

        let access = ioctl::get_sample(&self.base.syscall, self.base.fd.get())?;
        let handle = SampleHandle::KinstrPrfcnt(access);

        let metadata = {
            let buffer = self.metadata_buffer(&access);
            let item_size = self.metadata_item_size;

            let mut parser = MetadataParser::new(
                &self.base.extents,
                self.remap.as_ref(),
                self.base.memory.size(),
            );

            // One sample item, one clock item, the blocks, one sentinel.
            let expected_items = self.base.extents.num_blocks() as usize + 3;

            let parse = || -> Result<SampleMetadata> {
                for item in 0..expected_items {
                    let offset = item * item_size;
                    let header: ioctl::ItemHeader = read_item(buffer, offset);

                    match header.item_type {
                        ioctl::item_type::METADATA_SAMPLE => {
                            parser.on_sample(&read_item(buffer, offset))?
                        }
                        ioctl::item_type::METADATA_CLOCK => {
                            parser.on_clock(&read_item(buffer, offset))?
                        }
                        ioctl::item_type::METADATA_BLOCK => {
                            parser.on_block(&read_item(buffer, offset))?
                        }
                        ioctl::item_type::NONE => break,
                        _ => return Err(Error::Protocol("unknown metadata item type")),
                    }
                }

                parser.finish()
            };

            parse()
        };

        // Hand invalid samples straight back to the kernel.
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(err) => {
                let _ = self.put_sample(handle);
                return Err(err);
            }
        };

        Ok((metadata, handle))
    }

    fn next<'a>(
        &'a self,
        sample: &SampleHandle,
        block: &mut BlockHandle,
    ) -> Option<BlockMetadata<'a>> {
        let access = match sample {
            SampleHandle::KinstrPrfcnt(access) => access,
            _ => return None,
        };

        let mut item = match *block {
            BlockHandle::Start => 0,
            BlockHandle::KinstrPrfcnt(item) => item,
            _ => return None,
        };

        let buffer = self.metadata_buffer(access);
        let item_size = self.metadata_item_size;

        loop {
            let offset = item * item_size;
            if offset + item_size > buffer.len() {
                return None;
            }

            let header: ioctl::ItemHeader = read_item(buffer, offset);
            item += 1;

            match header.item_type {
                ioctl::item_type::METADATA_BLOCK => {
                    let raw: ioctl::MetadataItemBlock = read_item(buffer, offset);

                    let block_type = convert_block_type(raw.block_type)?;
                    let index = match self.remap.as_ref() {
                        Some(remap) => remap.remap(block_type, raw.block_idx).ok()?,
                        None => raw.block_idx,
                    };

                    *block = BlockHandle::KinstrPrfcnt(item);

                    let values_len = self.base.extents.counters_per_block() as usize
                        * self.base.extents.values_type().width();
                    let values_offset = raw.values_offset as usize;
                    if values_offset + values_len > self.base.memory.size() {
                        return None;
                    }

                    let data = unsafe {
                        std::slice::from_raw_parts(
                            self.base.memory.data().add(values_offset),
                            values_len,
                        )
                    };

                    return Some(BlockMetadata {
                        block_type,
                        index,
                        set: convert_set(raw.set),
                        state: convert_block_state(raw.block_state),
                        values: CounterValues::new(data, self.base.extents.values_type()),
                    });
                }
                ioctl::item_type::NONE => return None,
                _ => continue,
            }
        }
    }

    fn put_sample(&mut self, sample: SampleHandle) -> Result<()> {
        let access = match sample {
            SampleHandle::KinstrPrfcnt(access) => access,
            _ => return Err(Error::InvalidArgument("foreign sample handle")),
        };

        ioctl::put_sample(&self.base.syscall, self.base.fd.get(), access)
    }

    fn discard(&mut self) -> Result<()> {
        self.issue_command(ioctl::control_cmd_code::DISCARD, 0)
    }
}

impl<S: SyscallIface + Clone> Drop for KinstrPrfcntBackend<S> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.issue_command(ioctl::control_cmd_code::STOP, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::libc;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    const ITEM_SIZE: usize = 48;

    fn write_item<T: Copy>(buffer: &mut [u8], index: usize, item: T) {
        let offset = index * ITEM_SIZE;
        assert!(offset + std::mem::size_of::<T>() <= buffer.len());

        unsafe {
            std::ptr::copy_nonoverlapping(
                &item as *const T as *const u8,
                buffer.as_mut_ptr().add(offset),
                std::mem::size_of::<T>(),
            );
        }
    }

    fn enum_block(block_type: u8, num_instances: u16, num_values: u16) -> ioctl::EnumItemBlock {
        ioctl::EnumItemBlock {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::ENUM_BLOCK,
                item_version: 0,
            },
            block_type,
            num_instances,
            num_values,
            counter_mask: [u64::max_value(); 2],
            ..Default::default()
        }
    }

    fn enum_request(request_item_type: u16) -> ioctl::EnumItemRequest {
        ioctl::EnumItemRequest {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::ENUM_REQUEST,
                item_version: 0,
            },
            request_item_type,
            versions_mask: 1 << ioctl::API_VERSION,
            ..Default::default()
        }
    }

    fn enum_sample_info(num_clock_domains: u32) -> ioctl::EnumItemSampleInfo {
        ioctl::EnumItemSampleInfo {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::ENUM_SAMPLE_INFO,
                item_version: 0,
            },
            num_clock_domains,
            ..Default::default()
        }
    }

    fn valid_enum_buffer() -> Vec<u8> {
        let mut buffer = vec![0u8; 8 * ITEM_SIZE];

        write_item(&mut buffer, 0, enum_block(ioctl::raw_block_type::FE, 1, 64));
        write_item(&mut buffer, 1, enum_block(ioctl::raw_block_type::TILER, 1, 64));
        write_item(&mut buffer, 2, enum_block(ioctl::raw_block_type::MEMORY, 2, 64));
        write_item(
            &mut buffer,
            3,
            enum_block(ioctl::raw_block_type::SHADER_CORE, 4, 64),
        );
        write_item(&mut buffer, 4, enum_request(ioctl::enum_request_type::MODE));
        write_item(&mut buffer, 5, enum_request(ioctl::enum_request_type::ENABLE));
        write_item(&mut buffer, 6, enum_sample_info(2));
        write_item(&mut buffer, 7, enum_block(ioctl::raw_block_type::FE, 0, 0));

        buffer
    }

    #[test]
    fn test_parse_enum_items() {
        let info = parse_enum_items(&valid_enum_buffer(), ITEM_SIZE).unwrap();

        assert_eq!(info.num_values, 64);
        assert_eq!(info.num_blocks_of_type, [1, 1, 2, 4, 0, 0]);
        assert_eq!(info.set, PrfcntSet::Primary);
        assert!(info.has_cycles_top);
        assert!(info.has_cycles_sc);

        let extents = construct_block_extents(&info);
        assert_eq!(extents.num_blocks(), 8);
        assert_eq!(extents.values_type(), SampleValuesType::U64);

        let clocks = construct_clock_extents(&info);
        assert!(clocks.has_gpu_cycle);
        assert!(clocks.has_sc_cycle);
    }

    #[test]
    fn test_parse_enum_rejects_duplicate_blocks() {
        let mut buffer = valid_enum_buffer();
        write_item(&mut buffer, 1, enum_block(ioctl::raw_block_type::FE, 1, 64));

        match parse_enum_items(&buffer, ITEM_SIZE) {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_enum_rejects_disagreeing_value_counts() {
        let mut buffer = valid_enum_buffer();
        write_item(&mut buffer, 1, enum_block(ioctl::raw_block_type::TILER, 1, 128));

        match parse_enum_items(&buffer, ITEM_SIZE) {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_enum_rejects_missing_sentinel() {
        let buffer = valid_enum_buffer();
        // Cut the buffer before the sentinel item.
        match parse_enum_items(&buffer[..7 * ITEM_SIZE], ITEM_SIZE) {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_enum_rejects_unsupported_version() {
        let mut buffer = valid_enum_buffer();
        let mut request = enum_request(ioctl::enum_request_type::MODE);
        request.versions_mask = 1 << 5;
        write_item(&mut buffer, 4, request);

        match parse_enum_items(&buffer, ITEM_SIZE) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_block_index_remap() {
        let remap = BlockIndexRemap::new(0b1011);

        assert_eq!(remap.remap(BlockType::Core, 0).unwrap(), 0);
        assert_eq!(remap.remap(BlockType::Core, 1).unwrap(), 1);
        assert_eq!(remap.remap(BlockType::Core, 3).unwrap(), 2);
        assert!(remap.remap(BlockType::Core, 2).is_err());

        // Other block types pass through.
        assert_eq!(remap.remap(BlockType::Memory, 2).unwrap(), 2);
    }

    #[test]
    fn test_enable_map_split() {
        assert_eq!(convert_enable_map(0), [0, 0]);
        assert_eq!(convert_enable_map(1), [1, 0]);
        assert_eq!(convert_enable_map(1u128 << 64), [0, 1]);
        assert_eq!(
            convert_enable_map(u128::max_value()),
            [u64::max_value(), u64::max_value()]
        );
    }

    /// Fake syscall interface serving a canned kinstr_prfcnt sample.
    #[derive(Debug, Clone, Default)]
    struct FakeKinstrSyscall {
        puts: Rc<RefCell<u32>>,
    }

    impl SyscallIface for FakeKinstrSyscall {
        fn open(&self, _path: &Path) -> Result<RawFd> {
            Err(Error::NotSupported("fake"))
        }

        fn close(&self, _fd: RawFd) -> Result<()> {
            Ok(())
        }

        fn ioctl_val(
            &self,
            _fd: RawFd,
            _request: libc::c_ulong,
            _arg: libc::c_ulong,
        ) -> Result<libc::c_int> {
            Ok(0)
        }

        unsafe fn ioctl_ptr(
            &self,
            _fd: RawFd,
            request: libc::c_ulong,
            arg: *mut libc::c_void,
        ) -> Result<libc::c_int> {
            if request == ioctl::GET_SAMPLE {
                let access = arg as *mut ioctl::SampleAccess;
                (*access).sequence = 1;
                (*access).sample_metadata_ptr = crate::ioctl::OffsetPointer::new(0);
            }
            if request == ioctl::PUT_SAMPLE {
                *self.puts.borrow_mut() += 1;
            }
            Ok(0)
        }

        fn mmap_ro(&self, _fd: RawFd, _len: usize) -> Result<*mut libc::c_void> {
            Err(Error::NotSupported("fake"))
        }

        fn munmap(&self, _addr: *mut libc::c_void, _len: usize) -> Result<()> {
            Ok(())
        }

        fn poll_read(&self, _fd: RawFd, _timeout_ms: libc::c_int) -> Result<bool> {
            Ok(true)
        }
    }

    fn metadata_sample_item() -> ioctl::MetadataItemSample {
        ioctl::MetadataItemSample {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::METADATA_SAMPLE,
                item_version: 0,
            },
            timestamp_start: 100,
            timestamp_stop: 200,
            seq: 7,
            user_data: 42,
            flags: ioctl::sample_flag::OVERFLOW,
            ..Default::default()
        }
    }

    fn metadata_clock_item() -> ioctl::MetadataItemClock {
        let mut item = ioctl::MetadataItemClock {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::METADATA_CLOCK,
                item_version: 0,
            },
            num_domains: 2,
            ..Default::default()
        };
        item.cycles[0] = 1000;
        item.cycles[1] = 2000;
        item
    }

    fn metadata_block_item(
        block_type: u8,
        block_idx: u8,
        values_offset: u32,
    ) -> ioctl::MetadataItemBlock {
        ioctl::MetadataItemBlock {
            hdr: ioctl::ItemHeader {
                item_type: ioctl::item_type::METADATA_BLOCK,
                item_version: 0,
            },
            block_type,
            block_idx,
            set: ioctl::raw_prfcnt_set::PRIMARY,
            block_state: ioctl::block_state::ON,
            values_offset,
            ..Default::default()
        }
    }

    /// Build a mapping holding one sample: metadata items first, then the
    /// block values arrays.
    fn sample_mapping(num_counters: usize) -> Vec<u8> {
        let values_base = 8 * ITEM_SIZE;
        let values_len = num_counters * 8;
        let mut buffer = vec![0u8; values_base + 2 * values_len];

        write_item(&mut buffer, 0, metadata_sample_item());
        write_item(&mut buffer, 1, metadata_clock_item());
        write_item(
            &mut buffer,
            2,
            metadata_block_item(ioctl::raw_block_type::FE, 0, values_base as u32),
        );
        write_item(
            &mut buffer,
            3,
            metadata_block_item(
                ioctl::raw_block_type::TILER,
                0,
                (values_base + values_len) as u32,
            ),
        );
        // Sentinel at item 4 is all zeroes already.

        // Fill the two value arrays with recognizable numbers.
        for counter in 0..num_counters {
            let fe = 10 + counter as u64;
            let tiler = 1000 + counter as u64;
            buffer[values_base + counter * 8..values_base + (counter + 1) * 8]
                .copy_from_slice(&fe.to_ne_bytes());
            buffer[values_base + values_len + counter * 8
                ..values_base + values_len + (counter + 1) * 8]
                .copy_from_slice(&tiler.to_ne_bytes());
        }

        buffer
    }

    fn make_backend(
        period_ns: u64,
        mapping: &mut Vec<u8>,
        syscall: FakeKinstrSyscall,
    ) -> KinstrPrfcntBackend<FakeKinstrSyscall> {
        let extents = BlockExtents::new([1, 1, 0, 0, 0, 0], 64, SampleValuesType::U64);

        KinstrPrfcntBackend {
            base: BackendBase {
                fd: FdGuard::new(11, syscall.clone()),
                period_ns,
                features: Features::default(),
                extents,
                memory: MappedMemory::from_raw(
                    mapping.as_mut_ptr() as *mut libc::c_void,
                    mapping.len(),
                    syscall.clone(),
                ),
                syscall,
            },
            metadata_item_size: ITEM_SIZE,
            remap: None,
            active: false,
        }
    }

    #[test]
    fn test_get_sample_decodes_metadata() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut mapping = sample_mapping(64);
        let mut backend = make_backend(0, &mut mapping, FakeKinstrSyscall::default());

        let (metadata, handle) = backend.get_sample().unwrap();

        assert_eq!(metadata.user_data, 42);
        assert_eq!(metadata.sample_nr, 7);
        assert_eq!(metadata.timestamp_ns_begin, 100);
        assert_eq!(metadata.timestamp_ns_end, 200);
        assert!(metadata.flags.stretched);
        assert!(!metadata.flags.error);
        assert_eq!(metadata.gpu_cycle, 1000);
        assert_eq!(metadata.sc_cycle, 2000);

        // Iterate the blocks: front-end first, then the tiler.
        let mut block = BlockHandle::Start;
        let first = backend.next(&handle, &mut block).unwrap();
        assert_eq!(first.block_type, BlockType::Fe);
        assert_eq!(first.index, 0);
        assert!(first.state.on);
        assert_eq!(first.values.len(), 64);
        assert_eq!(first.values.get(0), 10);
        assert_eq!(first.values.get(63), 73);

        let second = backend.next(&handle, &mut block).unwrap();
        assert_eq!(second.block_type, BlockType::Tiler);
        assert_eq!(second.values.get(0), 1000);

        assert!(backend.next(&handle, &mut block).is_none());
    }

    #[test]
    fn test_get_sample_rejects_short_block_list() {
        let mut mapping = sample_mapping(64);
        // Overwrite the tiler block with the sentinel: one block missing.
        write_item(&mut mapping, 3, ioctl::ItemHeader::default());

        let syscall = FakeKinstrSyscall::default();
        let mut backend = make_backend(0, &mut mapping, syscall.clone());

        match backend.get_sample() {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // The invalid sample went back to the kernel.
        assert_eq!(*syscall.puts.borrow(), 1);
    }

    #[test]
    fn test_get_sample_rejects_out_of_order_indices() {
        let mut mapping = sample_mapping(64);
        let values_base = 8 * ITEM_SIZE;
        write_item(
            &mut mapping,
            2,
            metadata_block_item(ioctl::raw_block_type::FE, 1, values_base as u32),
        );

        let mut backend = make_backend(0, &mut mapping, FakeKinstrSyscall::default());

        match backend.get_sample() {
            Err(Error::Protocol(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_periodic_mode_rejects_request_sample() {
        let mut mapping = sample_mapping(64);
        let mut backend = make_backend(1_000_000, &mut mapping, FakeKinstrSyscall::default());

        backend.start(1).unwrap();
        match backend.request_sample(2) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        backend.stop(3).unwrap();
    }

    #[test]
    fn test_manual_mode_allows_request_sample() {
        let mut mapping = sample_mapping(64);
        let mut backend = make_backend(0, &mut mapping, FakeKinstrSyscall::default());

        backend.start(1).unwrap();
        backend.request_sample(2).unwrap();
        backend.stop(3).unwrap();
    }
}
