//! Vinstr counters back-end.
//!
//! The vinstr interface predates kernel-described sample layouts: the
//! position of every block inside a sample buffer is fixed per GPU
//! generation and computed here from the product tables at setup time.

use super::backend::{
    discard_impl, filter_block_extents, BackendBase, Configuration, SamplerBackend, SamplerMode,
};
use super::guard::{FdGuard, MappedMemory};
use super::poll::wait_for_sample;
use super::queue::Queue;
use crate::device::Instance;
use crate::hwcnt::{
    BlockExtents, BlockHandle, BlockMetadata, BlockState, BlockType, CounterValues, Features,
    PrfcntSet, Reader, SampleFlags, SampleHandle, SampleMetadata, SampleValuesType,
};
use crate::ioctl::{kbase, kbase_pre_r21, vinstr};
use crate::product::ProductId;
use crate::syscall::{monotonic_now_ns, SyscallIface};
use crate::version::IoctlIface;
use crate::{Error, Result};
use std::os::unix::io::RawFd;

/// Maximum number of sample buffers requested from the kernel.
const MAX_BUFFER_COUNT: u32 = 32;

/// Number of counters per vinstr block.
const COUNTERS_PER_BLOCK: usize = 64;

/// Size of one vinstr counters block in bytes.
const BLOCK_SIZE: usize = COUNTERS_PER_BLOCK * std::mem::size_of::<u32>();

/// True for products using the v4 sample buffer layout.
pub(crate) fn is_v4_layout(product: ProductId) -> bool {
    match product {
        ProductId::T60x | ProductId::T62x | ProductId::T720 | ProductId::T760 => true,
        _ => false,
    }
}

/// One block position inside a sample buffer.
#[derive(Debug, Clone, Copy)]
struct LayoutEntry {
    block_type: BlockType,
    index: u8,
    offset: usize,
}

/// Positions of the requested blocks inside one sample buffer.
#[derive(Debug, Clone, Default)]
pub(crate) struct SampleLayout {
    entries: Vec<LayoutEntry>,
}

impl SampleLayout {
    /// Compute the layout for the filtered extents of a session.
    ///
    /// `num_l2_slices` and `sc_mask` come from the GPU constants; the
    /// layout flavor is fixed by the product generation.
    pub(crate) fn new(
        extents: &BlockExtents,
        num_l2_slices: u64,
        sc_mask: u64,
        v4_layout: bool,
    ) -> Self {
        debug_assert_eq!(extents.counters_per_block() as usize, COUNTERS_PER_BLOCK);
        debug_assert_eq!(extents.values_type(), SampleValuesType::U32);

        let mut layout = SampleLayout {
            entries: Vec::new(),
        };

        if v4_layout {
            layout.layout_v4(extents, sc_mask);
        } else {
            layout.layout_non_v4(extents, num_l2_slices, sc_mask);
        }

        layout
    }

    /// v4 layout: up to four shader cores, then tiler, memory and front-end.
    fn layout_v4(&mut self, extents: &BlockExtents, sc_mask: u64) {
        const NUM_SHADER_CORES: usize = 4;
        debug_assert_eq!(sc_mask & !0b1111, 0);

        const OFFSET_SC: usize = 0;
        if extents.num_blocks_of_type(BlockType::Core) != 0 {
            self.push_cores(sc_mask, OFFSET_SC, extents);
        }

        const OFFSET_TILER: usize = OFFSET_SC + BLOCK_SIZE * NUM_SHADER_CORES;
        if extents.num_blocks_of_type(BlockType::Tiler) != 0 {
            self.push(BlockType::Tiler, 0, OFFSET_TILER);
        }

        const OFFSET_MEMORY: usize = OFFSET_TILER + BLOCK_SIZE;
        if extents.num_blocks_of_type(BlockType::Memory) != 0 {
            debug_assert_eq!(extents.num_blocks_of_type(BlockType::Memory), 1);
            self.push(BlockType::Memory, 0, OFFSET_MEMORY);
        }

        const OFFSET_FE: usize = OFFSET_MEMORY + BLOCK_SIZE * 2;
        if extents.num_blocks_of_type(BlockType::Fe) != 0 {
            self.push(BlockType::Fe, 0, OFFSET_FE);
        }
    }

    /// v5 and later layout: front-end, tiler, memory slices, shader cores.
    fn layout_non_v4(&mut self, extents: &BlockExtents, num_l2_slices: u64, sc_mask: u64) {
        const OFFSET_FE: usize = 0;
        if extents.num_blocks_of_type(BlockType::Fe) != 0 {
            self.push(BlockType::Fe, 0, OFFSET_FE);
        }

        const OFFSET_TILER: usize = OFFSET_FE + BLOCK_SIZE;
        if extents.num_blocks_of_type(BlockType::Tiler) != 0 {
            self.push(BlockType::Tiler, 0, OFFSET_TILER);
        }

        const OFFSET_MEMORY: usize = OFFSET_TILER + BLOCK_SIZE;
        if extents.num_blocks_of_type(BlockType::Memory) != 0 {
            debug_assert_eq!(
                extents.num_blocks_of_type(BlockType::Memory) as u64,
                num_l2_slices
            );

            for slice in 0..num_l2_slices as u8 {
                self.push(
                    BlockType::Memory,
                    slice,
                    OFFSET_MEMORY + slice as usize * BLOCK_SIZE,
                );
            }
        }

        let offset_sc = OFFSET_MEMORY + BLOCK_SIZE * num_l2_slices as usize;
        if extents.num_blocks_of_type(BlockType::Core) != 0 {
            self.push_cores(sc_mask, offset_sc, extents);
        }
    }

    /// Push one entry per set bit of the shader core mask.
    ///
    /// Buffer positions follow the physical core numbering; block indices
    /// are re-enumerated contiguously.
    fn push_cores(&mut self, sc_mask: u64, base_offset: usize, extents: &BlockExtents) {
        let mut sc_index = 0u8;

        for bit in 0..64 {
            if sc_mask & (1u64 << bit) == 0 {
                continue;
            }

            self.push(BlockType::Core, sc_index, base_offset + BLOCK_SIZE * bit);
            sc_index += 1;
        }

        debug_assert_eq!(sc_index, extents.num_blocks_of_type(BlockType::Core));
    }

    fn push(&mut self, block_type: BlockType, index: u8, offset: usize) {
        self.entries.push(LayoutEntry {
            block_type,
            index,
            offset,
        });
    }

    /// Number of blocks in the layout.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> &LayoutEntry {
        &self.entries[index]
    }
}

/// Fold a 128 bit counters enable map into a vinstr 32 bit mask.
///
/// One vinstr mask bit covers four consecutive counters.
pub(crate) fn convert_enable_map(enable_map: u128) -> u32 {
    const COUNTERS_PER_BIT: u32 = 4;

    let mut result = 0u32;
    for bit in 0..32 {
        let group = (enable_map >> (bit * COUNTERS_PER_BIT)) & 0xF;
        if group != 0 {
            result |= 1 << bit;
        }
    }

    result
}

/// Convert configurations to the vinstr setup bitmasks.
///
/// Vinstr knows primary-set counters only.
fn convert_configs(configs: &[Configuration]) -> Result<kbase::HwcntReaderSetup> {
    let mut result = kbase::HwcntReaderSetup::default();

    for config in configs {
        if config.set != PrfcntSet::Primary {
            return Err(Error::NotSupported("vinstr serves the primary set only"));
        }

        let mask = convert_enable_map(config.enable_map);
        match config.block_type {
            BlockType::Fe => result.fe_bm |= mask,
            BlockType::Tiler => result.tiler_bm |= mask,
            BlockType::Memory => result.mmu_l2_bm |= mask,
            BlockType::Core => result.shader_bm |= mask,
            BlockType::Firmware | BlockType::Csg => {
                return Err(Error::InvalidArgument("block type unknown to vinstr"))
            }
        }
    }

    Ok(result)
}

/// Profiling session state.
///
/// Every `stop` produces one manual sample; the session stays queued until
/// that sample has been consumed, so that samples of a finished session
/// still resolve to its user data.
#[derive(Debug, Clone, Copy, Default)]
struct Session {
    /// Session start timestamp, or the timestamp of the last sample.
    last_ts_ns: u64,
    /// User data for periodic samples of this session.
    user_data_periodic: u64,
    /// True once `stop` was called for this session.
    pending_stop: bool,
    /// Number of the manual sample taken when the session was stopped.
    stop_sample_nr: u32,
}

impl Session {
    fn new(start_ts_ns: u64, user_data_periodic: u64) -> Self {
        Session {
            last_ts_ns: start_ts_ns,
            user_data_periodic,
            pending_stop: false,
            stop_sample_nr: 0,
        }
    }

    /// Store a new last timestamp and return the previous one.
    fn update_ts(&mut self, ts: u64) -> u64 {
        std::mem::replace(&mut self.last_ts_ns, ts)
    }

    fn stop(&mut self, stop_sample_nr: u32) {
        self.pending_stop = true;
        self.stop_sample_nr = stop_sample_nr;
    }

    fn can_erase(&self, manual_sample_nr: u32) -> bool {
        self.pending_stop && manual_sample_nr == self.stop_sample_nr
    }
}

/// Maximum in-flight manual sample user data entries.
const MAX_MANUAL_SAMPLES: usize = MAX_BUFFER_COUNT as usize;

/// Maximum profiling sessions tracked at a time.
///
/// Every session stop produces one manual sample, and at most
/// `MAX_BUFFER_COUNT` samples are in flight, so there can be that many
/// start/stop pairs plus one running session.
const MAX_SESSIONS: usize = MAX_BUFFER_COUNT as usize * 2;

/// Counters back-end over the vinstr kernel ioctls.
pub struct VinstrBackend<S: SyscallIface + Clone> {
    base: BackendBase<S>,
    /// Vinstr reader feature bits.
    reader_features: vinstr::ReaderFeatures,
    /// Size of one sample buffer in bytes.
    buffer_size: usize,
    /// Sample buffer layout.
    layout: SampleLayout,
    /// True while sampling or accumulation is running.
    active: bool,
    /// True while the kernel-side periodic timer is armed.
    sampling: bool,
    /// User data of in-flight manual samples.
    user_data_manual: Queue<u64, MAX_MANUAL_SAMPLES>,
    /// Profiling session states.
    sessions: Queue<Session, MAX_SESSIONS>,
    /// Allocator for `SampleMetadata::sample_nr`.
    sample_nr_alloc: u64,
}

impl<S: SyscallIface + Clone> std::fmt::Debug for VinstrBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VinstrBackend")
            .field("fd", &self.base.fd.get())
            .field("mode", &self.base.mode())
            .field("active", &self.active)
            .finish()
    }
}

impl<S: SyscallIface + Clone> VinstrBackend<S> {
    fn request_sample_unchecked(&mut self, user_data: u64) -> Result<()> {
        if !self.active {
            return Err(Error::InvalidArgument("sampling is not started"));
        }

        vinstr::dump(&self.base.syscall, self.base.fd.get())?;
        self.user_data_manual.push(user_data);

        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        vinstr::clear(&self.base.syscall, self.base.fd.get())
    }
}

impl<S: SyscallIface + Clone> SamplerBackend for VinstrBackend<S> {
    fn start(&mut self, user_data: u64) -> Result<()> {
        if self.active {
            return Ok(());
        }

        self.clear()?;

        let now = monotonic_now_ns();

        if self.base.mode() == SamplerMode::Periodic {
            vinstr::set_interval(
                &self.base.syscall,
                self.base.fd.get(),
                self.base.period_ns as u32,
            )?;
            self.sampling = true;
        }

        self.sessions.push(Session::new(now, user_data));
        self.active = true;

        Ok(())
    }

    fn stop(&mut self, user_data: u64) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        if self.base.mode() == SamplerMode::Periodic && self.sampling {
            vinstr::set_interval(&self.base.syscall, self.base.fd.get(), 0)?;
            self.sampling = false;
        }

        self.request_sample_unchecked(user_data)?;

        let stop_sample_nr = self.user_data_manual.push_count();
        self.sessions.back_mut().stop(stop_sample_nr);

        self.active = false;
        Ok(())
    }

    fn request_sample(&mut self, user_data: u64) -> Result<()> {
        if self.base.mode() != SamplerMode::Manual {
            return Err(Error::NotSupported(
                "manual samples of a periodic back-end",
            ));
        }

        self.request_sample_unchecked(user_data)
    }

    fn reader(&self) -> &dyn Reader {
        self
    }

    fn reader_mut(&mut self) -> &mut dyn Reader {
        self
    }
}

impl<S: SyscallIface + Clone> Reader for VinstrBackend<S> {
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

        let metadata = if !self.reader_features.is_empty() {
            vinstr::get_buffer_with_cycles(&self.base.syscall, self.base.fd.get())?
        } else {
            vinstr::ReaderMetadataWithCycles {
                metadata: vinstr::get_buffer(&self.base.syscall, self.base.fd.get())?,
                cycles: Default::default(),
            }
        };

        let is_manual_sample = metadata.metadata.event_id == vinstr::reader_event::MANUAL;

        let mut result = SampleMetadata::default();
        result.flags = SampleFlags::default();

        {
            let session = self.sessions.front_mut();
            result.user_data = session.user_data_periodic;
            result.timestamp_ns_begin = session.update_ts(metadata.metadata.timestamp);
        }

        if is_manual_sample {
            result.user_data = self.user_data_manual.pop();

            let manual_sample_nr = self.user_data_manual.pop_count();
            if self.sessions.front().can_erase(manual_sample_nr) {
                self.sessions.pop();
            }
        }

        result.sample_nr = self.sample_nr_alloc;
        self.sample_nr_alloc += 1;

        result.timestamp_ns_end = metadata.metadata.timestamp;

        if self
            .reader_features
            .contains(vinstr::ReaderFeatures::CYCLES_TOP)
        {
            result.gpu_cycle = metadata.cycles.top;
        }
        if self
            .reader_features
            .contains(vinstr::ReaderFeatures::CYCLES_SHADER_CORE)
        {
            result.sc_cycle = metadata.cycles.shader_cores;
        }
        if result.sc_cycle == 0 && result.gpu_cycle != 0 {
            result.sc_cycle = result.gpu_cycle;
        }

        Ok((result, SampleHandle::Vinstr(metadata.metadata)))
    }

    fn next<'a>(
        &'a self,
        sample: &SampleHandle,
        block: &mut BlockHandle,
    ) -> Option<BlockMetadata<'a>> {
        let metadata = match sample {
            SampleHandle::Vinstr(metadata) => metadata,
            _ => return None,
        };

        let index = match *block {
            BlockHandle::Start => 0,
            BlockHandle::Vinstr(index) => index,
            _ => return None,
        };

        if index == self.layout.len() {
            return None;
        }

        let entry = self.layout.get(index);
        *block = BlockHandle::Vinstr(index + 1);

        let offset = self.buffer_size * metadata.buffer_idx as usize + entry.offset;
        debug_assert!(offset + BLOCK_SIZE <= self.base.memory.size());

        // The mapping outlives `self`, and the kernel does not recycle the
        // buffer until the sample is put back.
        let data = unsafe {
            std::slice::from_raw_parts(self.base.memory.data().add(offset), BLOCK_SIZE)
        };

        Some(BlockMetadata {
            block_type: entry.block_type,
            index: entry.index,
            set: PrfcntSet::Primary,
            state: BlockState::default(),
            values: CounterValues::new(data, SampleValuesType::U32),
        })
    }

    fn put_sample(&mut self, sample: SampleHandle) -> Result<()> {
        let mut metadata = match sample {
            SampleHandle::Vinstr(metadata) => metadata,
            _ => return Err(Error::InvalidArgument("foreign sample handle")),
        };

        vinstr::put_buffer(&self.base.syscall, self.base.fd.get(), &mut metadata)
    }

    fn discard(&mut self) -> Result<()> {
        let syscall = self.base.syscall.clone();
        discard_impl(self, &syscall)
    }
}

impl<S: SyscallIface + Clone> Drop for VinstrBackend<S> {
    fn drop(&mut self) {
        if self.active {
            let _ = SamplerBackend::stop(self, 0);
        }
    }
}

/// Features init from the vinstr reader feature bits.
fn init_features(reader_features: vinstr::ReaderFeatures) -> Features {
    Features {
        has_gpu_cycle: !reader_features.is_empty(),
        has_power_states: false,
        has_vm_states: false,
        has_protection_states: false,
        has_stretched_flag: false,
        overflow_behavior_defined: true,
    }
}

/// Setup the reader file descriptor for either ioctl dispatch flavor.
fn reader_setup<S: SyscallIface>(
    instance: &Instance<S>,
    setup_args: &mut kbase::HwcntReaderSetup,
    syscall: &S,
) -> Result<RawFd> {
    if instance.kbase_version().iface != IoctlIface::JmPreR21 {
        let fd = kbase::hwcnt_reader_setup(syscall, instance.fd(), setup_args)?;
        return Ok(fd);
    }

    let mut legacy_args = kbase_pre_r21::UkHwcntReaderSetup {
        header: kbase_pre_r21::UkHeader::with_id(kbase_pre_r21::header_id::HWCNT_READER_SETUP),
        buffer_count: setup_args.buffer_count,
        jm_bm: setup_args.fe_bm,
        shader_bm: setup_args.shader_bm,
        tiler_bm: setup_args.tiler_bm,
        mmu_l2_bm: setup_args.mmu_l2_bm,
        fd: -1,
    };

    kbase_pre_r21::hwcnt_reader_setup(syscall, instance.fd(), &mut legacy_args)?;
    Ok(legacy_args.fd)
}

impl<S: SyscallIface + Clone> VinstrBackend<S> {
    /// Create a vinstr back-end for `instance`.
    pub(crate) fn create(
        instance: &Instance<S>,
        period_ns: u64,
        configs: &[Configuration],
    ) -> Result<VinstrBackend<S>> {
        let syscall = instance.syscall().clone();

        let extents = filter_block_extents(instance.block_extents(), configs)?;

        let mut setup_args = convert_configs(configs)?;
        setup_args.buffer_count = MAX_BUFFER_COUNT;

        // Initialize the reader with MAX_BUFFER_COUNT buffers or fewer.
        let vinstr_fd = loop {
            match reader_setup(instance, &mut setup_args, &syscall) {
                Ok(fd) => break fd,
                Err(err) => {
                    let enomem = err.errno() == Some(nix::errno::Errno::ENOMEM);
                    if !enomem || setup_args.buffer_count <= 2 {
                        return Err(err);
                    }
                    setup_args.buffer_count >>= 1;
                }
            }
        };

        let fd = FdGuard::new(vinstr_fd, syscall.clone());

        let api_version = vinstr::get_api_version(&syscall, fd.get())?;
        let reader_features = vinstr::ReaderFeatures(api_version.features);

        let buffer_size = vinstr::get_buffer_size(&syscall, fd.get())? as usize;
        let mapping_size = buffer_size * setup_args.buffer_count as usize;
        let memory = MappedMemory::map(fd.get(), mapping_size, syscall.clone())?;

        let constants = instance.constants();
        let layout = SampleLayout::new(
            &extents,
            constants.num_l2_slices,
            constants.shader_core_mask,
            is_v4_layout(instance.product_id()),
        );

        log::debug!(
            "vinstr reader up: {} buffers of {} bytes, features {:?}",
            setup_args.buffer_count,
            buffer_size,
            reader_features
        );

        Ok(VinstrBackend {
            base: BackendBase {
                fd,
                period_ns,
                features: init_features(reader_features),
                extents,
                memory,
                syscall,
            },
            reader_features,
            buffer_size,
            layout,
            active: false,
            sampling: false,
            user_data_manual: Queue::new(),
            sessions: Queue::new(),
            sample_nr_alloc: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use nix::libc;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    #[test]
    fn test_enable_map_folding() {
        assert_eq!(convert_enable_map(0), 0);
        // Any counter of a group of four sets that group's bit.
        assert_eq!(convert_enable_map(0b0001), 0b1);
        assert_eq!(convert_enable_map(0b1000), 0b1);
        assert_eq!(convert_enable_map(0b1_0000), 0b10);
        assert_eq!(convert_enable_map(u128::max_value()), u32::max_value());

        // Counter 64 maps to mask bit 16.
        assert_eq!(convert_enable_map(1u128 << 64), 1 << 16);
    }

    #[test]
    fn test_convert_configs_rejects_secondary_set() {
        let config = Configuration {
            block_type: BlockType::Fe,
            set: PrfcntSet::Secondary,
            enable_map: 1,
        };

        match convert_configs(&[config]) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    fn full_extents(num_l2: u8, num_cores: u8) -> BlockExtents {
        BlockExtents::new(
            [1, 1, num_l2, num_cores, 0, 0],
            64,
            SampleValuesType::U32,
        )
    }

    #[test]
    fn test_non_v4_layout_offsets() {
        let extents = full_extents(2, 3);
        // Core mask with a gap: physical cores 0, 1 and 3.
        let layout = SampleLayout::new(&extents, 2, 0b1011, false);

        assert_eq!(layout.len(), 7);
        assert_eq!(layout.get(0).offset, 0); // fe
        assert_eq!(layout.get(1).offset, BLOCK_SIZE); // tiler
        assert_eq!(layout.get(2).offset, 2 * BLOCK_SIZE); // memory 0
        assert_eq!(layout.get(3).offset, 3 * BLOCK_SIZE); // memory 1
        // Cores follow the physical numbering, indices are contiguous.
        assert_eq!(layout.get(4).offset, 4 * BLOCK_SIZE);
        assert_eq!(layout.get(4).index, 0);
        assert_eq!(layout.get(5).offset, 5 * BLOCK_SIZE);
        assert_eq!(layout.get(5).index, 1);
        assert_eq!(layout.get(6).offset, 7 * BLOCK_SIZE);
        assert_eq!(layout.get(6).index, 2);
    }

    #[test]
    fn test_v4_layout_offsets() {
        let extents = full_extents(1, 2);
        let layout = SampleLayout::new(&extents, 1, 0b0011, true);

        assert_eq!(layout.len(), 5);
        // Shader cores first in the v4 layout.
        assert_eq!(layout.get(0).offset, 0);
        assert_eq!(layout.get(1).offset, BLOCK_SIZE);
        // Tiler at slot 4, memory at slot 5, front-end at slot 7.
        assert_eq!(layout.get(2).offset, 4 * BLOCK_SIZE);
        assert_eq!(layout.get(3).offset, 5 * BLOCK_SIZE);
        assert_eq!(layout.get(4).offset, 7 * BLOCK_SIZE);
    }

    /// Fake syscall interface accepting the vinstr session ioctls.
    #[derive(Debug, Clone, Default)]
    struct FakeVinstrSyscall {
        dumps: Rc<RefCell<u32>>,
    }

    impl SyscallIface for FakeVinstrSyscall {
        fn open(&self, _path: &Path) -> Result<RawFd> {
            Err(Error::NotSupported("fake"))
        }

        fn close(&self, _fd: RawFd) -> Result<()> {
            Ok(())
        }

        fn ioctl_val(
            &self,
            _fd: RawFd,
            request: libc::c_ulong,
            _arg: libc::c_ulong,
        ) -> Result<libc::c_int> {
            if request == vinstr::DUMP {
                *self.dumps.borrow_mut() += 1;
            }
            Ok(0)
        }

        unsafe fn ioctl_ptr(
            &self,
            _fd: RawFd,
            _request: libc::c_ulong,
            _arg: *mut libc::c_void,
        ) -> Result<libc::c_int> {
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

    fn make_backend(period_ns: u64, syscall: FakeVinstrSyscall) -> VinstrBackend<FakeVinstrSyscall> {
        let extents = full_extents(1, 1);
        let layout = SampleLayout::new(&extents, 1, 0b1, false);

        VinstrBackend {
            base: BackendBase {
                fd: FdGuard::new(10, syscall.clone()),
                period_ns,
                features: init_features(vinstr::ReaderFeatures::default()),
                extents,
                memory: MappedMemory::unmapped(syscall.clone()),
                syscall,
            },
            reader_features: vinstr::ReaderFeatures::default(),
            buffer_size: BLOCK_SIZE * 4,
            layout,
            active: false,
            sampling: false,
            user_data_manual: Queue::new(),
            sessions: Queue::new(),
            sample_nr_alloc: 0,
        }
    }

    #[test]
    fn test_manual_mode_allows_request_sample() {
        let syscall = FakeVinstrSyscall::default();
        let mut backend = make_backend(0, syscall.clone());

        backend.start(7).unwrap();
        backend.request_sample(8).unwrap();
        assert_eq!(*syscall.dumps.borrow(), 1);

        // Stop takes one extra synchronous sample.
        backend.stop(9).unwrap();
        assert_eq!(*syscall.dumps.borrow(), 2);
    }

    #[test]
    fn test_periodic_mode_rejects_request_sample() {
        let mut backend = make_backend(1_000_000, FakeVinstrSyscall::default());

        backend.start(7).unwrap();
        match backend.request_sample(8) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        backend.stop(9).unwrap();
    }

    #[test]
    fn test_request_sample_requires_start() {
        let mut backend = make_backend(0, FakeVinstrSyscall::default());

        match backend.request_sample(1) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let syscall = FakeVinstrSyscall::default();
        let mut backend = make_backend(0, syscall.clone());

        backend.stop(0).unwrap();
        backend.start(1).unwrap();
        backend.start(1).unwrap();
        backend.stop(2).unwrap();
        backend.stop(2).unwrap();

        // Exactly one implicit stop sample despite the repeated calls.
        assert_eq!(*syscall.dumps.borrow(), 1);
    }
}
