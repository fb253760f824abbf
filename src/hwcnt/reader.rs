//! Hardware counters reader interface.

use super::{BlockExtents, BlockMetadata, Features, SampleMetadata};
use crate::ioctl;
use crate::Result;
use std::mem;
use std::os::unix::io::RawFd;

/// Opaque handle to a sample held by the caller.
///
/// Back-end implementations keep their private per-sample state inside the
/// variant they own. Handles are plain values: the caller provides the
/// storage and the reader fills it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleHandle {
    /// No sample.
    Empty,
    /// Vinstr family sample state.
    Vinstr(ioctl::vinstr::ReaderMetadata),
    /// Kinstr_prfcnt family sample state.
    KinstrPrfcnt(ioctl::kinstr_prfcnt::SampleAccess),
}

impl Default for SampleHandle {
    fn default() -> Self {
        SampleHandle::Empty
    }
}

/// Opaque handle to a block iteration position held by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHandle {
    /// Before the first block.
    Start,
    /// Index of the next block in a vinstr sample layout.
    Vinstr(usize),
    /// Index of the next metadata item in a kinstr_prfcnt sample.
    KinstrPrfcnt(usize),
}

impl Default for BlockHandle {
    fn default() -> Self {
        BlockHandle::Start
    }
}

// Handles cross the reader interface by value; keep them register sized.
const _: () = assert!(mem::size_of::<SampleHandle>() <= 24);
const _: () = assert!(mem::size_of::<BlockHandle>() <= 16);

/// Hardware counters reader interface.
///
/// Counters are collected in kernel space and delivered through a memory
/// mapped ring buffer of constant, unspecified size. [`Reader::get_sample`]
/// waits for a sample and acquires its ring buffer entry so the kernel does
/// not modify it; [`Reader::next`] decodes the entry into per-block
/// records; [`Reader::put_sample`] hands the entry back. If the ring buffer
/// is not drained fast enough it may overflow; the overflow behavior is
/// defined iff [`Features::overflow_behavior_defined`] is set.
pub trait Reader {
    /// File descriptor of the counters interface.
    ///
    /// Can be polled to check whether a new sample is available. This is
    /// not the device descriptor: the counters infrastructure uses its own
    /// anonymous node.
    fn fd(&self) -> RawFd;

    /// Features supported by this back-end instance.
    fn features(&self) -> &Features;

    /// Block extents of this reader.
    ///
    /// Unlike the instance-level extents, only the block types requested
    /// at sampler creation time are included.
    fn block_extents(&self) -> &BlockExtents;

    /// Wait for and acquire a new hardware counters sample.
    ///
    /// Blocks until a sample is ready, decodes its metadata and returns an
    /// opaque handle to its ring buffer entry. Only one sample can be held
    /// at a time; acquiring a second sample without putting the first back
    /// is an error at the protocol level.
    fn get_sample(&mut self) -> Result<(SampleMetadata, SampleHandle)>;

    /// Decode the next counters block of a sample.
    ///
    /// `block` carries the iteration position: pass
    /// [`BlockHandle::Start`] to decode the first block, then the handle
    /// updated by the previous call. Returns `None` when the sample has no
    /// more blocks. Two independent iterations over one sample are
    /// allowed. Iteration performs no kernel calls.
    ///
    /// The iteration order is not specified: block types and indices may
    /// appear out of order.
    fn next<'a>(
        &'a self,
        sample: &SampleHandle,
        block: &mut BlockHandle,
    ) -> Option<BlockMetadata<'a>>;

    /// Put a hardware counters sample back to the kernel.
    ///
    /// The sample's ring buffer entry becomes reusable for new samples.
    /// Once put back, the handle and any values decoded from it must not
    /// be used again.
    fn put_sample(&mut self, sample: SampleHandle) -> Result<()>;

    /// Discard the contents of the ring buffer.
    ///
    /// May race with periodically collected samples; stop sampling first.
    fn discard(&mut self) -> Result<()>;
}
