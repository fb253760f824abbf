//! Hardware counters data model.
//!
//! Counters are sampled from the GPU either manually or periodically (see
//! [`crate::sampler`]). The sampled values are read back through the
//! [`Reader`] interface: one [`get_sample`](Reader::get_sample) call
//! acquires a ring buffer entry, [`next`](Reader::next) decodes it into a
//! sequence of per-block records, and
//! [`put_sample`](Reader::put_sample) hands the entry back to the kernel.

mod backend_type;
mod extents;
mod iter;
mod reader;
mod types;

pub use backend_type::{discover, select, BackendType, BackendTypesSet};
pub use extents::{BlockExtents, ClockExtents, SampleValuesType, NUM_BLOCK_TYPES};
pub use iter::{blocks_view, BlockIterator, BlocksView};
pub use reader::{BlockHandle, Reader, SampleHandle};
pub use types::{
    BlockMetadata, BlockState, BlockType, CounterValues, Features, PrfcntSet, SampleFlags,
    SampleMetadata,
};
