//! Lazy iteration over the blocks of one sample.

use super::{BlockHandle, BlockMetadata, Reader, SampleHandle};

/// Iterator over the hardware counters blocks of a sample.
///
/// Construction immediately decodes the first block; an exhausted iterator
/// is the canonical end value. Iteration is single-pass and forward-only:
/// to restart, construct a fresh iterator from the same sample handle. The
/// reader keeps no iteration state, it all lives in the handles here.
pub struct BlockIterator<'r> {
    reader: Option<&'r dyn Reader>,
    sample: SampleHandle,
    block: BlockHandle,
    current: Option<BlockMetadata<'r>>,
}

impl<'r> BlockIterator<'r> {
    /// Construct an iterator pointing at the first block of `sample`.
    pub fn new(reader: &'r dyn Reader, sample: SampleHandle) -> Self {
        let mut block = BlockHandle::default();
        let current = reader.next(&sample, &mut block);

        BlockIterator {
            reader: if current.is_some() { Some(reader) } else { None },
            sample,
            block,
            current,
        }
    }

    /// Construct the end iterator.
    pub fn end() -> Self {
        BlockIterator {
            reader: None,
            sample: SampleHandle::default(),
            block: BlockHandle::default(),
            current: None,
        }
    }

    /// True if this iterator is exhausted.
    pub fn is_end(&self) -> bool {
        self.reader.is_none()
    }
}

impl<'r> Iterator for BlockIterator<'r> {
    type Item = BlockMetadata<'r>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader?;
        let item = self.current.take();

        self.current = reader.next(&self.sample, &mut self.block);
        if self.current.is_none() {
            self.reader = None;
        }

        item
    }
}

impl<'r> PartialEq for BlockIterator<'r> {
    fn eq(&self, other: &Self) -> bool {
        match (self.reader, other.reader) {
            // Exhausted iterators compare equal regardless of origin.
            (None, None) => true,
            (Some(lhs), Some(rhs)) => {
                let lhs = lhs as *const dyn Reader as *const ();
                let rhs = rhs as *const dyn Reader as *const ();

                lhs == rhs && self.sample == other.sample && self.block == other.block
            }
            _ => false,
        }
    }
}

impl<'r> std::fmt::Debug for BlockIterator<'r> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIterator")
            .field("sample", &self.sample)
            .field("block", &self.block)
            .field("is_end", &self.is_end())
            .finish()
    }
}

/// View over the blocks of a sample, usable with a `for` loop.
pub struct BlocksView<'r> {
    reader: &'r dyn Reader,
    sample: SampleHandle,
}

impl<'r> std::fmt::Debug for BlocksView<'r> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlocksView").field("sample", &self.sample).finish()
    }
}

impl<'r> BlocksView<'r> {
    /// Iterator pointing at the first block of the sample.
    pub fn begin(&self) -> BlockIterator<'r> {
        BlockIterator::new(self.reader, self.sample)
    }

    /// The end iterator.
    pub fn end(&self) -> BlockIterator<'r> {
        BlockIterator::end()
    }
}

impl<'r> IntoIterator for BlocksView<'r> {
    type Item = BlockMetadata<'r>;
    type IntoIter = BlockIterator<'r>;

    fn into_iter(self) -> Self::IntoIter {
        self.begin()
    }
}

/// Construct a [`BlocksView`] for a sample previously acquired from `reader`.
pub fn blocks_view<'r>(reader: &'r dyn Reader, sample: SampleHandle) -> BlocksView<'r> {
    BlocksView { reader, sample }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwcnt::{
        BlockExtents, BlockState, BlockType, CounterValues, Features, PrfcntSet,
        SampleMetadata, SampleValuesType,
    };
    use crate::ioctl::vinstr::ReaderMetadata;
    use crate::Result;
    use std::os::unix::io::RawFd;

    /// Reader yielding a fixed number of zero-valued front-end blocks.
    struct FixedReader {
        features: Features,
        extents: BlockExtents,
        num_blocks: usize,
        values: Vec<u8>,
    }

    impl FixedReader {
        fn new(num_blocks: usize) -> Self {
            FixedReader {
                features: Features::default(),
                extents: BlockExtents::new(
                    [num_blocks as u8, 0, 0, 0, 0, 0],
                    4,
                    SampleValuesType::U32,
                ),
                num_blocks,
                values: vec![0u8; 16],
            }
        }
    }

    impl Reader for FixedReader {
        fn fd(&self) -> RawFd {
            -1
        }

        fn features(&self) -> &Features {
            &self.features
        }

        fn block_extents(&self) -> &BlockExtents {
            &self.extents
        }

        fn get_sample(&mut self) -> Result<(SampleMetadata, SampleHandle)> {
            Ok((
                SampleMetadata::default(),
                SampleHandle::Vinstr(ReaderMetadata::default()),
            ))
        }

        fn next<'a>(
            &'a self,
            _sample: &SampleHandle,
            block: &mut BlockHandle,
        ) -> Option<BlockMetadata<'a>> {
            let index = match *block {
                BlockHandle::Start => 0,
                BlockHandle::Vinstr(index) => index,
                _ => unreachable!(),
            };

            if index == self.num_blocks {
                return None;
            }

            *block = BlockHandle::Vinstr(index + 1);

            Some(BlockMetadata {
                block_type: BlockType::Fe,
                index: index as u8,
                set: PrfcntSet::Primary,
                state: BlockState::default(),
                values: CounterValues::new(&self.values, SampleValuesType::U32),
            })
        }

        fn put_sample(&mut self, _sample: SampleHandle) -> Result<()> {
            Ok(())
        }

        fn discard(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_iteration_is_finite() {
        let reader = FixedReader::new(3);
        let sample = SampleHandle::Vinstr(ReaderMetadata::default());

        let indices: Vec<u8> = blocks_view(&reader, sample)
            .into_iter()
            .map(|block| block.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_sample_is_end() {
        let reader = FixedReader::new(0);
        let sample = SampleHandle::Vinstr(ReaderMetadata::default());

        let it = BlockIterator::new(&reader, sample);
        assert!(it.is_end());
        assert_eq!(it, BlockIterator::end());
    }

    #[test]
    fn test_iterator_equality() {
        let reader = FixedReader::new(2);
        let other_reader = FixedReader::new(2);
        let sample = SampleHandle::Vinstr(ReaderMetadata::default());

        // Fresh iterators over the same reader and sample are equal.
        let lhs = BlockIterator::new(&reader, sample);
        let rhs = BlockIterator::new(&reader, sample);
        assert_eq!(lhs, rhs);

        // Same position, different reader: never equal.
        let foreign = BlockIterator::new(&other_reader, sample);
        assert_ne!(lhs, foreign);

        // Advancing makes iterators unequal until both are exhausted.
        let mut lhs = lhs;
        lhs.next();
        let rhs = BlockIterator::new(&reader, sample);
        assert_ne!(lhs, rhs);

        lhs.next();
        assert!(lhs.next().is_none());
        let mut rhs = rhs;
        rhs.next();
        rhs.next();
        assert!(rhs.next().is_none());
        assert_eq!(lhs, rhs);
    }
}
