#![allow(unused)]

use std::ops::Bound;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::{
    iterators::{
        merge_iterator::MergeIterator, two_merge_iterator::TwoMergeIterator, StorageIterator,
    },
    mem_table::MemTableIterator,
    table::iterator::SsTableIterator,
};

use self::concat::SstConcatIterator;
mod concat {
    pub use crate::iterators::concat_iterator::SstConcatIterator;
}

// users should not call next(), key() and value()
// when the iterator is invalid.
/// Memtables (newest-biased, deduplicated by `MergeIterator`) merged against
/// L0 (also deduplicated, since L0 files may overlap) merged against every
/// level's concatenated (key-range disjoint) iterator.
pub(crate) type LsmIteratorInner = TwoMergeIterator<
    MergeIterator<MemTableIterator>,
    TwoMergeIterator<MergeIterator<SsTableIterator>, MergeIterator<SstConcatIterator>>,
>;

pub struct LsmIterator {
    // inner iterator, a comb of merge ieterators on various data types.
    inner: LsmIteratorInner,
    // tracks the end bound of the iteration range.
    end_bound: Bound<Bytes>,
    // maintains a flag.
    is_valid: bool,
}

impl LsmIterator {
    pub(crate) fn new(iter: LsmIteratorInner, end_bound: Bound<Bytes>) -> Result<Self> {
        let mut iter = Self {
            is_valid: iter.is_valid(),
            inner: iter,
            end_bound,
        };
        // move to non-delete.
        iter.move_to_non_delete()?;
        Ok(iter)
    }

    fn next_inner(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        match self.end_bound.as_ref() {
            Bound::Unbounded => {}
            Bound::Included(key) => self.is_valid = self.inner.key().raw_ref() <= key.as_ref(),
            Bound::Excluded(key) => self.is_valid = self.inner.key().raw_ref() < key.as_ref(),
        }
        Ok(())
    }

    fn move_to_non_delete(&mut self) -> Result<()> {
        while self.is_valid() && self.inner.value().is_empty() {
            self.next_inner()?;
        }
        Ok(())
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key().raw_ref()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.next_inner()?;
        self.move_to_non_delete()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}

/// Wraps an iterator so a caller who keeps calling `next()` after it has
/// already returned an error, or after it's gone invalid, gets a clean
/// "already exhausted" `Err` instead of whatever the inner iterator would do
/// (panic, silently stay put, or worse). Mirrors the donor project's
/// `FusedIterator`.
pub struct FusedIterator<I: StorageIterator> {
    //trait I as the inner Type.
    iter: I,
    // track whether an error occured during Iteration.
    has_error: bool,
}

impl<I: StorageIterator> FusedIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            has_error: false,
            iter,
        }
    }
}

impl<I: StorageIterator> StorageIterator for FusedIterator<I> {
    type KeyType<'a>
        = I::KeyType<'a>
    where
        Self: 'a;

    fn is_valid(&self) -> bool {
        !self.has_error && self.iter.is_valid()
    }

    fn key(&self) -> Self::KeyType<'_> {
        assert!(self.is_valid(), "access to invalid iterator");
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid(), "access to invalid iterator");
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        if self.has_error {
            bail!("cannot call next() on an iterator that already errored");
        }
        if self.iter.is_valid() {
            if let Err(e) = self.iter.next() {
                self.has_error = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.iter.number_of_iterators()
    }
}
