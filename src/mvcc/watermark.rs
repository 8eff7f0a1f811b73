//! Tracks the lowest sequence number any live reader still depends on, so
//! compaction knows when it's safe to drop an overwritten version or a
//! tombstone (C9: the GC cursor, trimmed down from the donor project's full
//! transaction/watermark apparatus to just this bookkeeping).

use std::collections::BTreeMap;

#[derive(Default)]
pub struct Watermark {
    // for this read_ts(u64), how many readers are using it.
    readers: BTreeMap<u64, usize>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader pinned at `ts` (e.g. a scan or snapshot read).
    pub fn add_reader(&mut self, ts: u64) {
        *self.readers.entry(ts).or_default() += 1;
    }

    /// Unregisters a reader previously added at `ts`.
    pub fn remove_reader(&mut self, ts: u64) {
        let cnt = self.readers.get_mut(&ts).expect("remove of untracked reader");
        *cnt -= 1;
        if *cnt == 0 {
            self.readers.remove(&ts);
        }
    }

    /// The lowest sequence number any live reader still observes, or `None`
    /// if there are no outstanding readers.
    pub fn watermark(&self) -> Option<u64> {
        self.readers.first_key_value().map(|(ts, _)| *ts)
    }

    pub fn num_of_snapshots(&self) -> usize {
        self.readers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_tracks_lowest_outstanding_reader() {
        let mut w = Watermark::new();
        assert_eq!(w.watermark(), None);
        w.add_reader(5);
        w.add_reader(3);
        w.add_reader(3);
        assert_eq!(w.watermark(), Some(3));
        w.remove_reader(3);
        assert_eq!(w.watermark(), Some(3));
        w.remove_reader(3);
        assert_eq!(w.watermark(), Some(5));
        w.remove_reader(5);
        assert_eq!(w.watermark(), None);
    }
}
