//! Minimal MVCC bookkeeping: a monotonic sequence counter plus the
//! watermark of the oldest sequence number any live reader still depends
//! on. The donor project's full transaction manager (conflict detection,
//! local write buffers, serializable commit validation) is out of scope —
//! this engine's compaction path only ever needs the read-sequence
//! low-watermark to decide whether an old version can be dropped.

#![allow(unused)]

pub mod watermark;

use std::sync::Mutex;

use self::watermark::Watermark;

pub struct LsmMvccInner {
    state: Mutex<(u64, Watermark)>,
}

impl LsmMvccInner {
    pub fn new(init_ts: u64) -> Self {
        Self {
            state: Mutex::new((init_ts, Watermark::new())),
        }
    }

    /// Issues the next sequence number and registers a reader pinned at it,
    /// returning the sequence the caller should read at.
    pub fn new_read_ts(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let ts = state.0;
        state.1.add_reader(ts);
        ts
    }

    pub fn release_read_ts(&self, ts: u64) {
        self.state.lock().unwrap().1.remove_reader(ts);
    }

    pub fn next_commit_ts(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.0 += 1;
        state.0
    }

    pub fn update_commit_ts(&self, ts: u64) {
        self.state.lock().unwrap().0 = ts;
    }

    pub fn latest_commit_ts(&self) -> u64 {
        self.state.lock().unwrap().0
    }

    /// The GC cursor compaction consults before dropping an overwritten
    /// version or a tombstone.
    pub fn watermark(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.1.watermark().unwrap_or(state.0)
    }
}
