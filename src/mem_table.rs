//! Concurrent Hash+Sorted-Vector memtable (HashSpd, C1).
//!
//! Writes land in a hash bucket (a mutex-guarded, comparator-sorted `Vec` —
//! the "intrusive linked list" of the spec, flattened to a `Vec` since Rust
//! gives us little reason to hand-roll an intrusive list here) so point
//! lookups and duplicate detection are O(bucket size). Every successful
//! insert also appends the same entry to the tail of a *sorted-vector
//! container*: a sequence of append-only, fixed-capacity vectors. A
//! background thread seals each vector (sorts it once, publishes
//! `sorted=true`) and periodically merges runs of small vectors so the
//! container doesn't grow without bound. Iteration walks the container
//! through a comparator-ordered heap over each vector's cursor; it never
//! touches the buckets.

#![allow(unused)]
#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use log::{debug, trace};

use crate::iterators::StorageIterator;
use crate::key::{KeyBytes, KeySlice};
use crate::table::SsTableBuilder;
use crate::wal::Wal;

const DEFAULT_NUM_BUCKETS: usize = 4096;
/// Capacity of a single sorted vector before a writer must append a new one.
const SV_CAPACITY: usize = 4096;
/// Once the container holds more than this many SVs, the sort thread looks
/// for a run of small SVs to merge (the spec's "≈8").
const MERGE_TRIGGER_SV_COUNT: usize = 8;
/// `kMergedVectorsMax`: an individual merge run is bounded to this many SVs.
const MERGED_VECTORS_MAX: usize = 4;
/// An SV counts as "small" (a merge candidate) below this fraction of its
/// capacity.
const SMALL_SV_FRACTION: f64 = 0.75;

/// Create a bound of `Bytes` from a bound of `&[u8]`(Native).
pub(crate) fn map_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
        Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Create a bound of `KeyBytes` from a bound of `KeySlice`.
pub(crate) fn map_key_bound(bound: Bound<KeySlice>) -> Bound<KeyBytes> {
    match bound {
        Bound::Included(x) => Bound::Included(KeyBytes::from_bytes_with_ts(
            Bytes::copy_from_slice(x.key_ref()),
            x.ts(),
        )),
        Bound::Excluded(x) => Bound::Excluded(KeyBytes::from_bytes_with_ts(
            Bytes::copy_from_slice(x.key_ref()),
            x.ts(),
        )),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub(crate) fn map_key_bound_plus_ts(bound: Bound<&[u8]>, ts: u64) -> Bound<KeySlice> {
    match bound {
        Bound::Included(x) => Bound::Included(KeySlice::from_slice(x, ts)),
        Bound::Excluded(x) => Bound::Excluded(KeySlice::from_slice(x, ts)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// A single allocated entry. `allocate`/`insert` are split in the external
/// interface so a caller can size the value before committing it; here the
/// handle already carries both key and value since Rust's allocator gives
/// us no reason to separate arena reservation from key/value storage.
pub struct KeyHandle {
    key: KeyBytes,
    value: Bytes,
}

type NodeRef = Arc<KeyHandle>;

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// An append-only, fixed-capacity run of entries with two pieces of shared
/// state: how many slots are occupied, and whether it has been sorted and
/// sealed. The backing `Vec` is mutex-guarded rather than grown through a
/// lock-free atomic-index append: it keeps the same two-phase append
/// protocol (try under the container's read lock, retry under the write
/// lock when full) without unsafe slot pre-allocation.
struct SortedVector {
    capacity: usize,
    slots: Mutex<Vec<NodeRef>>,
    sorted: AtomicBool,
}

impl SortedVector {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity)),
            sorted: AtomicBool::new(false),
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn is_sealed(&self) -> bool {
        self.sorted.load(Ordering::Acquire)
    }

    /// Tries to append `node`. Returns `node` back if the vector is full.
    fn try_add(&self, node: NodeRef) -> Result<(), NodeRef> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() < self.capacity {
            slots.push(node);
            Ok(())
        } else {
            Err(node)
        }
    }

    /// Sorts the vector under its own mutex and publishes `sorted=true`
    /// with release semantics. Readers observe `sorted` with acquire
    /// ordering before trusting the vector is binary-searchable.
    fn sort(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.sort_by(|a, b| a.key.as_key_slice().cmp(&b.key.as_key_slice()));
        drop(slots);
        self.sorted.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<NodeRef> {
        self.slots.lock().unwrap().clone()
    }
}

/// The ordered list of sorted vectors. At most one SV (the tail) is
/// unsealed at any time.
struct SvContainer {
    svs: RwLock<Vec<Arc<SortedVector>>>,
}

impl SvContainer {
    fn new() -> Self {
        Self {
            svs: RwLock::new(vec![Arc::new(SortedVector::new(SV_CAPACITY))]),
        }
    }

    /// Appends `node` to the tail SV, growing the container with a fresh
    /// SV if the tail is full. Exactly one writer wins the append when the
    /// tail overflows; losers retry against the new tail.
    fn append(&self, mut node: NodeRef) {
        loop {
            {
                let svs = self.svs.read().unwrap();
                let tail = svs.last().expect("container never empty").clone();
                drop(svs);
                match tail.try_add(node) {
                    Ok(()) => return,
                    Err(returned) => node = returned,
                }
            }
            let mut svs = self.svs.write().unwrap();
            if svs.last().map_or(true, |t| t.len() >= t.capacity) {
                svs.push(Arc::new(SortedVector::new(SV_CAPACITY)));
            }
        }
    }

    /// Appends a fresh empty tail so a subsequent iterator snapshot has a
    /// stable (if empty) unsealed tail to ignore.
    fn append_new_empty_tail(&self) {
        let mut svs = self.svs.write().unwrap();
        svs.push(Arc::new(SortedVector::new(SV_CAPACITY)));
    }

    fn snapshot(&self) -> Vec<Arc<SortedVector>> {
        self.svs.read().unwrap().clone()
    }

    /// Seals every SV that isn't sealed yet (called directly when the
    /// memtable is marked read-only, so the background thread no longer
    /// needs to run).
    fn seal_all(&self) {
        let svs = self.svs.read().unwrap();
        for sv in svs.iter() {
            if !sv.is_sealed() {
                sv.sort();
            }
        }
    }

    /// Sorts every unsealed SV except the tail (the tail stays mutable).
    fn sort_pass(&self) {
        let svs = self.svs.read().unwrap();
        let n = svs.len();
        for sv in svs.iter().take(n.saturating_sub(1)) {
            if !sv.is_sealed() {
                sv.sort();
            }
        }
    }

    /// Looks for a run of `>=2` consecutive sealed "small" SVs (below
    /// `SMALL_SV_FRACTION` of capacity), up to `MERGED_VECTORS_MAX` long,
    /// among everything but the tail, and merges it via k-way heap merge.
    fn merge_pass(&self) {
        let mut svs = self.svs.write().unwrap();
        let n = svs.len();
        if n <= MERGE_TRIGGER_SV_COUNT {
            return;
        }
        let candidates = n - 1; // exclude tail
        let mut start = 0;
        while start < candidates {
            let mut end = start;
            while end < candidates
                && end - start < MERGED_VECTORS_MAX
                && svs[end].is_sealed()
                && (svs[end].len() as f64) < svs[end].capacity as f64 * SMALL_SV_FRACTION
            {
                end += 1;
            }
            if end - start >= 2 {
                let merged = merge_sealed_vectors(&svs[start..end]);
                svs.splice(start..end, std::iter::once(Arc::new(merged)));
                trace!("mem_table: merged {} small sorted vectors", end - start);
                return;
            }
            start = start.max(end) + 1;
        }
    }
}

struct HeapEntry {
    node: NodeRef,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.node.key == other.node.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.node.key.as_key_slice().cmp(&other.node.key.as_key_slice())
    }
}

fn merge_sealed_vectors(vectors: &[Arc<SortedVector>]) -> SortedVector {
    let snapshots: Vec<Vec<NodeRef>> = vectors.iter().map(|sv| sv.snapshot()).collect();
    let total: usize = snapshots.iter().map(|v| v.len()).sum();
    let mut cursors = vec![0usize; snapshots.len()];
    let mut heap = BinaryHeap::new();
    for (i, snap) in snapshots.iter().enumerate() {
        if let Some(node) = snap.first() {
            heap.push(Reverse(HeapEntry {
                node: node.clone(),
                src: i,
            }));
        }
    }
    let mut merged = Vec::with_capacity(total.max(1));
    while let Some(Reverse(entry)) = heap.pop() {
        merged.push(entry.node.clone());
        let src = entry.src;
        cursors[src] += 1;
        if let Some(node) = snapshots[src].get(cursors[src]) {
            heap.push(Reverse(HeapEntry {
                node: node.clone(),
                src,
            }));
        }
    }
    let sv = SortedVector::new(merged.len().max(1));
    *sv.slots.lock().unwrap() = merged;
    sv.sorted.store(true, Ordering::Release);
    sv
}

/// Condition variable pair the dedicated sort thread waits on, shared (via
/// `Arc`) between the `MemTable` and its background thread so the thread can
/// outlive the stack frame that spawned it.
struct SortWake {
    woken: Mutex<bool>,
    cv: Condvar,
}

/// Dedicated per-memtable background thread that sorts sealable SVs and
/// folds a run of small ones together whenever it's woken, falling back to a
/// short poll so a missed wakeup can't stall sorting indefinitely.
fn spawn_sort_thread(
    id: usize,
    container: Arc<SvContainer>,
    wake: Arc<SortWake>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("mem-table-{id}-sort"))
        .spawn(move || loop {
            {
                let mut woken = wake.woken.lock().unwrap();
                while !*woken {
                    let (guard, timeout) = wake.cv.wait_timeout(woken, Duration::from_millis(50)).unwrap();
                    woken = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
                *woken = false;
            }
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            container.sort_pass();
            container.merge_pass();
        })
        .expect("failed to spawn mem-table sort thread")
}

/// Concurrent hash+sorted-vector memtable.
pub struct MemTable {
    id: usize,
    buckets: Vec<Mutex<Vec<NodeRef>>>,
    container: Arc<SvContainer>,
    approximate_size: Arc<AtomicUsize>,
    read_only: AtomicBool,
    wal: Option<Wal>,
    sort_wake: Arc<SortWake>,
    sort_shutdown: Arc<AtomicBool>,
    sort_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MemTable {
    /*----------------MemTable creation and Initialization------------*/
    pub fn create(id: usize) -> Self {
        Self::new_inner(id, None)
    }

    pub fn create_with_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new_inner(id, Some(Wal::create(path)?)))
    }

    pub fn recover_from_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        let table = Self::new_inner(id, None);
        let recovered = Wal::recover(path)?;
        for (key, value) in recovered {
            table.put(key.as_key_slice(), &value)?;
        }
        Ok(table)
    }

    fn new_inner(id: usize, wal: Option<Wal>) -> Self {
        let mut buckets = Vec::with_capacity(DEFAULT_NUM_BUCKETS);
        for _ in 0..DEFAULT_NUM_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        let container = Arc::new(SvContainer::new());
        let sort_wake = Arc::new(SortWake {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        });
        let sort_shutdown = Arc::new(AtomicBool::new(false));
        let sort_thread = spawn_sort_thread(id, Arc::clone(&container), Arc::clone(&sort_wake), Arc::clone(&sort_shutdown));

        Self {
            id,
            buckets,
            container,
            approximate_size: Arc::new(AtomicUsize::new(0)),
            read_only: AtomicBool::new(false),
            wal,
            sort_wake,
            sort_shutdown,
            sort_thread: Mutex::new(Some(sort_thread)),
        }
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        (hash_key(key) as usize) % self.buckets.len()
    }

    fn wake_sort_thread(&self) {
        let mut woken = self.sort_wake.woken.lock().unwrap();
        *woken = true;
        self.sort_wake.cv.notify_one();
    }

    /// Signals the background sort thread to stop and joins it. Safe to call
    /// more than once (subsequent calls see an already-taken handle).
    fn stop_sort_thread(&self) {
        self.sort_shutdown.store(true, Ordering::Release);
        {
            let mut woken = self.sort_wake.woken.lock().unwrap();
            *woken = true;
        }
        self.sort_wake.cv.notify_one();
        if let Some(handle) = self.sort_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Runs one sort-thread iteration synchronously: sort every sealable SV,
    /// then attempt a merge pass. Exposed so tests and `mark_read_only` can
    /// drive the same logic deterministically without racing a background
    /// thread.
    pub fn run_sort_pass(&self) {
        self.container.sort_pass();
        self.container.merge_pass();
    }

    /*----------------HashSpd external interface------------------*/

    /// `allocate(len)` in the spec reserves arena space ahead of `insert`;
    /// here that collapses into constructing the handle directly since Rust
    /// owns the bytes in the handle itself.
    pub fn allocate(key: KeySlice, value: &[u8]) -> KeyHandle {
        KeyHandle {
            key: key.to_key_vec().into_key_bytes(),
            value: Bytes::copy_from_slice(value),
        }
    }

    /// Installs `handle` into its hash bucket; a duplicate key (full
    /// key-and-sequence comparator equality) fails silently and does not
    /// reach the sorted-vector container. On success, the same entry is
    /// appended to the container's tail SV.
    pub fn insert(&self, handle: KeyHandle) -> bool {
        let idx = self.bucket_index(handle.key.key_ref());
        let node = Arc::new(handle);
        {
            let mut bucket = self.buckets[idx].lock().unwrap();
            let pos = bucket.partition_point(|n| n.key.as_key_slice() < node.key.as_key_slice());
            if bucket
                .get(pos)
                .is_some_and(|n| n.key.as_key_slice() == node.key.as_key_slice())
            {
                return false;
            }
            bucket.insert(pos, node.clone());
        }
        self.approximate_size.fetch_add(
            node.key.raw_len() + node.value.len(),
            Ordering::Relaxed,
        );
        self.container.append(node);
        self.wake_sort_thread();
        true
    }

    pub fn contains(&self, key: KeySlice) -> bool {
        let idx = self.bucket_index(key.key_ref());
        let bucket = self.buckets[idx].lock().unwrap();
        bucket
            .binary_search_by(|n| n.key.as_key_slice().cmp(&key))
            .is_ok()
    }

    /// Enumerates entries whose user key matches `lookup_key`, in ascending
    /// comparator order (newest sequence first), stopping as soon as `f`
    /// returns `false`.
    pub fn get_versions(&self, lookup_key: &[u8], mut f: impl FnMut(&KeyBytes, &Bytes) -> bool) {
        let idx = self.bucket_index(lookup_key);
        let bucket = self.buckets[idx].lock().unwrap();
        let pos = bucket.partition_point(|n| n.key.key_ref() < lookup_key);
        for n in &bucket[pos..] {
            if n.key.key_ref() != lookup_key {
                break;
            }
            if !f(&n.key, &n.value) {
                break;
            }
        }
    }

    pub fn mark_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
        self.container.seal_all();
        self.stop_sort_thread();
        debug!("mem_table {}: marked read-only, all SVs sealed", self.id);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /*----------------CRUD convenience wrappers used by the engine------*/

    /// Newest version of `key` with sequence `<= key.ts()`.
    pub fn get(&self, key: KeySlice) -> Option<Bytes> {
        let mut result = None;
        self.get_versions(key.key_ref(), |k, v| {
            if k.ts() <= key.ts() {
                result = Some(v.clone());
                false
            } else {
                true
            }
        });
        result
    }

    pub fn scan(&self, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> MemTableIterator {
        MemTableIterator::new(self, lower, upper)
    }

    pub fn put(&self, key: KeySlice, value: &[u8]) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.put(key, value)?;
        }
        let handle = Self::allocate(key, value);
        self.insert(handle);
        Ok(())
    }

    /*----------------WAL Management: Flush and Sync------------------*/
    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        let mut iter = self.scan(Bound::Unbounded, Bound::Unbounded);
        while iter.is_valid() {
            builder.add(iter.key(), iter.value());
            iter.next()?;
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /*-----------------Util function for common use-------------------*/
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.approximate_memory_usage() == 0
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_memory_usage()
    }
}

impl Drop for MemTable {
    /// A memtable dropped while still mutable (e.g. in a test that never
    /// calls `mark_read_only`) must still stop its sort thread, or the
    /// thread spins on `container`/`sort_wake` forever via its own `Arc`
    /// clones even after this `MemTable` is gone.
    fn drop(&mut self) {
        self.stop_sort_thread();
    }
}

/// A forward iterator over the memtable's sorted-vector container. Built by
/// taking a snapshot of the container (appending a fresh empty tail first
/// if the memtable is still mutable, per the spec's iterator-construction
/// rule), forcing any unsealed SVs in the snapshot to sort synchronously,
/// and merging through a comparator-ordered min-heap.
pub struct MemTableIterator {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    snapshots: Vec<Vec<NodeRef>>,
    cursors: Vec<usize>,
    current: Option<NodeRef>,
    lower: Bound<KeyBytes>,
    upper: Bound<KeyBytes>,
}

impl MemTableIterator {
    fn new(table: &MemTable, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> Self {
        if !table.is_read_only() {
            table.container.append_new_empty_tail();
        }
        let svs = table.container.snapshot();
        for sv in &svs {
            if !sv.is_sealed() {
                sv.sort();
            }
        }
        let snapshots: Vec<Vec<NodeRef>> = svs.iter().map(|sv| sv.snapshot()).collect();
        let mut cursors = vec![0usize; snapshots.len()];
        let mut heap = BinaryHeap::new();
        for (i, snap) in snapshots.iter().enumerate() {
            if let Some(node) = snap.first() {
                heap.push(Reverse(HeapEntry {
                    node: node.clone(),
                    src: i,
                }));
            }
        }
        let mut iter = Self {
            heap,
            snapshots,
            cursors,
            current: None,
            lower: map_key_bound(lower),
            upper: map_key_bound(upper),
        };
        iter.advance_to_in_range();
        iter
    }

    fn pop_next(&mut self) -> Option<NodeRef> {
        let Reverse(entry) = self.heap.pop()?;
        let src = entry.src;
        self.cursors[src] += 1;
        if let Some(node) = self.snapshots[src].get(self.cursors[src]) {
            self.heap.push(Reverse(HeapEntry {
                node: node.clone(),
                src,
            }));
        }
        Some(entry.node)
    }

    fn in_upper_bound(&self, key: &KeyBytes) -> bool {
        match &self.upper {
            Bound::Included(u) => key.as_key_slice() <= u.as_key_slice(),
            Bound::Excluded(u) => key.as_key_slice() < u.as_key_slice(),
            Bound::Unbounded => true,
        }
    }

    fn in_lower_bound(&self, key: &KeyBytes) -> bool {
        match &self.lower {
            Bound::Included(l) => key.as_key_slice() >= l.as_key_slice(),
            Bound::Excluded(l) => key.as_key_slice() > l.as_key_slice(),
            Bound::Unbounded => true,
        }
    }

    fn advance_to_in_range(&mut self) {
        loop {
            match self.pop_next() {
                None => {
                    self.current = None;
                    return;
                }
                Some(node) => {
                    if !self.in_lower_bound(&node.key) {
                        continue;
                    }
                    if !self.in_upper_bound(&node.key) {
                        self.current = None;
                        self.heap.clear();
                        return;
                    }
                    self.current = Some(node);
                    return;
                }
            }
        }
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.current.as_ref().expect("invalid iterator").key.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("invalid iterator").value[..]
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.advance_to_in_range();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeySlice;

    fn key(s: &str) -> KeySlice {
        KeySlice::from_slice(s.as_bytes(), 0)
    }

    #[test]
    fn boundary_memtable_duplicate() {
        let table = MemTable::create(0);
        assert!(table.put(key("a"), b"1").is_ok());
        assert!(!table.insert(MemTable::allocate(key("a"), b"2")));
        assert!(table.contains(key("a")));
        let mut iter = table.scan(Bound::Unbounded, Bound::Unbounded);
        let mut count = 0;
        while iter.is_valid() {
            assert_eq!(iter.key().key_ref(), b"a");
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn iterator_enumerates_sorted_distinct_keys() {
        let table = MemTable::create(0);
        for k in ["c", "a", "b", "a"] {
            table.put(key(k), k.as_bytes()).unwrap();
        }
        let mut iter = table.scan(Bound::Unbounded, Bound::Unbounded);
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push(String::from_utf8_lossy(iter.key().key_ref()).to_string());
            iter.next().unwrap();
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn concurrent_inserts_round_trip_against_reference_set() {
        use std::collections::BTreeSet;

        let table = MemTable::create(0);
        let num_threads = 4;
        let per_thread = 500;
        crossbeam::thread::scope(|scope| {
            for t in 0..num_threads {
                let table = &table;
                scope.spawn(move |_| {
                    for i in 0..per_thread {
                        let k = format!("k-{t}-{i}");
                        table.put(key(&k), k.as_bytes()).unwrap();
                    }
                });
            }
        })
        .unwrap();

        table.mark_read_only();

        let mut reference = BTreeSet::new();
        for t in 0..num_threads {
            for i in 0..per_thread {
                reference.insert(format!("k-{t}-{i}"));
            }
        }

        let mut iter = table.scan(Bound::Unbounded, Bound::Unbounded);
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push(String::from_utf8_lossy(iter.key().key_ref()).to_string());
            iter.next().unwrap();
        }
        let seen_set: BTreeSet<String> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), seen_set.len(), "no duplicate keys in iteration");
        assert_eq!(seen_set, reference);
    }

    #[test]
    fn randomized_fuzz_matches_reference_sorted_set() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::BTreeSet;

        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let table = MemTable::create(0);
        let mut reference: BTreeSet<(Vec<u8>, u64)> = BTreeSet::new();

        for ts in 0..2000u64 {
            let key_space = rng.gen_range(0..500);
            let k = format!("key-{key_space:04}");
            table
                .put(KeySlice::from_slice(k.as_bytes(), ts), k.as_bytes())
                .unwrap();
            reference.insert((k.into_bytes(), ts));
        }

        table.mark_read_only();

        let mut iter = table.scan(Bound::Unbounded, Bound::Unbounded);
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push((iter.key().key_ref().to_vec(), iter.key().ts()));
            iter.next().unwrap();
        }

        // Memtable order: user key ascending, then sequence number
        // descending for equal keys.
        let mut expected: Vec<(Vec<u8>, u64)> = reference.into_iter().collect();
        expected.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        assert_eq!(seen, expected);
    }
}
