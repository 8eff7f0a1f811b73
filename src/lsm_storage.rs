#![allow(unused)]
#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    block::Block,
    compact::{CompactionController, CompactionOptions, CompactionTask},
    iterators::concat_iterator::SstConcatIterator,
    iterators::merge_iterator::MergeIterator,
    iterators::two_merge_iterator::TwoMergeIterator,
    iterators::StorageIterator,
    key::{KeyBytes, KeySlice},
    lsm_iterator::{FusedIterator, LsmIterator},
    manifest::{Manifest, ManifestRecord},
    mem_table::MemTable,
    mvcc::LsmMvccInner,
    pinning_policy::{PinningPolicy, PinningTier, ScopedPolicyBudget},
    table::iterator::SsTableIterator,
    table::SsTable,
    table_dispatch,
    write_buffer_manager::{WriteBufferManager, WriteBufferManagerOptions},
};
use std::{
    collections::HashMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::compact::hybrid::RunningDescriptor;

/// BlockCache for `read block from disk`, this is used when SSTable is built.
pub type BlockCache = moka::sync::Cache<(usize, usize), Arc<Block>>;

/// stores the state of the storage Engine.
/// This is the core structure for Concurrenty Control and MetaData Manangement.
#[derive(Clone)]
pub struct LsmStroageState {
    // mutable memtable (only one at any time, allow multi-thread to access)
    pub memtable: Arc<MemTable>,
    // immutable_memtable for flush to the disk (A vector of)
    pub imm_memtables: Vec<Arc<MemTable>>,
    // the L0_SsTables stored in the disk.
    pub l0_sstables: Vec<usize>,
    // SSTables sorted by key-range : L1(index:0) ~ Lmax for compaction
    pub levels: Vec<(usize, Vec<usize>)>,
    // SST objects : map index(usize) to SST Object(Arc<SsTable>)
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

impl LsmStroageState {
    fn create(options: &LsmStorageOptions) -> Self {
        let num_levels = match &options.compaction_options {
            CompactionOptions::Hybrid(opts) => opts.num_levels.saturating_sub(1),
            CompactionOptions::NoCompaction => 1,
        };
        Self {
            // when first create, the index of the memtable is 0.
            memtable: Arc::new(MemTable::create(0)),
            // Init the immu_memtable vector and L0_Sstable vector.
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels: (1..=num_levels).map(|l| (l, Vec::new())).collect(),
            sstables: HashMap::new(),
        }
    }
}

/// Provide Configurable options when Initializing the StorageState.
#[derive(Clone, Debug)]
pub struct LsmStorageOptions {
    // configure block size.
    pub block_size: usize,
    // configure the one SSTable size.
    pub target_sst_size: usize,
    // configure the max number of memtables.
    pub max_memtable_limit: usize,
    // Compaction option
    pub compaction_options: CompactionOptions,
    // open WAL or not
    pub enable_wal: bool,
    // serializable snapshot reads (kept for CLI/API compatibility; the trimmed
    // MVCC inner only ever issues snapshot reads, so this is currently a no-op
    // flag rather than switching commit validation strategy).
    pub serializable: bool,
}

impl LsmStorageOptions {
    pub fn default_for_test() -> Self {
        Self {
            block_size: 4096,
            target_sst_size: 2 << 20,
            max_memtable_limit: 3,
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: false,
            serializable: false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CompactionFilter {
    Prefix(Bytes),
}

fn key_within(user_key: &[u8], table_begin: KeySlice, table_end: KeySlice) -> bool {
    table_begin.raw_ref() <= user_key && user_key <= table_end.raw_ref()
}

/// the core data-structure of LsmStorage Engine.
/// only visible inside the crate.
pub(crate) struct LsmStorageInner {
    // lock the state for concurrent R/w.
    pub(crate) state: RwLock<Arc<LsmStroageState>>,
    // lock for sync.
    pub(crate) state_lock: Mutex<()>,
    // the path to the storage location on the file system.
    path: PathBuf,
    // cache data blocks read from the storage(disk)
    pub(crate) block_cache: Arc<BlockCache>,
    // generate unique ids for SSTables.
    next_sst_id: AtomicUsize,
    // configuration settings control the behavior of LSM Tree
    pub(crate) options: Arc<LsmStorageOptions>,
    pub(crate) compaction_controller: CompactionController,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) compaction_filters: Mutex<Vec<CompactionFilter>>,
    pub(crate) mvcc: LsmMvccInner,
    pub(crate) write_buffer_manager: Arc<WriteBufferManager>,
    pub(crate) pinning_policy: PinningPolicy,
    /// Real in-flight compaction/rearrange state, consulted by the picker so
    /// a manual `force_compact` and the background compaction thread never
    /// race each other into picking overlapping work.
    pub(crate) running_compactions: Mutex<RunningDescriptor>,
}

impl LsmStorageInner {
    // CRUD API

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        // 1. get the snapshot to ensure consistency.
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        }; // drop global lock here

        let read_ts = self.mvcc.latest_commit_ts();
        let lookup = KeySlice::from_slice(key, read_ts);

        // Search on the current memtable.
        if let Some(value) = snapshot.memtable.get(lookup) {
            if value.is_empty() {
                return Ok(None);
            }
            return Ok(Some(value));
        }

        // Search on immutable memtables, newest first.
        for memtable in snapshot.imm_memtables.iter() {
            if let Some(value) = memtable.get(lookup) {
                if value.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(value));
            }
        }

        // Search in SSTables.
        // a. L0 SSTables, newest first, bloom-filtered.
        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        let keep_table = |key: &[u8], table: &SsTable| {
            if key_within(
                key,
                table.first_key().as_key_slice(),
                table.last_key().as_key_slice(),
            ) {
                if let Some(bloom) = &table.bloom {
                    if bloom.may_contain(farmhash::fingerprint32(key)) {
                        return true;
                    }
                } else {
                    return true;
                }
            }
            false
        };
        for table in &snapshot.l0_sstables {
            let table = snapshot.sstables[table].clone();
            if keep_table(key, &table) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(
                    table,
                    KeySlice::from_slice(key, read_ts),
                )?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        // b. every level, via concatenated (key-range disjoint) iterators.
        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, level_sst_ids) in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for table in level_sst_ids {
                let table = snapshot.sstables[table].clone();
                if keep_table(key, &table) {
                    level_ssts.push(table);
                }
            }
            let level_iter = SstConcatIterator::create_and_seek_to_key(
                level_ssts,
                KeySlice::from_slice(key, read_ts),
            )?;
            level_iters.push(Box::new(level_iter));
        }
        let iter = TwoMergeIterator::create(l0_iter, MergeIterator::create(level_iters))?;
        if iter.is_valid() && iter.key().key_ref() == key && !iter.value().is_empty() {
            return Ok(Some(Bytes::copy_from_slice(iter.value())));
        }
        Ok(None)
    }

    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };
        let read_ts = self.mvcc.latest_commit_ts();
        let map_lo = crate::mem_table::map_key_bound_plus_ts(lower, read_ts);
        let map_hi = crate::mem_table::map_key_bound_plus_ts(upper, read_ts);

        let mut memtable_iters = Vec::with_capacity(snapshot.imm_memtables.len() + 1);
        memtable_iters.push(Box::new(snapshot.memtable.scan(map_lo, map_hi)));
        for memtable in snapshot.imm_memtables.iter() {
            memtable_iters.push(Box::new(memtable.scan(map_lo, map_hi)));
        }
        let memtable_iter = MergeIterator::create(memtable_iters);

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for table in &snapshot.l0_sstables {
            let table = snapshot.sstables[table].clone();
            if range_overlap(lower, upper, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                let iter = match lower {
                    Bound::Included(key) => SsTableIterator::create_and_seek_to_key(
                        table,
                        KeySlice::from_slice(key, read_ts),
                    )?,
                    Bound::Excluded(key) => {
                        let mut iter = SsTableIterator::create_and_seek_to_key(
                            table,
                            KeySlice::from_slice(key, read_ts),
                        )?;
                        if iter.is_valid() && iter.key().key_ref() == key {
                            iter.next()?;
                        }
                        iter
                    }
                    Bound::Unbounded => SsTableIterator::create_and_seek_to_first(table)?,
                };
                l0_iters.push(Box::new(iter));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, level_sst_ids) in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for table in level_sst_ids {
                let table = snapshot.sstables[table].clone();
                if range_overlap(lower, upper, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                    level_ssts.push(table);
                }
            }
            let level_iter = match lower {
                Bound::Included(key) => {
                    SstConcatIterator::create_and_seek_to_key(level_ssts, KeySlice::from_slice(key, read_ts))?
                }
                Bound::Excluded(key) => {
                    let mut iter = SstConcatIterator::create_and_seek_to_key(
                        level_ssts,
                        KeySlice::from_slice(key, read_ts),
                    )?;
                    if iter.is_valid() && iter.key().key_ref() == key {
                        iter.next()?;
                    }
                    iter
                }
                Bound::Unbounded => SstConcatIterator::create_and_seek_to_first(level_ssts)?,
            };
            level_iters.push(Box::new(level_iter));
        }
        let level_iter = MergeIterator::create(level_iters);

        let sst_iter = TwoMergeIterator::create(l0_iter, level_iter)?;
        let inner = TwoMergeIterator::create(memtable_iter, sst_iter)?;

        let end_bound = match upper {
            Bound::Included(k) => Bound::Included(Bytes::copy_from_slice(k)),
            Bound::Excluded(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(FusedIterator::new(LsmIterator::new(inner, end_bound)?))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Put(key, value)])
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Del(key)])
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        if self.write_buffer_manager.should_stall() {
            let handle = crate::write_buffer_manager::StallHandle::new();
            self.write_buffer_manager.begin_write_stall(handle);
        }

        let commit_ts = self.mvcc.next_commit_ts();
        let mut approximate_size = 0;
        for record in batch {
            match record {
                WriteBatchRecord::Put(key, value) => {
                    let key = key.as_ref();
                    let value = value.as_ref();
                    assert!(!key.is_empty(), "key should not be emtpy!");
                    assert!(!value.is_empty(), "value should not be empty!");
                    let before;
                    let after;
                    {
                        let guard = self.state.read();
                        before = guard.memtable.approximate_size();
                        guard.memtable.put(KeySlice::from_slice(key, commit_ts), value)?;
                        after = guard.memtable.approximate_size();
                    }
                    approximate_size = after;
                    self.write_buffer_manager.reserve(after - before);
                }
                WriteBatchRecord::Del(key) => {
                    let key = key.as_ref();
                    let before;
                    let after;
                    {
                        let guard = self.state.read();
                        before = guard.memtable.approximate_size();
                        guard.memtable.put(KeySlice::from_slice(key, commit_ts), b"")?;
                        after = guard.memtable.approximate_size();
                    }
                    approximate_size = after;
                    self.write_buffer_manager.reserve(after - before);
                }
            }
        }
        self.mvcc.update_commit_ts(commit_ts);
        self.try_freeze(approximate_size)?;
        Ok(())
    }

    // Freeze API
    pub fn force_freeze_memtable(&self, state_lock: &MutexGuard<()>) -> Result<()> {
        let next_id = self.next_sst_id();
        let memtable = if self.options.enable_wal {
            Arc::new(MemTable::create_with_wal(next_id, self.path_of_wal(next_id))?)
        } else {
            Arc::new(MemTable::create(next_id))
        };
        self.freeze_memtable_with_memtable(memtable)?;
        if let Some(manifest) = &self.manifest {
            manifest.add_record(state_lock, ManifestRecord::NewMemTable(next_id))?;
        }
        self.sync_dir()?;
        Ok(())
    }

    fn try_freeze(&self, approximate_size: usize) -> Result<()> {
        if approximate_size >= self.options.target_sst_size {
            let state_lock = self.state_lock.lock();
            let guard = self.state.read();
            if guard.memtable.approximate_size() >= self.options.target_sst_size {
                drop(guard);
                self.force_freeze_memtable(&state_lock)?;
            }
        }
        Ok(())
    }

    fn freeze_memtable_with_memtable(&self, memtable: Arc<MemTable>) -> Result<()> {
        let mut guard = self.state.write();
        let mut snapshot = guard.as_ref().clone();
        let old_memtable = std::mem::replace(&mut snapshot.memtable, memtable);
        old_memtable.sync_wal()?;
        old_memtable.mark_read_only();
        let approximate_size = old_memtable.approximate_memory_usage();
        snapshot.imm_memtables.insert(0, old_memtable);
        *guard = Arc::new(snapshot);
        drop(guard);
        self.write_buffer_manager.schedule_free(approximate_size);
        Ok(())
    }

    // Flush & Compact API
    pub fn force_flush_next_imm_memtable(&self) -> Result<()> {
        self.force_flush_next_imm_memtable_with(false).map(|_| ())
    }

    /// `wbm_initiated` is `true` only when this flush was requested through
    /// the write buffer manager's own initiator callback (registered in
    /// `open`); `trigger_flush`'s `max_memtable_limit`/`should_flush` poll
    /// and the CLI's manual flush both pass `false`. Returns whether a
    /// memtable was actually flushed, so the initiator callback can tell the
    /// manager's round-robin whether this owner accepted the request.
    fn force_flush_next_imm_memtable_with(&self, wbm_initiated: bool) -> Result<bool> {
        let state_lock = self.state_lock.lock();

        let flush_memtable = {
            let guard = self.state.read();
            match guard.imm_memtables.last() {
                Some(m) => m.clone(),
                None => return Ok(false),
            }
        };

        self.write_buffer_manager.flush_started(wbm_initiated);
        let size = flush_memtable.approximate_memory_usage();
        self.write_buffer_manager.free_begin(size);

        let mut builder = crate::table::SsTableBuilder::new(self.options.block_size);
        flush_memtable.flush(&mut builder)?;
        let sst_id = flush_memtable.id();
        let sst = Arc::new(builder.build(sst_id, Some(self.block_cache.clone()), self.path_of_sst(sst_id))?);

        {
            let mut guard = self.state.write();
            let mut snapshot = guard.as_ref().clone();
            let memtable = snapshot.imm_memtables.pop().unwrap();
            assert_eq!(memtable.id(), sst_id, "flushed memtable id mismatch");
            if self.compaction_controller.flush_to_l0() {
                snapshot.l0_sstables.insert(0, sst_id);
            } else if let Some((_, ids)) = snapshot.levels.first_mut() {
                ids.insert(0, sst_id);
            }
            snapshot.sstables.insert(sst_id, sst);
            *guard = Arc::new(snapshot);
        }

        if self.options.enable_wal {
            let _ = std::fs::remove_file(self.path_of_wal(sst_id));
        }

        self.write_buffer_manager.free(size);
        self.write_buffer_manager.flush_ended(wbm_initiated);

        if let Some(manifest) = &self.manifest {
            manifest.add_record(&state_lock, ManifestRecord::Flush(sst_id))?;
        }
        self.sync_dir()?;
        info!("flushed memtable {sst_id} to SST {sst_id} (wbm_initiated={wbm_initiated})");
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> {
        let guard = self.state.read();
        guard.memtable.sync_wal()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.compaction_filters.lock().push(filter);
    }

    // Txn API
    pub fn new_txn(&self) -> Result<u64> {
        Ok(self.mvcc.new_read_ts())
    }

    // Inner util methods or functions
    pub(crate) fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        let options = Arc::new(options);
        let block_cache = Arc::new(
            moka::sync::Cache::builder()
                .max_capacity(1 << 20)
                .build(),
        );

        let compaction_controller = match &options.compaction_options {
            CompactionOptions::Hybrid(hybrid_opts) => CompactionController::Hybrid(
                crate::compact::hybrid::HybridCompactionController::new(hybrid_opts.clone()),
            ),
            CompactionOptions::NoCompaction => CompactionController::None,
        };

        let write_buffer_manager = WriteBufferManager::new(WriteBufferManagerOptions::default());
        let pinning_policy = PinningPolicy::new(PinningTier::FlushedAndSimilar, ScopedPolicyBudget::default());

        let manifest_path = path.join("MANIFEST");
        let mut state = LsmStroageState::create(&options);
        let mut next_sst_id = 1;

        let manifest = if manifest_path.exists() {
            let (manifest, records) = Manifest::recover(&manifest_path)?;
            let mut memtables = std::collections::HashSet::new();
            for record in records {
                match record {
                    ManifestRecord::Flush(sst_id) => {
                        let removed = memtables.remove(&sst_id);
                        assert!(removed, "flushed memtable must have been tracked");
                        if compaction_controller.flush_to_l0() {
                            state.l0_sstables.insert(0, sst_id);
                        } else if let Some((_, ids)) = state.levels.first_mut() {
                            ids.insert(0, sst_id);
                        }
                    }
                    ManifestRecord::NewMemTable(sst_id) => {
                        next_sst_id = next_sst_id.max(sst_id);
                        memtables.insert(sst_id);
                    }
                    ManifestRecord::Compaction(task, output) => {
                        let CompactionTask::Hybrid(hybrid_task) = task else {
                            continue;
                        };
                        let (new_state, _removed) =
                            compaction_controller.apply_compaction_result(&state, &CompactionTask::Hybrid(hybrid_task), &output);
                        state = new_state;
                    }
                }
            }

            let mut sst_ids = state.l0_sstables.clone();
            for (_, ids) in &state.levels {
                sst_ids.extend(ids.iter().copied());
            }
            for sst_id in sst_ids {
                let sst_path = Self::path_of_sst_static(path, sst_id);
                let file = crate::table::FileObject::open(&sst_path)?;
                let sst = Arc::new(table_dispatch::open_dispatched(sst_id, Some(block_cache.clone()), file)?);
                next_sst_id = next_sst_id.max(sst_id);
                state.sstables.insert(sst_id, sst);
            }

            next_sst_id += 1;
            for sst_id in memtables {
                let memtable = if options.enable_wal {
                    MemTable::recover_from_wal(sst_id, Self::path_of_wal_static(path, sst_id))?
                } else {
                    MemTable::create(sst_id)
                };
                state.imm_memtables.insert(0, Arc::new(memtable));
            }

            state.memtable = if options.enable_wal {
                Arc::new(MemTable::create_with_wal(
                    next_sst_id,
                    Self::path_of_wal_static(path, next_sst_id),
                )?)
            } else {
                Arc::new(MemTable::create(next_sst_id))
            };
            manifest.add_record_when_init(ManifestRecord::NewMemTable(next_sst_id))?;
            next_sst_id += 1;
            Some(manifest)
        } else {
            if options.enable_wal {
                state.memtable = Arc::new(MemTable::create_with_wal(0, Self::path_of_wal_static(path, 0))?);
            }
            let manifest = Manifest::create(&manifest_path)?;
            manifest.add_record_when_init(ManifestRecord::NewMemTable(0))?;
            Some(manifest)
        };

        let inner = Arc::new(Self {
            state: RwLock::new(Arc::new(state)),
            state_lock: Mutex::new(()),
            path: path.to_path_buf(),
            block_cache,
            next_sst_id: AtomicUsize::new(next_sst_id),
            options,
            compaction_controller,
            manifest,
            compaction_filters: Mutex::new(Vec::new()),
            mvcc: LsmMvccInner::new(1),
            write_buffer_manager: write_buffer_manager.clone(),
            pinning_policy,
            running_compactions: Mutex::new(RunningDescriptor::default()),
        });

        let weak = Arc::downgrade(&inner);
        write_buffer_manager.register_flush_initiator(
            0,
            Box::new(move |_min_size| {
                weak.upgrade()
                    .and_then(|inner| inner.force_flush_next_imm_memtable_with(true).ok())
                    .unwrap_or(false)
            }),
        );

        Ok(inner)
    }

    pub(crate) fn next_sst_id(&self) -> usize {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn path_of_sst_static(path: impl AsRef<Path>, id: usize) -> PathBuf {
        path.as_ref().join(format!("{id:05}.sst"))
    }

    pub(crate) fn path_of_sst(&self, id: usize) -> PathBuf {
        Self::path_of_sst_static(&self.path, id)
    }

    pub(crate) fn path_of_wal_static(path: impl AsRef<Path>, id: usize) -> PathBuf {
        path.as_ref().join(format!("{id:05}.wal"))
    }

    pub(crate) fn path_of_wal(&self, id: usize) -> PathBuf {
        Self::path_of_wal_static(&self.path, id)
    }

    pub(super) fn sync_dir(&self) -> Result<()> {
        Ok(std::fs::File::open(&self.path)?.sync_all()?)
    }
}

fn range_overlap(
    user_lower: Bound<&[u8]>,
    user_upper: Bound<&[u8]>,
    table_first: KeySlice,
    table_last: KeySlice,
) -> bool {
    match user_upper {
        Bound::Excluded(key) if key <= table_first.key_ref() => return false,
        Bound::Included(key) if key < table_first.key_ref() => return false,
        _ => {}
    }
    match user_lower {
        Bound::Excluded(key) if key >= table_last.key_ref() => return false,
        Bound::Included(key) if key > table_last.key_ref() => return false,
        _ => {}
    }
    true
}

pub enum WriteBatchRecord<T: AsRef<[u8]>> {
    Put(T, T),
    Del(T),
}

/// MiniLsm is a wrapper outside the LsmStorageInner, publicly accessible.
pub struct MiniLsm {
    // maintains a StorageInner inside of it.
    pub(crate) inner: Arc<LsmStorageInner>,
    flush_notifier: Sender<()>,
    compaction_notifier: Sender<()>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    initiation_shutdown: Arc<AtomicBool>,
    initiation_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MiniLsm {
    pub fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let inner = LsmStorageInner::open(path, options)?;
        let (compaction_notifier, compaction_rx) = channel::unbounded();
        let (flush_notifier, flush_rx) = channel::unbounded();
        let compaction_thread = inner.spawn_compaction_thread(compaction_rx)?;
        let flush_thread = inner.spawn_flush_thread(flush_rx)?;
        let initiation_shutdown = Arc::new(AtomicBool::new(false));
        let initiation_thread = inner
            .write_buffer_manager
            .spawn_initiation_thread(Arc::clone(&initiation_shutdown));
        Ok(Arc::new(Self {
            inner,
            flush_notifier,
            compaction_notifier,
            flush_thread: Mutex::new(flush_thread),
            compaction_thread: Mutex::new(compaction_thread),
            initiation_shutdown,
            initiation_thread: Mutex::new(Some(initiation_thread)),
        }))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.force_flush_next_imm_memtable()
    }

    pub fn force_full_compaction(&self) -> Result<()> {
        self.inner.force_compact()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.inner.add_compaction_filter(filter)
    }

    pub fn new_txn(&self) -> Result<u64> {
        self.inner.new_txn()
    }

    pub fn close(&self) -> Result<()> {
        self.flush_notifier.send(()).ok();
        self.compaction_notifier.send(()).ok();
        self.initiation_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.flush_thread.lock().take() {
            handle.join().ok();
        }
        if let Some(handle) = self.compaction_thread.lock().take() {
            handle.join().ok();
        }
        if let Some(handle) = self.initiation_thread.lock().take() {
            handle.join().ok();
        }
        self.sync()
    }
}
