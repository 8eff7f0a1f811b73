#![allow(dead_code)]
#![allow(unused)]
pub mod hybrid;

use crate::iterators::*;
use crate::key::KeySlice;
use crate::table::{SsTable, SsTableBuilder, SsTableIterator};
use crate::{iterators::StorageIterator, manifest::ManifestRecord};
use anyhow::Result;
use crossbeam::channel::{self, Receiver};
use log::{debug, info, warn};
pub use hybrid::{HybridCompactionController, HybridCompactionOptions, HybridCompactionTask, HybridTaskKind, RunningDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::lsm_storage::{CompactionFilter, LsmStorageInner, LsmStroageState};

use self::concat_iterator::SstConcatIterator;
use self::merge_iterator::MergeIterator;
use self::two_merge_iterator::TwoMergeIterator;

#[derive(Debug, Serialize, Deserialize)]
pub enum CompactionTask {
    Hybrid(HybridCompactionTask),
    ForceFullCompaction {
        l0_sstables: Vec<usize>,
        l1_sstables: Vec<usize>,
    },
}

impl CompactionTask {
    fn compact_to_bottom_level(&self) -> bool {
        match self {
            CompactionTask::ForceFullCompaction { .. } => true,
            CompactionTask::Hybrid(task) => task.is_lower_level_bottom_level,
        }
    }
}

/// Controller for different compaction strategies. `Hybrid` is the only
/// real automatic strategy; `None` means the engine only ever compacts via
/// `force_compact`.
pub(crate) enum CompactionController {
    Hybrid(HybridCompactionController),
    None,
}

impl CompactionController {
    pub fn generate_compaction_task(
        &self,
        snapshot: &LsmStroageState,
        running: &RunningDescriptor,
    ) -> Option<CompactionTask> {
        match self {
            CompactionController::Hybrid(handle) => handle
                .pick_compaction(snapshot, running)
                .map(CompactionTask::Hybrid),
            CompactionController::None => None,
        }
    }

    pub fn needs_compaction(&self, snapshot: &LsmStroageState, running: &RunningDescriptor) -> bool {
        match self {
            CompactionController::Hybrid(handle) => handle.needs_compaction(snapshot, running),
            CompactionController::None => false,
        }
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStroageState,
        task: &CompactionTask,
        output: &[usize],
    ) -> (LsmStroageState, Vec<usize>) {
        match (self, task) {
            (CompactionController::Hybrid(ctrl), CompactionTask::Hybrid(task)) => {
                ctrl.apply_compaction_result(snapshot, task, output)
            }
            _ => unreachable!("apply_compaction_result called with a mismatched controller/task pair"),
        }
    }

    pub fn flush_to_l0(&self) -> bool {
        matches!(self, Self::None | Self::Hybrid(_))
    }
}

#[derive(Debug, Clone)]
pub enum CompactionOptions {
    Hybrid(HybridCompactionOptions),
    NoCompaction,
}

impl LsmStorageInner {
    /*------------------------------compact logic--------------------------*/

    /// initiates a full compaction process, which involves merging
    /// all SSTables from the L0 and L1 levels into new SSTables.
    pub fn force_compact(&self) -> Result<()> {
        let CompactionOptions::NoCompaction = &self.options.compaction_options else {
            panic!("full compaction can only be called with compaction is not enabled")
        };
        let snapshot = {
            let state = self.state.read();
            state.clone()
        };

        let l0_sstables = snapshot.l0_sstables.clone();
        let l1_sstables = snapshot
            .levels
            .first()
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();
        let compaction_task = CompactionTask::ForceFullCompaction {
            l0_sstables: l0_sstables.clone(),
            l1_sstables: l1_sstables.clone(),
        };
        info!("force full compaction: {:?}", compaction_task);
        self.running_compactions.lock().manual_compaction_running = true;
        let sstables = self.compact_inner(&compaction_task);
        self.running_compactions.lock().manual_compaction_running = false;
        let sstables = sstables?;

        let mut ids = Vec::with_capacity(sstables.len());
        {
            let state_lock = self.state_lock.lock();
            let mut state = self.state.read().as_ref().clone();
            for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
                let result = state.sstables.remove(sst);
                assert!(result.is_some());
            }
            for new_sst in sstables {
                ids.push(new_sst.sst_id());
                let result = state.sstables.insert(new_sst.sst_id(), new_sst);
                assert!(result.is_none());
            }
            if state.levels.is_empty() {
                state.levels.push((1, Vec::new()));
            }
            state.levels[0].1 = ids.clone();
            let mut l0_sstables_map = l0_sstables.iter().copied().collect::<HashSet<_>>();
            state.l0_sstables = state
                .l0_sstables
                .iter()
                .filter(|x| !l0_sstables_map.remove(x))
                .copied()
                .collect::<Vec<_>>();
            assert!(l0_sstables_map.is_empty());
            *self.state.write() = Arc::new(state);
            self.sync_dir()?;
            if let Some(manifest) = self.manifest.as_ref() {
                manifest.add_record(
                    &state_lock,
                    ManifestRecord::Compaction(compaction_task, ids.clone()),
                )?;
            }
        }
        for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
            std::fs::remove_file(self.path_of_sst(*sst))?;
        }
        info!("force full compaction done, new SSTs: {:?}", ids);

        Ok(())
    }

    fn compact_inner(&self, task: &CompactionTask) -> Result<Vec<Arc<SsTable>>> {
        let snapshot = {
            let state = self.state.read();
            state.clone()
        };
        match task {
            CompactionTask::ForceFullCompaction {
                l0_sstables,
                l1_sstables,
            } => {
                let mut l0_iters = Vec::with_capacity(l0_sstables.len());
                for id in l0_sstables.iter() {
                    l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                        snapshot.sstables.get(id).unwrap().clone(),
                    )?));
                }
                let mut l1_iters = Vec::with_capacity(l1_sstables.len());
                for id in l1_sstables.iter() {
                    l1_iters.push(snapshot.sstables.get(id).unwrap().clone());
                }
                let iter = TwoMergeIterator::create(
                    MergeIterator::create(l0_iters),
                    SstConcatIterator::create_and_seek_to_first(l1_iters)?,
                )?;
                self.compact_generate_sst(iter, task.compact_to_bottom_level())
            }
            CompactionTask::Hybrid(hybrid_task) => {
                let mut upper_iters = Vec::new();
                let mut lower_ssts = Vec::new();
                for (level, ids) in &hybrid_task.input_levels {
                    let ssts: Vec<Arc<SsTable>> = ids
                        .iter()
                        .map(|id| snapshot.sstables.get(id).unwrap().clone())
                        .collect();
                    if *level == usize::MAX {
                        // L0 files: keyspaces may overlap, so they need
                        // their own merge, not a concat iterator.
                        for sst in ssts {
                            upper_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(sst)?));
                        }
                    } else {
                        lower_ssts.extend(ssts);
                    }
                }
                lower_ssts.sort_by(|a, b| a.first_key().cmp(b.first_key()));
                let lower_iter = SstConcatIterator::create_and_seek_to_first(lower_ssts)?;
                if upper_iters.is_empty() {
                    self.compact_generate_sst(lower_iter, task.compact_to_bottom_level())
                } else {
                    let upper_iter = MergeIterator::create(upper_iters);
                    self.compact_generate_sst(
                        TwoMergeIterator::create(upper_iter, lower_iter)?,
                        task.compact_to_bottom_level(),
                    )
                }
            }
        }
    }

    /// compact and organize data stored in the LSM storage engine into SSTables.
    /// responsible for generating new SSTables during compaction.
    fn compact_generate_sst(
        &self,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        compact_to_bottom_level: bool,
    ) -> Result<Vec<Arc<SsTable>>> {
        let mut builder = None;
        let mut new_sst = Vec::new();
        let watermark = self.mvcc.watermark();
        let mut last_key = Vec::<u8>::new();
        let mut first_key_below_watermark = false;
        let compaction_filters = self.compaction_filters.lock().clone();
        'outer: while iter.is_valid() {
            if builder.is_none() {
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let same_as_last_key = iter.key().key_ref() == last_key;
            if !same_as_last_key {
                first_key_below_watermark = true;
            }

            if compact_to_bottom_level
                && !same_as_last_key
                && iter.key().ts() <= watermark
                && iter.value().is_empty()
            {
                last_key.clear();
                last_key.extend(iter.key().key_ref());
                iter.next()?;
                first_key_below_watermark = false;
                continue;
            }

            if iter.key().ts() <= watermark {
                if same_as_last_key && !first_key_below_watermark {
                    iter.next()?;
                    continue;
                }

                first_key_below_watermark = false;

                if !compaction_filters.is_empty() {
                    for filter in &compaction_filters {
                        match filter {
                            CompactionFilter::Prefix(x) => {
                                if iter.key().key_ref().starts_with(x.as_ref()) {
                                    iter.next()?;
                                    continue 'outer;
                                }
                            }
                        }
                    }
                }
            }

            let builder_inner = builder.as_mut().unwrap();
            if builder_inner.estimate_size() >= self.options.target_sst_size && !same_as_last_key {
                let sst_id = self.next_sst_id();
                let old_builder = builder.take().unwrap();
                let sst = Arc::new(old_builder.build(
                    sst_id,
                    Some(self.block_cache.clone()),
                    self.path_of_sst(sst_id),
                )?);
                new_sst.push(sst);
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let builder_inner = builder.as_mut().unwrap();
            builder_inner.add(iter.key(), iter.value());

            if !same_as_last_key {
                last_key.clear();
                last_key.extend(iter.key().key_ref());
            }

            iter.next()?;
        }
        if let Some(builder) = builder {
            let sst_id = self.next_sst_id();
            let sst = Arc::new(builder.build(
                sst_id,
                Some(self.block_cache.clone()),
                self.path_of_sst(sst_id),
            )?);
            new_sst.push(sst);
        }
        Ok(new_sst)
    }

    /* --------background thread---------- */
    pub(crate) fn spawn_compaction_thread(
        self: &Arc<Self>,
        rx: channel::Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        let CompactionOptions::Hybrid(_) = &self.options.compaction_options else {
            return Ok(None);
        };
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(_) => return,
                Err(channel::RecvTimeoutError::Disconnected) => return,
                Err(channel::RecvTimeoutError::Timeout) => {}
            }
            if let Err(e) = this.trigger_compaction() {
                warn!("compaction worker: trigger_compaction failed: {e}");
            }
        });
        Ok(Some(handle))
    }

    fn mark_task_running(&self, task: &CompactionTask) {
        let CompactionTask::Hybrid(task) = task else {
            return;
        };
        let mut running = self.running_compactions.lock();
        let h = task.hyper_level;
        match task.kind {
            HybridTaskKind::Rearrange | HybridTaskKind::MoveLargeSst => {
                running.rearrange_running = true;
                if running.has_rearrange_per_hyper.len() <= h {
                    running.has_rearrange_per_hyper.resize(h + 1, false);
                }
                running.has_rearrange_per_hyper[h] = true;
            }
            _ => {
                if running.n_compactions_per_hyper.len() <= h {
                    running.n_compactions_per_hyper.resize(h + 1, 0);
                }
                running.n_compactions_per_hyper[h] += 1;
            }
        }
    }

    fn unmark_task_running(&self, task: &CompactionTask) {
        let CompactionTask::Hybrid(task) = task else {
            return;
        };
        let mut running = self.running_compactions.lock();
        let h = task.hyper_level;
        match task.kind {
            HybridTaskKind::Rearrange | HybridTaskKind::MoveLargeSst => {
                running.rearrange_running = false;
                if let Some(flag) = running.has_rearrange_per_hyper.get_mut(h) {
                    *flag = false;
                }
            }
            _ => {
                if let Some(n) = running.n_compactions_per_hyper.get_mut(h) {
                    *n = n.saturating_sub(1);
                }
            }
        }
    }

    pub(crate) fn trigger_compaction(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.read();
            state.clone()
        };
        let running = self.running_compactions.lock().clone();
        let Some(task) = self
            .compaction_controller
            .generate_compaction_task(&snapshot, &running)
        else {
            return Ok(());
        };
        debug!("compaction worker: picked task {:?}", task);
        self.mark_task_running(&task);
        let output = self.compact_inner(&task);
        self.unmark_task_running(&task);
        let output = output?;
        let output_ids: Vec<usize> = output.iter().map(|s| s.sst_id()).collect();

        let state_lock = self.state_lock.lock();
        let mut state = self.state.read().as_ref().clone();
        let (mut new_state, removed) = self
            .compaction_controller
            .apply_compaction_result(&state, &task, &output_ids);
        for id in &removed {
            new_state.sstables.remove(id);
        }
        for sst in output {
            new_state.sstables.insert(sst.sst_id(), sst);
        }
        *self.state.write() = Arc::new(new_state);
        self.sync_dir()?;
        if let Some(manifest) = self.manifest.as_ref() {
            manifest.add_record(&state_lock, ManifestRecord::Compaction(task, output_ids))?;
        }
        drop(state_lock);
        for id in removed {
            let _ = std::fs::remove_file(self.path_of_sst(id));
        }
        Ok(())
    }

    pub(crate) fn spawn_flush_thread(
        self: &Arc<Self>,
        rx: channel::Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(_) => return,
                Err(channel::RecvTimeoutError::Disconnected) => return,
                Err(channel::RecvTimeoutError::Timeout) => {}
            }
            if let Err(e) = this.trigger_flush() {
                warn!("flush worker: trigger_flush failed: {e}");
            }
        });
        Ok(Some(handle))
    }

    pub(crate) fn trigger_flush(&self) -> Result<()> {
        let should_flush = {
            let state = self.state.read();
            state.imm_memtables.len() >= self.options.max_memtable_limit
                || self.write_buffer_manager.should_flush()
        };
        if should_flush {
            self.force_flush_next_imm_memtable()?;
        }
        Ok(())
    }
}
