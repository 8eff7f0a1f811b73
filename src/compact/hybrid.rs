//! Hybrid Compaction Picker (C3): organizes physical levels into
//! "hyper-levels" so read and space amplification stay bounded as the LSM
//! grows, the way RocksDB's `UniversalCompactionPicker`/leveled hybrids do,
//! generalized here to the hyper-level grouping this engine's spec calls
//! for.

use std::collections::{HashMap, HashSet};

use log::{debug, info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::key::KeyBytes;
use crate::lsm_storage::LsmStroageState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridCompactionOptions {
    /// Base per-hyper-level merge width, clamped to `[min_merge_width,
    /// max_merge_width]`.
    pub base_multiplier: u64,
    pub min_merge_width: u64,
    pub max_merge_width: u64,
    /// How many physical levels each hyper-level (H>=1) spans.
    pub levels_per_hyper: usize,
    pub num_levels: usize,
    pub level0_file_num_compaction_trigger: usize,
    pub write_buffer_size: u64,
    pub space_amp_factor: f64,
    pub max_open_files: usize,
}

impl Default for HybridCompactionOptions {
    fn default() -> Self {
        Self {
            base_multiplier: 4,
            min_merge_width: 2,
            max_merge_width: 16,
            levels_per_hyper: 2,
            num_levels: 7,
            level0_file_num_compaction_trigger: 4,
            write_buffer_size: 64 * 1024 * 1024,
            space_amp_factor: 1.25,
            max_open_files: 1000,
        }
    }
}

/// `FirstLevelInHyper`/`LastLevelInHyper`: pure functions of `H` and the
/// configured window size, in spec-numbered absolute levels (L0=0).
/// `snapshot.levels` is a 0-indexed `Vec` that excludes L0, so every access
/// into it must go through `level_idx`/`get_level` below rather than
/// indexing with these absolute numbers directly.
pub fn first_level_in_hyper(h: usize, opts: &HybridCompactionOptions) -> usize {
    if h == 0 {
        0
    } else {
        1 + (h - 1) * opts.levels_per_hyper
    }
}

pub fn last_level_in_hyper(h: usize, opts: &HybridCompactionOptions) -> usize {
    if h == 0 {
        0
    } else {
        (first_level_in_hyper(h, opts) + opts.levels_per_hyper - 1).min(opts.num_levels - 1)
    }
}

/// Converts an absolute, spec-numbered level (always >=1 here — L0 is
/// tracked separately in `l0_sstables`, never in `snapshot.levels`) to the
/// matching index into `snapshot.levels`.
fn level_idx(level: usize) -> usize {
    debug_assert!(level >= 1, "level 0 is L0, tracked outside snapshot.levels");
    level - 1
}

fn get_level(snapshot: &LsmStroageState, level: usize) -> Option<&(usize, Vec<usize>)> {
    snapshot.levels.get(level_idx(level))
}

fn clamp_multiplier(opts: &HybridCompactionOptions) -> u64 {
    opts.base_multiplier
        .clamp(opts.min_merge_width, opts.max_merge_width)
}

fn size_to_compact(h: usize, opts: &HybridCompactionOptions) -> u64 {
    let m = clamp_multiplier(opts);
    opts.write_buffer_size.saturating_mul(m.saturating_pow(h as u32 + 1))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HybridTaskKind {
    /// A trivial-move compaction within a hyper-level: files are relabeled
    /// onto a deeper, previously-empty level; no data is rewritten.
    Rearrange,
    /// Freshly flushed L0 files merging into the deepest empty level of
    /// hyper-level 1.
    L0ToHyper1,
    /// A normal read-merge compaction selected by `SelectNBuffers`.
    LevelCompaction,
    /// The last hyper-level has outgrown `size_to_compact[cur] ×
    /// space_amp_factor × 1.2`; compacts it into a newly grown last level,
    /// which on the next tick makes `cur_num_hyper_levels` one bigger.
    PromoteHyperLevel,
    /// The pre-last hyper-level is disproportionately large next to the
    /// tail; trivially relocates its files into the first empty slot below
    /// it, same mechanics as `Rearrange` but triggered by the space-amp
    /// check in step 3 rather than the plain emptiness gap in step 2.
    MoveLargeSst,
    /// Coalesces an overgrown tail of small files in the last level.
    TailCoalesce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridCompactionTask {
    pub kind: HybridTaskKind,
    pub hyper_level: usize,
    pub input_levels: Vec<(usize, Vec<usize>)>,
    pub output_level: usize,
    pub is_trivial_move: bool,
    pub is_lower_level_bottom_level: bool,
}

/// Snapshot of compactions currently in flight, consulted by the
/// concurrency predicates before the picker commits to a new task.
#[derive(Default, Clone)]
pub struct RunningDescriptor {
    pub n_compactions_per_hyper: Vec<usize>,
    pub has_rearrange_per_hyper: Vec<bool>,
    pub rearrange_running: bool,
    pub manual_compaction_running: bool,
}

impl RunningDescriptor {
    fn n_compactions(&self, h: usize) -> usize {
        self.n_compactions_per_hyper.get(h).copied().unwrap_or(0)
    }
    fn has_rearrange(&self, h: usize) -> bool {
        self.has_rearrange_per_hyper.get(h).copied().unwrap_or(false)
    }
}

/// `prev_sub_compaction[H]`: the cursor `SelectNBuffers` leaves behind so
/// the next tick resumes a partial range sweep instead of re-selecting the
/// same head of the level forever.
#[derive(Debug, Clone)]
struct SubCompactionCursor {
    output_level: usize,
    last_key: KeyBytes,
}

pub struct HybridCompactionController {
    pub options: HybridCompactionOptions,
    prev_sub_compaction: Mutex<HashMap<usize, SubCompactionCursor>>,
}

impl HybridCompactionController {
    pub fn new(options: HybridCompactionOptions) -> Self {
        Self {
            options,
            prev_sub_compaction: Mutex::new(HashMap::new()),
        }
    }

    fn cur_num_hyper_levels(&self, snapshot: &LsmStroageState) -> usize {
        // Derived from how many physical levels actually exist; hyper-level
        // count grows as levels are populated.
        let populated = snapshot.levels.iter().rposition(|(_, ids)| !ids.is_empty());
        match populated {
            None => 1,
            Some(last_level_idx) => {
                let last_level_abs = last_level_idx + 1;
                let mut h = 0;
                while last_level_in_hyper(h, &self.options) < last_level_abs {
                    h += 1;
                }
                h.max(1)
            }
        }
    }

    fn may_run_rearrange(&self, h: usize, running: &RunningDescriptor) -> bool {
        h > 0 && !running.rearrange_running && running.n_compactions(h) == 0
    }

    fn may_run_compaction(&self, h: usize, cur: usize, running: &RunningDescriptor) -> bool {
        running.n_compactions(h) == 0 && (h == cur || !running.has_rearrange(h + 1))
    }

    fn may_start_level_compaction(&self, h: usize, cur: usize, snapshot: &LsmStroageState, running: &RunningDescriptor) -> bool {
        if running.n_compactions(h) != 0 {
            return false;
        }
        if h == cur {
            return true;
        }
        let below = last_level_in_hyper(h, &self.options) + 1;
        below >= self.options.num_levels || get_level(snapshot, below).map_or(true, |(_, ids)| ids.is_empty())
    }

    /// `LevelNeedsRearrange(H)`: a non-empty level is followed, within H, by
    /// an empty one.
    fn level_needs_rearrange(&self, h: usize, snapshot: &LsmStroageState) -> bool {
        let first = first_level_in_hyper(h, &self.options);
        let last = last_level_in_hyper(h, &self.options);
        let mut seen_empty = false;
        for lvl in first..=last {
            let empty = get_level(snapshot, lvl).map_or(true, |(_, ids)| ids.is_empty());
            if empty {
                seen_empty = true;
            } else if seen_empty {
                return true;
            }
        }
        false
    }

    fn hyper_level_bytes(&self, h: usize, snapshot: &LsmStroageState) -> u64 {
        let first = first_level_in_hyper(h, &self.options);
        let last = last_level_in_hyper(h, &self.options);
        (first..=last)
            .filter_map(|l| get_level(snapshot, l))
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|sst| sst.table_size())
            .sum()
    }

    fn need_to_run_level_compaction(&self, h: usize, cur: usize, snapshot: &LsmStroageState) -> bool {
        let bytes = self.hyper_level_bytes(h, snapshot);
        if h == cur {
            bytes > 0 && bytes as f64 > self.tail_byte_threshold(h, snapshot)
        } else {
            bytes > size_to_compact(h, &self.options)
        }
    }

    /// `last_level_bytes / (space_amp_factor × 1.1)`, the tail's own
    /// "forced-depth" threshold from step 5 (distinct from step 3's
    /// `size_to_compact[cur] × space_amp_factor × 1.2` promotion check).
    /// `last_level_bytes` is the byte size of the single bottommost level
    /// within hyper-level `h`, not `h`'s own total.
    fn tail_byte_threshold(&self, h: usize, snapshot: &LsmStroageState) -> f64 {
        let last_level = last_level_in_hyper(h, &self.options);
        let last_level_bytes: u64 = get_level(snapshot, last_level)
            .map(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| snapshot.sstables.get(id))
                    .map(|sst| sst.table_size())
                    .sum()
            })
            .unwrap_or(0);
        last_level_bytes as f64 / (self.options.space_amp_factor * 1.1)
    }

    pub fn needs_compaction(&self, snapshot: &LsmStroageState, running: &RunningDescriptor) -> bool {
        if running.manual_compaction_running {
            return false;
        }
        let cur = self.cur_num_hyper_levels(snapshot);
        for h in 1..=cur {
            if self.level_needs_rearrange(h, snapshot) && self.may_run_rearrange(h, running) {
                return true;
            }
        }
        if self.needs_promotion(cur, snapshot) || self.needs_move_large_sst(cur, snapshot) {
            return true;
        }
        for h in 1..=cur {
            if self.need_to_run_level_compaction(h, cur, snapshot)
                && self.may_start_level_compaction(h, cur, snapshot, running)
            {
                return true;
            }
        }
        if snapshot.l0_sstables.len() >= self.options.level0_file_num_compaction_trigger {
            return true;
        }
        self.tail_file_count(snapshot) > self.options.max_open_files / 2
    }

    fn tail_file_count(&self, snapshot: &LsmStroageState) -> usize {
        snapshot.levels.last().map_or(0, |(_, ids)| ids.len())
    }

    /// Step 3, first half: "the last hyper-level exceeds `size_to_compact[cur]
    /// × space_amp_factor × 1.2`".
    fn needs_promotion(&self, cur: usize, snapshot: &LsmStroageState) -> bool {
        let last = last_level_in_hyper(cur, &self.options);
        if last >= self.options.num_levels - 1 {
            // Already at the bottommost physical level; nothing deeper to
            // grow into.
            return false;
        }
        let bytes = self.hyper_level_bytes(cur, snapshot);
        bytes as f64 > size_to_compact(cur, &self.options) as f64 * self.options.space_amp_factor * 1.2
    }

    /// Step 3, second half: "the pre-last hyper-level is disproportionately
    /// large compared to the tail".
    fn needs_move_large_sst(&self, cur: usize, snapshot: &LsmStroageState) -> bool {
        if cur == 0 {
            return false;
        }
        let pre_last = cur - 1;
        if pre_last == 0 {
            return false;
        }
        let pre_last_bytes = self.hyper_level_bytes(pre_last, snapshot);
        let tail_bytes = self.hyper_level_bytes(cur, snapshot);
        pre_last_bytes > 0 && pre_last_bytes as f64 > tail_bytes.max(1) as f64 * self.options.space_amp_factor
    }

    /// Picks the deepest empty level within hyper-level `h`.
    fn deepest_empty_level(&self, h: usize, snapshot: &LsmStroageState) -> Option<usize> {
        let first = first_level_in_hyper(h, &self.options);
        let last = last_level_in_hyper(h, &self.options);
        (first..=last).rev().find(|&lvl| get_level(snapshot, lvl).map_or(true, |(_, ids)| ids.is_empty()))
    }

    fn rearrange_level(&self, h: usize, snapshot: &LsmStroageState) -> Option<HybridCompactionTask> {
        let empty = self.deepest_empty_level(h, snapshot)?;
        let first = first_level_in_hyper(h, &self.options);
        let mut inputs = Vec::new();
        for lvl in first..empty {
            if let Some((_, ids)) = get_level(snapshot, lvl) {
                if !ids.is_empty() {
                    inputs.push((lvl, ids.clone()));
                }
            }
        }
        if inputs.is_empty() {
            return None;
        }
        Some(HybridCompactionTask {
            kind: HybridTaskKind::Rearrange,
            hyper_level: h,
            input_levels: inputs,
            output_level: empty,
            is_trivial_move: true,
            is_lower_level_bottom_level: empty == self.options.num_levels - 1,
        })
    }

    /// Step 3's "move large SST": same trivial-relocation mechanics as
    /// `rearrange_level`, but over the pre-last hyper-level's own range and
    /// triggered by `needs_move_large_sst` rather than an emptiness gap.
    fn move_large_sst(&self, cur: usize, snapshot: &LsmStroageState) -> Option<HybridCompactionTask> {
        let pre_last = cur.checked_sub(1)?;
        if pre_last == 0 {
            return None;
        }
        let mut task = self.rearrange_level(pre_last, snapshot)?;
        task.kind = HybridTaskKind::MoveLargeSst;
        Some(task)
    }

    /// Step 3's promotion: compacts all of hyper-level `cur` into the first
    /// physical level below it, growing the tail by one level. On the next
    /// tick, `cur_num_hyper_levels` (derived from populated levels) naturally
    /// reports one hyper-level more.
    fn promote_hyper_level(&self, cur: usize, snapshot: &LsmStroageState) -> Option<HybridCompactionTask> {
        let first = first_level_in_hyper(cur, &self.options);
        let last = last_level_in_hyper(cur, &self.options);
        let output_level = last + 1;
        if output_level > self.options.num_levels - 1 {
            return None;
        }
        let mut inputs = Vec::new();
        for lvl in first..=last {
            if let Some((_, ids)) = get_level(snapshot, lvl) {
                if !ids.is_empty() {
                    inputs.push((lvl, ids.clone()));
                }
            }
        }
        if inputs.is_empty() {
            return None;
        }
        Some(HybridCompactionTask {
            kind: HybridTaskKind::PromoteHyperLevel,
            hyper_level: cur,
            input_levels: inputs,
            output_level,
            is_trivial_move: false,
            is_lower_level_bottom_level: output_level == self.options.num_levels - 1,
        })
    }

    /// Step 6: "if the tail has too many files, emit a small-file
    /// coalescing compaction bounded to 200 files."
    fn tail_coalesce(&self, snapshot: &LsmStroageState) -> Option<HybridCompactionTask> {
        const MAX_COALESCE_FILES: usize = 200;
        if self.tail_file_count(snapshot) <= self.options.max_open_files / 2 {
            return None;
        }
        let tail_level = self.options.num_levels - 1;
        let ids: Vec<usize> = get_level(snapshot, tail_level)?
            .1
            .iter()
            .copied()
            .take(MAX_COALESCE_FILES)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some(HybridCompactionTask {
            kind: HybridTaskKind::TailCoalesce,
            hyper_level: self.cur_num_hyper_levels(snapshot),
            input_levels: vec![(tail_level, ids)],
            output_level: tail_level,
            is_trivial_move: false,
            is_lower_level_bottom_level: true,
        })
    }

    /// Greedily selects adjacent files from the lowest level in `h`,
    /// expanding into higher levels' overlapping key ranges, bounded by the
    /// write-amplification guard and a 1 GiB output cap. Resumes past
    /// `prev_sub_compaction[H]`'s `last_key` rather than re-selecting the
    /// same head of the level every tick, wrapping back to the start of the
    /// level once the cursor has swept past its end.
    fn select_n_buffers(&self, h: usize, snapshot: &LsmStroageState, n_buffers: usize) -> HybridCompactionTask {
        let first = first_level_in_hyper(h, &self.options);
        let last = last_level_in_hyper(h, &self.options);
        let source_level = first;

        let cursor = self.prev_sub_compaction.lock().get(&h).cloned();
        let all_source_ids: Vec<usize> = get_level(snapshot, source_level)
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();
        let mut source_ids: Vec<usize> = match &cursor {
            Some(c) => all_source_ids
                .iter()
                .copied()
                .filter(|id| {
                    snapshot
                        .sstables
                        .get(id)
                        .map_or(true, |sst| sst.first_key() > &c.last_key)
                })
                .take(n_buffers)
                .collect(),
            None => all_source_ids.iter().copied().take(n_buffers).collect(),
        };
        if source_ids.is_empty() {
            // The cursor swept past the end of the level (or the level is
            // empty of a mid-cursor); wrap around and start a fresh sweep.
            source_ids = all_source_ids.into_iter().take(n_buffers).collect();
        }

        let mut inputs = vec![(source_level, source_ids.clone())];
        let source_bytes: u64 = source_ids
            .iter()
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|s| s.table_size())
            .sum();

        let mut smallest: Option<KeyBytes> = source_ids
            .iter()
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|s| s.first_key().clone())
            .min();
        let mut largest: Option<KeyBytes> = source_ids
            .iter()
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|s| s.last_key().clone())
            .max();

        let mut target_bytes = 0u64;
        for lvl in (source_level + 1)..=last {
            let Some((_, ids)) = get_level(snapshot, lvl) else {
                continue;
            };
            if ids.is_empty() {
                continue;
            }
            let (Some(lo), Some(hi)) = (smallest.as_ref(), largest.as_ref()) else {
                break;
            };
            // Files whose range falls inside/overlaps the currently
            // selected [smallest_key, largest_key] are pulled into the
            // compaction so the target level never ends up with two
            // unmerged, overlapping files.
            let overlapping: Vec<usize> = ids
                .iter()
                .copied()
                .filter(|id| {
                    snapshot
                        .sstables
                        .get(id)
                        .map_or(false, |sst| sst.first_key() <= hi && sst.last_key() >= lo)
                })
                .collect();
            if overlapping.is_empty() {
                continue;
            }
            let bytes: u64 = overlapping
                .iter()
                .filter_map(|id| snapshot.sstables.get(id))
                .map(|s| s.table_size())
                .sum();
            if target_bytes + bytes > 1024 * 1024 * 1024 {
                break;
            }
            if source_ids.len() >= n_buffers
                && target_bytes > 0
                && (target_bytes + bytes) as f64 / source_bytes.max(1) as f64 > 2.0
            {
                break;
            }
            target_bytes += bytes;
            for id in &overlapping {
                if let Some(sst) = snapshot.sstables.get(id) {
                    if smallest.as_ref().map_or(true, |s| sst.first_key() < s) {
                        smallest = Some(sst.first_key().clone());
                    }
                    if largest.as_ref().map_or(true, |l| sst.last_key() > l) {
                        largest = Some(sst.last_key().clone());
                    }
                }
            }
            inputs.push((lvl, overlapping));
        }

        let output_level = last;
        let trivial = inputs.len() == 1;

        if let Some(last_key) = largest.clone() {
            self.prev_sub_compaction.lock().insert(
                h,
                SubCompactionCursor {
                    output_level,
                    last_key,
                },
            );
        }

        HybridCompactionTask {
            kind: HybridTaskKind::LevelCompaction,
            hyper_level: h,
            input_levels: inputs,
            output_level,
            is_trivial_move: trivial,
            is_lower_level_bottom_level: output_level == self.options.num_levels - 1,
        }
    }

    /// Implements the §4.3 picking order; returns `None` when nothing is
    /// eligible for this tick. Never panics — a manual compaction in
    /// progress simply aborts automatic picking for the tick.
    pub fn pick_compaction(
        &self,
        snapshot: &LsmStroageState,
        running: &RunningDescriptor,
    ) -> Option<HybridCompactionTask> {
        if running.manual_compaction_running {
            return None;
        }
        let cur = self.cur_num_hyper_levels(snapshot);

        // Step 2: rearrange.
        for h in 1..=cur {
            if self.level_needs_rearrange(h, snapshot) && self.may_run_rearrange(h, running) {
                if let Some(task) = self.rearrange_level(h, snapshot) {
                    trace!("hybrid picker: rearrange in hyper-level {h}");
                    return Some(task);
                }
            }
        }

        // Step 3: space-amp-triggered promotion, then move-large-sst.
        if self.needs_promotion(cur, snapshot) && self.may_run_compaction(cur, cur, running) {
            if let Some(task) = self.promote_hyper_level(cur, snapshot) {
                info!("hybrid picker: promoting hyper-level {cur}");
                return Some(task);
            }
        }
        if self.needs_move_large_sst(cur, snapshot) && self.may_run_rearrange(cur - 1, running) {
            if let Some(task) = self.move_large_sst(cur, snapshot) {
                info!("hybrid picker: moving large SST out of hyper-level {}", cur - 1);
                return Some(task);
            }
        }

        // Step 4: L0 -> hyper-level 1.
        if snapshot.l0_sstables.len() >= self.options.level0_file_num_compaction_trigger
            && self.may_run_compaction(1, cur, running)
        {
            let m = clamp_multiplier(&self.options);
            let n_l0 = ((m as f64 * 1.5) as usize).max(1);
            let output_level = self.deepest_empty_level(1, snapshot).unwrap_or(first_level_in_hyper(1, &self.options));
            let l0_ids: Vec<usize> = snapshot.l0_sstables.iter().copied().take(n_l0).collect();
            debug!("hybrid picker: L0 -> hyper-level 1, {} files into level {output_level}", l0_ids.len());
            return Some(HybridCompactionTask {
                kind: HybridTaskKind::L0ToHyper1,
                hyper_level: 1,
                input_levels: vec![(usize::MAX, l0_ids)], // usize::MAX marks "L0" as the source
                output_level,
                is_trivial_move: false,
                is_lower_level_bottom_level: output_level == self.options.num_levels - 1,
            });
        }

        // Step 5: per-hyper-level compaction via SelectNBuffers.
        for h in 1..=cur {
            if self.need_to_run_level_compaction(h, cur, snapshot)
                && self.may_start_level_compaction(h, cur, snapshot, running)
            {
                let n_sub = (last_level_in_hyper(h, &self.options) - first_level_in_hyper(h, &self.options) + 1).max(1);
                info!("hybrid picker: level compaction in hyper-level {h}");
                return Some(self.select_n_buffers(h, snapshot, n_sub * 4));
            }
        }

        // Step 6: tail small-file coalescing.
        if self.may_run_compaction(cur, cur, running) {
            if let Some(task) = self.tail_coalesce(snapshot) {
                info!("hybrid picker: coalescing tail files");
                return Some(task);
            }
        }

        None
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStroageState,
        task: &HybridCompactionTask,
        output: &[usize],
    ) -> (LsmStroageState, Vec<usize>) {
        let mut state = snapshot.clone();
        let mut removed_l0: HashSet<usize> = HashSet::new();
        let mut files_to_remove = Vec::new();

        for (level, ids) in &task.input_levels {
            if *level == usize::MAX {
                removed_l0.extend(ids.iter().copied());
                files_to_remove.extend(ids.iter().copied());
                continue;
            }
            if let Some(slot) = state.levels.get_mut(level_idx(*level)) {
                let before = slot.1.len();
                let removing: HashSet<usize> = ids.iter().copied().collect();
                slot.1.retain(|id| !removing.contains(id));
                files_to_remove.extend(ids.iter().copied());
                debug_assert_eq!(before - slot.1.len(), ids.len());
            }
        }
        if !removed_l0.is_empty() {
            state.l0_sstables.retain(|id| !removed_l0.contains(id));
        }

        let output_idx = level_idx(task.output_level);
        while state.levels.len() <= output_idx {
            state.levels.push((state.levels.len() + 1, Vec::new()));
        }
        state.levels[output_idx].1.extend(output.iter().copied());
        (state, files_to_remove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    fn empty_state(num_levels: usize) -> LsmStroageState {
        LsmStroageState {
            memtable: Arc::new(crate::mem_table::MemTable::create(0)),
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels: (1..=num_levels - 1).map(|l| (l, Vec::new())).collect(),
            sstables: StdHashMap::new(),
        }
    }

    #[test]
    fn hyper_level_bounds_are_contiguous_and_windowed() {
        let opts = HybridCompactionOptions::default();
        assert_eq!(first_level_in_hyper(0, &opts), 0);
        assert_eq!(last_level_in_hyper(0, &opts), 0);
        assert_eq!(first_level_in_hyper(1, &opts), 1);
        assert_eq!(last_level_in_hyper(1, &opts), 2);
        assert_eq!(first_level_in_hyper(2, &opts), 3);
    }

    #[test]
    fn boundary_picker_l0_to_h1() {
        let opts = HybridCompactionOptions {
            level0_file_num_compaction_trigger: 2,
            ..Default::default()
        };
        let controller = HybridCompactionController::new(opts.clone());
        let mut state = empty_state(opts.num_levels);
        state.l0_sstables = vec![10, 11, 12];

        let running = RunningDescriptor::default();
        let task = controller.pick_compaction(&state, &running).expect("task expected");
        assert_eq!(task.kind, HybridTaskKind::L0ToHyper1);
        assert_eq!(task.output_level, first_level_in_hyper(1, &opts));
    }

    #[test]
    fn boundary_picker_rearrange() {
        let opts = HybridCompactionOptions {
            levels_per_hyper: 3,
            ..Default::default()
        };
        let controller = HybridCompactionController::new(opts.clone());
        let mut state = empty_state(opts.num_levels);
        // hyper-level 1 spans levels 1..=3; levels {1,3} non-empty, 2 empty.
        state.levels[0] = (1, vec![100]); // level 1 -> vec index 0
        state.levels[2] = (3, vec![300]); // level 3 -> vec index 2

        let running = RunningDescriptor::default();
        let task = controller.pick_compaction(&state, &running).expect("rearrange expected");
        assert_eq!(task.kind, HybridTaskKind::Rearrange);
        assert_eq!(task.output_level, last_level_in_hyper(1, &opts));
        assert!(task.is_trivial_move);
        let moved: Vec<usize> = task
            .input_levels
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        assert!(moved.contains(&100));
        assert!(moved.contains(&300));
    }

    #[test]
    fn manual_compaction_suppresses_automatic_picking() {
        let opts = HybridCompactionOptions::default();
        let controller = HybridCompactionController::new(opts.clone());
        let mut state = empty_state(opts.num_levels);
        state.l0_sstables = vec![1, 2, 3, 4, 5];
        let running = RunningDescriptor {
            manual_compaction_running: true,
            ..Default::default()
        };
        assert!(controller.pick_compaction(&state, &running).is_none());
        assert!(!controller.needs_compaction(&state, &running));
    }

    #[test]
    fn apply_compaction_result_targets_correct_vec_index() {
        let opts = HybridCompactionOptions::default();
        let controller = HybridCompactionController::new(opts.clone());
        let state = empty_state(opts.num_levels);
        let task = HybridCompactionTask {
            kind: HybridTaskKind::Rearrange,
            hyper_level: 1,
            input_levels: vec![],
            output_level: 1, // absolute level 1 -> vec index 0
            is_trivial_move: true,
            is_lower_level_bottom_level: false,
        };
        let (new_state, removed) = controller.apply_compaction_result(&state, &task, &[42]);
        assert!(removed.is_empty());
        assert_eq!(new_state.levels[0], (1, vec![42]));
    }

    #[test]
    fn tail_coalesce_is_picked_when_tail_overflows_files() {
        let opts = HybridCompactionOptions {
            max_open_files: 10,
            ..Default::default()
        };
        let controller = HybridCompactionController::new(opts.clone());
        let mut state = empty_state(opts.num_levels);
        let tail = opts.num_levels - 2; // vec index of the last level
        state.levels[tail] = (opts.num_levels - 1, (0..20).collect());

        let running = RunningDescriptor::default();
        let task = controller.pick_compaction(&state, &running).expect("tail coalesce expected");
        assert_eq!(task.kind, HybridTaskKind::TailCoalesce);
        assert!(task.input_levels[0].1.len() <= 200);
    }
}
