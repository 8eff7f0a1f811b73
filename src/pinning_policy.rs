//! Scoped pinning policy (C4): decides which metadata blocks survive in the
//! block cache by admitting or rejecting a pin against a capacity budget.
//! Three tiers are layered — `None`, `FlushedAndSimilar`, `All` — with a
//! `Fallback` tier that defers to a configured secondary tier. Fallback is
//! explicitly not recursive: a `Fallback` tier cannot itself point at
//! another `Fallback`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCategory {
    TopLevel,
    Partition,
    Other,
}

/// Why a block is pinned, orthogonal to `PinCategory` (which says which
/// kind of block it is). A table-reader pin lives as long as the SSTable
/// handle; a compaction pin is released as soon as that compaction's input
/// iterators are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRole {
    TableReader,
    Compaction,
}

#[derive(Debug, Clone, Copy)]
pub struct TablePinningInfo {
    pub level: usize,
    pub is_last_level_with_data: bool,
    pub owner_id: usize,
    pub file_size: u64,
    pub max_l0_meta_pin_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PinnedEntry {
    pub level: usize,
    pub is_last_level_with_data: bool,
    pub category: PinCategory,
    pub owner_id: usize,
    pub role: PinRole,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ScopedPolicyBudget {
    pub capacity: u64,
    pub last_level_with_data_percent: u8,
    pub mid_percent: u8,
}

impl Default for ScopedPolicyBudget {
    fn default() -> Self {
        Self {
            capacity: 8 * 1024 * 1024,
            last_level_with_data_percent: 0,
            mid_percent: 0,
        }
    }
}

/// A capacity bucket tracked with a single atomic counter; admission is a
/// compare-and-add loop so concurrent callers never overshoot the bucket.
struct Bucket {
    capacity: u64,
    usage: AtomicU64,
}

impl Bucket {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            usage: AtomicU64::new(0),
        }
    }

    fn try_admit(&self, size: u64) -> bool {
        loop {
            let current = self.usage.load(Ordering::Relaxed);
            let next = current + size;
            if next > self.capacity {
                return false;
            }
            if self
                .usage
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, size: u64) {
        self.usage.fetch_sub(size, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningTier {
    None,
    FlushedAndSimilar,
    All,
    Fallback,
}

pub struct PinningPolicy {
    budget: ScopedPolicyBudget,
    global: Bucket,
    last_level: Bucket,
    mid: Bucket,
    tier: PinningTier,
    fallback: Mutex<Option<Box<PinningPolicy>>>,
}

impl PinningPolicy {
    pub fn new(tier: PinningTier, budget: ScopedPolicyBudget) -> Self {
        assert_ne!(
            tier,
            PinningTier::Fallback,
            "a policy's own tier must resolve to a concrete tier; attach a fallback instead"
        );
        let last_level_cap = budget.capacity * budget.last_level_with_data_percent as u64 / 100;
        let mid_cap = budget.capacity * budget.mid_percent as u64 / 100;
        Self {
            budget,
            global: Bucket::new(budget.capacity),
            last_level: Bucket::new(last_level_cap),
            mid: Bucket::new(mid_cap),
            tier,
            fallback: Mutex::new(None),
        }
    }

    /// Attaches a secondary tier consulted when this policy's own rule
    /// rejects a pin. Attaching a policy whose tier is itself a fallback
    /// chain is rejected — recursion is not permitted.
    pub fn with_fallback(self, fallback: PinningPolicy) -> Self {
        assert!(
            fallback.fallback.lock().unwrap().is_none(),
            "fallback tiers cannot themselves chain a fallback"
        );
        *self.fallback.lock().unwrap() = Some(Box::new(fallback));
        self
    }

    fn bucket_for(&self, info: &TablePinningInfo) -> &Bucket {
        if info.is_last_level_with_data && self.budget.last_level_with_data_percent > 0 {
            &self.last_level
        } else if info.level > 0 && self.budget.mid_percent > 0 {
            &self.mid
        } else {
            &self.global
        }
    }

    fn admitted_by_tier(&self, info: &TablePinningInfo) -> bool {
        match self.tier {
            PinningTier::None => false,
            PinningTier::All => true,
            PinningTier::FlushedAndSimilar => {
                info.level == 0 && info.file_size <= info.max_l0_meta_pin_size
            }
            PinningTier::Fallback => unreachable!("constructed with a concrete tier"),
        }
    }

    /// Attempts to admit a pin of `size` bytes for the table described by
    /// `info`. Returns the recorded entry on success.
    pub fn try_pin(
        &self,
        info: TablePinningInfo,
        size: u64,
        category: PinCategory,
        role: PinRole,
    ) -> Option<PinnedEntry> {
        if self.admitted_by_tier(&info) && self.bucket_for(&info).try_admit(size) {
            return Some(PinnedEntry {
                level: info.level,
                is_last_level_with_data: info.is_last_level_with_data,
                category,
                owner_id: info.owner_id,
                role,
                size,
            });
        }
        let fallback = self.fallback.lock().unwrap();
        fallback
            .as_ref()
            .and_then(|f| f.try_pin(info, size, category, role))
    }

    pub fn release(&self, entry: &PinnedEntry) {
        let info = TablePinningInfo {
            level: entry.level,
            is_last_level_with_data: entry.is_last_level_with_data,
            owner_id: entry.owner_id,
            file_size: entry.size,
            max_l0_meta_pin_size: u64::MAX,
        };
        self.bucket_for(&info).release(entry.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(level: usize, is_last: bool, file_size: u64) -> TablePinningInfo {
        TablePinningInfo {
            level,
            is_last_level_with_data: is_last,
            owner_id: 0,
            file_size,
            max_l0_meta_pin_size: 1024,
        }
    }

    #[test]
    fn none_tier_never_admits() {
        let policy = PinningPolicy::new(PinningTier::None, ScopedPolicyBudget::default());
        assert!(policy
            .try_pin(info(0, false, 10), 10, PinCategory::Other, PinRole::TableReader)
            .is_none());
    }

    #[test]
    fn flushed_and_similar_admits_small_l0_only() {
        let policy = PinningPolicy::new(PinningTier::FlushedAndSimilar, ScopedPolicyBudget::default());
        assert!(policy
            .try_pin(info(0, false, 100), 100, PinCategory::TopLevel, PinRole::TableReader)
            .is_some());
        assert!(policy
            .try_pin(info(1, false, 100), 100, PinCategory::Other, PinRole::TableReader)
            .is_none());
        assert!(policy
            .try_pin(info(0, false, 2000), 2000, PinCategory::Other, PinRole::TableReader)
            .is_none());
    }

    #[test]
    fn fallback_is_consulted_but_not_chained() {
        let secondary = PinningPolicy::new(PinningTier::All, ScopedPolicyBudget::default());
        let primary = PinningPolicy::new(PinningTier::None, ScopedPolicyBudget::default())
            .with_fallback(secondary);
        assert!(primary
            .try_pin(info(0, false, 10), 10, PinCategory::Other, PinRole::TableReader)
            .is_some());
    }

    #[test]
    fn capacity_budget_is_enforced() {
        let budget = ScopedPolicyBudget {
            capacity: 100,
            last_level_with_data_percent: 0,
            mid_percent: 0,
        };
        let policy = PinningPolicy::new(PinningTier::All, budget);
        assert!(policy
            .try_pin(info(0, false, 60), 60, PinCategory::Other, PinRole::TableReader)
            .is_some());
        assert!(policy
            .try_pin(info(0, false, 60), 60, PinCategory::Other, PinRole::TableReader)
            .is_none());
    }

    #[test]
    fn compaction_pin_releases_independently_of_role() {
        let policy = PinningPolicy::new(PinningTier::All, ScopedPolicyBudget::default());
        let entry = policy
            .try_pin(info(0, false, 10), 10, PinCategory::Other, PinRole::Compaction)
            .expect("admitted");
        assert_eq!(entry.role, PinRole::Compaction);
        policy.release(&entry);
        assert!(policy
            .try_pin(info(0, false, 10), 10, PinCategory::Other, PinRole::TableReader)
            .is_some());
    }
}
