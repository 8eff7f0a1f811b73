//! Write Buffer Manager (C2): cross-database memory accounting, flush
//! initiation, and write stall/delay. One `WriteBufferManager` is shared by
//! every `LsmEngine` instance that opts into shared memory budgeting.
//!
//! The three counters `used`, `inactive`, and `being_freed` are atomics so
//! readers never take a lock just to check `should_flush`/`should_stall`.
//! The stall queue, the cache-reservation handle, and the initiator registry
//! each get their own mutex, matching the donor project's per-concern
//! locking rather than one big lock around the manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info, trace, warn};

/// The fraction of `flush_step` used by `should_initiate_another_flush`,
/// preserved from the donor project's `ShouldInitiateAnotherFlushMemOnly`
/// check against `step_size/2`. Kept as a named constant per the spec's
/// note that the fraction is tunable, not a magic literal.
const ANOTHER_FLUSH_STEP_FRACTION: f64 = 0.5;

/// Coarse rounding step used when mirroring `used` into an attached cache's
/// reservation, so the cache doesn't resize its dummy entry on every byte.
const DEFAULT_CACHE_RESERVATION_STEP: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct WriteBufferManagerOptions {
    /// Total budget across all attached DBs. `0` means disabled.
    pub buffer_size: usize,
    pub allow_stall: bool,
    /// Whether this manager drives flush initiation at all.
    pub enable_flush_initiation: bool,
    pub max_parallel_flushes: usize,
    pub cache_reservation_step: usize,
}

impl Default for WriteBufferManagerOptions {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024 * 1024,
            allow_stall: true,
            enable_flush_initiation: true,
            max_parallel_flushes: 1,
            cache_reservation_step: DEFAULT_CACHE_RESERVATION_STEP,
        }
    }
}

/// A callback a column family / memtable owner registers so the WBM can ask
/// it to flush without knowing its concrete type. Returns `true` if the
/// owner accepted the request (and will eventually call
/// `flush_started`/`flush_ended`), `false` if it declined this turn.
pub type FlushInitiatorCallback = Box<dyn Fn(usize) -> bool + Send + Sync>;

struct InitiatorEntry {
    owner: usize,
    callback: FlushInitiatorCallback,
}

/// An opaque handle a caller parks itself on while stalled. `block` must not
/// return until a matching `signal`.
pub struct StallHandle {
    signalled: Mutex<bool>,
    cv: Condvar,
}

impl Default for StallHandle {
    fn default() -> Self {
        Self {
            signalled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl StallHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn block(&self) {
        let mut signalled = self.signalled.lock().unwrap();
        while !*signalled {
            signalled = self.cv.wait(signalled).unwrap();
        }
    }

    pub fn signal(&self) {
        let mut signalled = self.signalled.lock().unwrap();
        *signalled = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct CacheReservation {
    step: usize,
    charged: usize,
}

struct FlushInitiationState {
    initiators: Vec<InitiatorEntry>,
    next_candidate_idx: usize,
    num_running_flushes: usize,
    num_flushes_to_initiate: usize,
}

/// Shared cross-database write-buffer accounting, flush initiation, and
/// stall controller.
pub struct WriteBufferManager {
    opts: Mutex<WriteBufferManagerOptions>,
    used: AtomicUsize,
    inactive: AtomicUsize,
    being_freed: AtomicUsize,

    cache_reservation: Mutex<CacheReservation>,

    stall_active: AtomicBool,
    stall_queue: Mutex<VecDeque<Arc<StallHandle>>>,

    flush_state: Mutex<FlushInitiationState>,
    initiation_cv: Condvar,
}

impl WriteBufferManager {
    pub fn new(opts: WriteBufferManagerOptions) -> Arc<Self> {
        let step = opts.cache_reservation_step;
        Arc::new(Self {
            opts: Mutex::new(opts),
            used: AtomicUsize::new(0),
            inactive: AtomicUsize::new(0),
            being_freed: AtomicUsize::new(0),
            cache_reservation: Mutex::new(CacheReservation { step, charged: 0 }),
            stall_active: AtomicBool::new(false),
            stall_queue: Mutex::new(VecDeque::new()),
            flush_state: Mutex::new(FlushInitiationState {
                initiators: Vec::new(),
                next_candidate_idx: 0,
                num_running_flushes: 0,
                num_flushes_to_initiate: 0,
            }),
            initiation_cv: Condvar::new(),
        })
    }

    fn buffer_size(&self) -> usize {
        self.opts.lock().unwrap().buffer_size
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer_size() > 0
    }

    pub fn memory_usage(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// `mutable = used − inactive`, the bytes still live in mutable
    /// memtables. `inactive` is read with acquire ordering so this never
    /// observes a torn update relative to `used`.
    pub fn mutable_memtable_memory_usage(&self) -> usize {
        let used = self.used.load(Ordering::Relaxed);
        let inactive = self.inactive.load(Ordering::Acquire);
        used.saturating_sub(inactive)
    }

    pub fn dummy_entries_in_cache_usage(&self) -> usize {
        self.cache_reservation.lock().unwrap().charged
    }

    pub fn buffer_size_bytes(&self) -> usize {
        self.buffer_size()
    }

    fn mutable_limit(&self) -> usize {
        // 7/8 of buffer_size, matching the donor project's stall-adjacent
        // headroom ratio.
        (self.buffer_size() as u128 * 7 / 8) as usize
    }

    fn flush_start_threshold(&self) -> usize {
        (self.buffer_size() as u128 * 4 / 5) as usize // 80%
    }

    /// `step` halves the buffer into coarse chunks; used both for cache
    /// mirroring and for the "another flush" test against `step/2`.
    fn flush_step(&self) -> usize {
        (self.buffer_size() / 4).max(1)
    }

    // ---- accounting -----------------------------------------------------

    pub fn reserve(&self, mem: usize) {
        let new_used = self.used.fetch_add(mem, Ordering::Relaxed) + mem;
        trace!("wbm reserve {mem} bytes, used={new_used}");
        self.mirror_to_cache(new_used);
        self.maybe_initiate_flush();
    }

    pub fn schedule_free(&self, mem: usize) {
        self.inactive.fetch_add(mem, Ordering::Release);
        trace!("wbm schedule_free {mem} bytes");
    }

    pub fn free_begin(&self, mem: usize) {
        self.being_freed.fetch_add(mem, Ordering::Relaxed);
        trace!("wbm free_begin {mem} bytes");
    }

    /// Reverts a `schedule_free`/`free_begin` pair — the bytes are live
    /// again. See DESIGN.md for the accepted accounting drift when this
    /// races a concurrent `flush_ended`.
    pub fn free_abort(&self, mem: usize) {
        self.inactive.fetch_sub(mem, Ordering::Relaxed);
        self.being_freed.fetch_sub(mem, Ordering::Relaxed);
        trace!("wbm free_abort {mem} bytes");
    }

    pub fn free(&self, mem: usize) {
        let new_used = self.used.fetch_sub(mem, Ordering::Relaxed) - mem;
        self.inactive.fetch_sub(mem, Ordering::Relaxed);
        self.being_freed.fetch_sub(mem, Ordering::Relaxed);
        debug!("wbm free {mem} bytes, used={new_used}");
        if let Some(cache) = self.cache_reservation.lock().ok() {
            let _ = cache;
        }
        self.trim_cache(new_used);
        self.maybe_end_write_stall();
    }

    pub fn set_buffer_size(&self, n: usize) {
        let mut opts = self.opts.lock().unwrap();
        opts.buffer_size = n;
        drop(opts);
        info!("wbm buffer_size set to {n}");
        self.maybe_end_write_stall();
        self.maybe_initiate_flush();
    }

    // ---- cache mirroring --------------------------------------------------

    fn round_up(value: usize, step: usize) -> usize {
        if step == 0 {
            return value;
        }
        value.div_ceil(step) * step
    }

    fn mirror_to_cache(&self, used: usize) {
        let mut cache = self.cache_reservation.lock().unwrap();
        let target = Self::round_up(used, cache.step);
        if target != cache.charged {
            cache.charged = target;
        }
    }

    fn trim_cache(&self, used: usize) {
        self.mirror_to_cache(used);
    }

    // ---- flush initiation ---------------------------------------------

    pub fn register_flush_initiator(&self, owner: usize, callback: FlushInitiatorCallback) {
        let mut state = self.flush_state.lock().unwrap();
        state.initiators.push(InitiatorEntry { owner, callback });
    }

    pub fn deregister_flush_initiator(&self, owner: usize) {
        let mut state = self.flush_state.lock().unwrap();
        state.initiators.retain(|e| e.owner != owner);
        if state.next_candidate_idx >= state.initiators.len() {
            state.next_candidate_idx = 0;
        }
    }

    pub fn flush_started(&self, _wbm_initiated: bool) {
        let mut state = self.flush_state.lock().unwrap();
        state.num_running_flushes += 1;
    }

    pub fn flush_ended(&self, _wbm_initiated: bool) {
        let mut state = self.flush_state.lock().unwrap();
        state.num_running_flushes = state.num_running_flushes.saturating_sub(1);
        drop(state);
        self.maybe_initiate_flush();
    }

    pub fn should_flush(&self) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.mutable_memtable_memory_usage() >= self.mutable_limit()
    }

    /// "A new flush is desired when `used - being_freed >= step/2` AND
    /// `used >= additional_flush_initiation_size`" (here taken to be the
    /// 80% threshold, matching `flush_start_threshold`).
    fn should_initiate_another_flush(&self) -> bool {
        let opts = self.opts.lock().unwrap();
        if !opts.enable_flush_initiation {
            return false;
        }
        drop(opts);
        let used = self.used.load(Ordering::Relaxed);
        let being_freed = self.being_freed.load(Ordering::Relaxed);
        let step = self.flush_step();
        let desired = (used.saturating_sub(being_freed)) as f64
            >= step as f64 * ANOTHER_FLUSH_STEP_FRACTION
            && used >= self.flush_start_threshold();
        desired
    }

    fn maybe_initiate_flush(&self) {
        if !self.should_initiate_another_flush() {
            return;
        }
        let mut state = self.flush_state.lock().unwrap();
        let opts = self.opts.lock().unwrap();
        let allowed = state.num_running_flushes + state.num_flushes_to_initiate
            < opts.max_parallel_flushes;
        drop(opts);
        if allowed {
            state.num_flushes_to_initiate += 1;
            drop(state);
            self.initiation_cv.notify_one();
        }
    }

    /// Drains `num_flushes_to_initiate` by calling initiator callbacks
    /// round-robin from `next_candidate_idx`. Meant to be called from a
    /// single dedicated initiation thread; exposed directly so callers can
    /// drive it without spawning a thread in tests.
    pub fn drain_pending_initiations(&self) {
        loop {
            let mut state = self.flush_state.lock().unwrap();
            if state.num_flushes_to_initiate == 0 || state.initiators.is_empty() {
                return;
            }
            let n = state.initiators.len();
            let start = state.next_candidate_idx;
            let mut accepted = false;
            for step in 0..n {
                let idx = (start + step) % n;
                let min_size = self.flush_step();
                let accepted_now = (state.initiators[idx].callback)(min_size);
                if accepted_now {
                    state.next_candidate_idx = (idx + 1) % n;
                    state.num_flushes_to_initiate -= 1;
                    accepted = true;
                    break;
                }
            }
            if !accepted {
                warn!("wbm: full initiator cycle without acceptance, will retry");
                return;
            }
        }
    }

    /// Spawns the dedicated initiation thread described in the spec: waits
    /// on a condvar, wakes on `maybe_initiate_flush`, drains pending
    /// initiations. Returns a join handle the caller should keep so the
    /// thread is not detached silently. `shutdown` is checked on every wakeup
    /// (including the 200ms poll) so the caller can stop the thread and join
    /// its handle without the manager itself needing a shutdown API.
    pub fn spawn_initiation_thread(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("wbm-initiation".to_string())
            .spawn(move || loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                {
                    let state = this.flush_state.lock().unwrap();
                    if state.num_flushes_to_initiate == 0 {
                        let _unused = this
                            .initiation_cv
                            .wait_timeout(state, std::time::Duration::from_millis(200))
                            .unwrap();
                    }
                }
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                this.drain_pending_initiations();
            })
            .expect("failed to spawn wbm initiation thread")
    }

    // ---- write delay ------------------------------------------------------

    /// Delay factor in `[0, 1]` growing linearly from the 80% threshold to
    /// `buffer_size`. Callers translate this into a local write-rate cap;
    /// the WBM itself never blocks on it (only stall blocks).
    pub fn write_delay_factor(&self) -> f64 {
        let buffer_size = self.buffer_size();
        if buffer_size == 0 {
            return 0.0;
        }
        let used = self.used.load(Ordering::Relaxed);
        let start = self.flush_start_threshold();
        if used < start {
            return 0.0;
        }
        let span = buffer_size.saturating_sub(start).max(1);
        ((used.saturating_sub(start)) as f64 / span as f64).min(1.0)
    }

    // ---- stall protocol ---------------------------------------------------

    pub fn should_stall(&self) -> bool {
        let opts = self.opts.lock().unwrap();
        if !opts.allow_stall {
            return false;
        }
        drop(opts);
        self.stall_active.load(Ordering::Relaxed) || self.used.load(Ordering::Relaxed) >= self.buffer_size()
    }

    /// Appends `handle` to the stall queue, marks the manager stalled, and
    /// blocks the caller on `handle` until a matching `signal`.
    pub fn begin_write_stall(&self, handle: Arc<StallHandle>) {
        {
            let mut queue = self.stall_queue.lock().unwrap();
            queue.push_back(Arc::clone(&handle));
            self.stall_active.store(true, Ordering::Relaxed);
        }
        warn!("wbm: write stall begin");
        handle.block();
    }

    /// Called after any release. If `used < buffer_size` or the manager is
    /// now disabled, pops every queued handle and signals each outside the
    /// lock.
    pub fn maybe_end_write_stall(&self) {
        let should_end = !self.is_enabled() || self.used.load(Ordering::Relaxed) < self.buffer_size();
        if !should_end {
            return;
        }
        let drained: Vec<_> = {
            let mut queue = self.stall_queue.lock().unwrap();
            if queue.is_empty() && !self.stall_active.load(Ordering::Relaxed) {
                return;
            }
            self.stall_active.store(false, Ordering::Relaxed);
            queue.drain(..).collect()
        };
        if !drained.is_empty() {
            info!("wbm: ending write stall, releasing {} waiter(s)", drained.len());
        }
        for handle in drained {
            handle.signal();
        }
    }

    /// Removes a specific handle from the queue (its DB is shutting down)
    /// and signals it so it doesn't block forever.
    pub fn remove_db(&self, handle: &Arc<StallHandle>) {
        let mut queue = self.stall_queue.lock().unwrap();
        queue.retain(|h| !Arc::ptr_eq(h, handle));
        drop(queue);
        handle.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn opts(buffer_size: usize) -> WriteBufferManagerOptions {
        WriteBufferManagerOptions {
            buffer_size,
            allow_stall: true,
            enable_flush_initiation: true,
            max_parallel_flushes: 1,
            cache_reservation_step: 4096,
        }
    }

    #[test]
    fn invariant_counters_return_to_zero() {
        let wbm = WriteBufferManager::new(opts(1024 * 1024));
        wbm.reserve(100);
        wbm.schedule_free(100);
        wbm.free_begin(100);
        wbm.free(100);
        assert_eq!(wbm.memory_usage(), 0);
        assert_eq!(wbm.inactive.load(Ordering::Relaxed), 0);
        assert_eq!(wbm.being_freed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn free_abort_reverts_schedule_and_begin() {
        let wbm = WriteBufferManager::new(opts(1024 * 1024));
        wbm.reserve(100);
        wbm.schedule_free(100);
        wbm.free_begin(100);
        wbm.free_abort(100);
        assert_eq!(wbm.inactive.load(Ordering::Relaxed), 0);
        assert_eq!(wbm.being_freed.load(Ordering::Relaxed), 0);
        assert_eq!(wbm.memory_usage(), 100);
        wbm.schedule_free(100);
        wbm.free_begin(100);
        wbm.free(100);
        assert_eq!(wbm.memory_usage(), 0);
    }

    #[test]
    fn boundary_wbm_stall() {
        let wbm = WriteBufferManager::new(opts(1024 * 1024));
        wbm.reserve(1024 * 1024);
        assert!(wbm.should_stall());

        let handle = StallHandle::new();
        let wbm2 = Arc::clone(&wbm);
        let handle2 = Arc::clone(&handle);
        let released = Arc::new(StdAtomicUsize::new(0));
        let released2 = Arc::clone(&released);
        let t = std::thread::spawn(move || {
            wbm2.begin_write_stall(handle2);
            released2.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        wbm.free(1024 * 1024);
        wbm.maybe_end_write_stall();
        t.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boundary_wbm_flush_initiation() {
        let wbm = WriteBufferManager::new(opts(10 * 1024 * 1024));
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        wbm.register_flush_initiator(
            1,
            Box::new(move |_min_size| {
                calls2.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        wbm.reserve(9 * 1024 * 1024);
        wbm.reserve(1);
        wbm.drain_pending_initiations();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        wbm.flush_started(true);
        wbm.free(5 * 1024 * 1024);
        wbm.flush_ended(true);
        wbm.drain_pending_initiations();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boundary_disabled_wbm() {
        let wbm = WriteBufferManager::new(opts(0));
        assert!(!wbm.is_enabled());
        assert!(wbm.should_flush());
        assert!(!wbm.should_stall());
        wbm.reserve(1000);
        wbm.free(1000);
    }
}
