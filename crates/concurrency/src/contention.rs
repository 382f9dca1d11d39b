//! Timestamp-based contention manager
//!
//! Decides which of two conflicting transactions backs off when one meets a
//! lock held by the other.
//!
//! ## Policy
//!
//! - A transaction starts in the *timid phase*: it has no priority and always
//!   yields.
//! - When its write set reaches `timestamp_threshold` entries it draws a
//!   priority timestamp from a global counter. Lower timestamps win.
//! - A prioritized transaction that meets a lower-priority holder flags the
//!   holder aborted and proceeds; against a higher-priority holder it yields,
//!   unless the holder is already flagged (a lost cause).
//! - After a rollback the thread waits a random number of cycles drawn from
//!   `[0, consecutive_aborts * wait_cycles_multiplier)`.
//!
//! ## Cross-thread flag
//!
//! `aborted` is written by other threads with `Relaxed` ordering. It may be
//! observed late. That never causes unsoundness, only a missed fast-abort:
//! the flagged transaction still has to pass commit-time validation.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tmdb_core::{Error, Result, ThreadSlot, Version, MAX_THREADS};
use tracing::{debug, warn};

/// Timestamp of a transaction still in the timid phase.
pub const UNSET: u64 = u64::MAX;

/// Contention manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionConfig {
    /// Number of thread slots (1..=128)
    pub max_threads: usize,
    /// Write-set size at which a transaction gets its priority
    pub timestamp_threshold: u32,
    /// Cap on the consecutive abort count used for backoff
    pub max_consecutive_aborts: u32,
    /// Backoff window per consecutive abort, in spin cycles
    pub wait_cycles_multiplier: u64,
    /// Spins on a held lock before a commit gives up
    pub lock_spin_limit: u32,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_THREADS,
            timestamp_threshold: 10,
            max_consecutive_aborts: 10,
            wait_cycles_multiplier: 8000,
            lock_spin_limit: 1 << 16,
        }
    }
}

impl ContentionConfig {
    /// Set the number of thread slots.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Set the priority threshold.
    pub fn timestamp_threshold(mut self, n: u32) -> Self {
        self.timestamp_threshold = n;
        self
    }

    /// Set the backoff multiplier.
    pub fn wait_cycles_multiplier(mut self, cycles: u64) -> Self {
        self.wait_cycles_multiplier = cycles;
        self
    }

    /// Set the commit-time lock spin limit.
    pub fn lock_spin_limit(mut self, spins: u32) -> Self {
        self.lock_spin_limit = spins;
        self
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 || self.max_threads > MAX_THREADS {
            return Err(Error::InvalidConfig(format!(
                "max_threads must be in 1..={}, got {}",
                MAX_THREADS, self.max_threads
            )));
        }
        if self.timestamp_threshold == 0 {
            return Err(Error::InvalidConfig(
                "timestamp_threshold must be positive".into(),
            ));
        }
        if self.max_consecutive_aborts == 0 || self.wait_cycles_multiplier == 0 {
            return Err(Error::InvalidConfig(
                "backoff bounds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`ContentionManager::should_abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep waiting for the lock; the holder has been told to abort or is
    /// already doomed
    Proceed,
    /// Back off: the holder outranks us, or we have no priority yet
    Yield,
    /// Someone already decided this transaction must abort
    AbortedByOthers,
}

impl Resolution {
    /// Check if the caller must abort.
    pub fn should_abort(self) -> bool {
        !matches!(self, Resolution::Proceed)
    }
}

/// Per-thread contention state, one cache line apart from its neighbours.
#[repr(align(64))]
#[derive(Debug)]
struct SlotState {
    aborted: AtomicBool,
    timestamp: AtomicU64,
    write_set_size: AtomicU32,
    abort_count: AtomicU32,
    rng: Mutex<SmallRng>,
}

impl SlotState {
    fn new(seed: u64) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            timestamp: AtomicU64::new(UNSET),
            write_set_size: AtomicU32::new(0),
            abort_count: AtomicU32::new(0),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

/// Registry of thread slots plus the priority policy over them.
#[derive(Debug)]
pub struct ContentionManager {
    config: ContentionConfig,
    /// Next priority timestamp
    counter: AtomicU64,
    /// Next unassigned slot
    next_slot: AtomicUsize,
    slots: Box<[SlotState]>,
}

impl ContentionManager {
    /// Create a manager with `config.max_threads` slots.
    pub fn new(config: ContentionConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.max_threads)
            .map(|i| SlotState::new(0x9E37_79B9_7F4A_7C15 ^ i as u64))
            .collect();
        Ok(Self {
            config,
            counter: AtomicU64::new(0),
            next_slot: AtomicUsize::new(0),
            slots,
        })
    }

    /// Settings in effect.
    pub fn config(&self) -> &ContentionConfig {
        &self.config
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Hand out the next free slot to a starting worker.
    pub fn register(&self) -> Result<ThreadSlot> {
        let index = self.next_slot.fetch_add(1, Ordering::Relaxed);
        if index >= self.slots.len() {
            self.next_slot.fetch_sub(1, Ordering::Relaxed);
            warn!(capacity = self.slots.len(), "no free thread slot");
            return Err(Error::SlotsExhausted {
                capacity: self.slots.len(),
            });
        }
        ThreadSlot::new(index)
    }

    #[inline]
    fn state(&self, slot: ThreadSlot) -> &SlotState {
        &self.slots[slot.index()]
    }

    /// Reset a slot when its transaction begins.
    ///
    /// A restart keeps the abort count and the priority timestamp so that
    /// repeated contention escalates instead of starting over.
    pub fn start(&self, slot: ThreadSlot, restarted: bool) {
        let state = self.state(slot);
        state.aborted.store(false, Ordering::Relaxed);
        state.write_set_size.store(0, Ordering::Relaxed);
        if !restarted {
            state.timestamp.store(UNSET, Ordering::Relaxed);
            state.abort_count.store(0, Ordering::Relaxed);
        }
    }

    /// Count a write; leaves the timid phase at the threshold.
    pub fn on_write(&self, slot: ThreadSlot) {
        let state = self.state(slot);
        let size = state.write_set_size.fetch_add(1, Ordering::Relaxed) + 1;
        if size == self.config.timestamp_threshold
            && state.timestamp.load(Ordering::Relaxed) == UNSET
        {
            let ts = self.counter.fetch_add(1, Ordering::Relaxed);
            state.timestamp.store(ts, Ordering::Relaxed);
            debug!(%slot, timestamp = ts, "transaction prioritized");
        }
    }

    /// Decide whether `slot` must abort on meeting a lock held as `held`.
    ///
    /// A word that is not locked, or locked by `slot` itself, imposes no
    /// contention and yields [`Resolution::Proceed`].
    pub fn should_abort(&self, slot: ThreadSlot, held: Version) -> Resolution {
        let me = self.state(slot);
        if me.aborted.load(Ordering::Relaxed) {
            return Resolution::AbortedByOthers;
        }

        let my_ts = me.timestamp.load(Ordering::Relaxed);
        if my_ts == UNSET {
            return Resolution::Yield;
        }

        let owner_slot = match held.owner() {
            Some(owner) if owner != slot && owner.index() < self.slots.len() => owner,
            _ => return Resolution::Proceed,
        };
        let owner = self.state(owner_slot);

        if owner.timestamp.load(Ordering::Relaxed) < my_ts {
            if owner.aborted.load(Ordering::Relaxed) {
                Resolution::Proceed
            } else {
                Resolution::Yield
            }
        } else {
            owner.aborted.store(true, Ordering::Relaxed);
            debug!(%slot, victim = %owner_slot, "flagged lower-priority holder");
            Resolution::Proceed
        }
    }

    /// Back off after an abort. Returns the number of cycles waited.
    pub fn on_rollback(&self, slot: ThreadSlot) -> u64 {
        let state = self.state(slot);
        let count = state.abort_count.load(Ordering::Relaxed);
        let count = if count < self.config.max_consecutive_aborts {
            state.abort_count.store(count + 1, Ordering::Relaxed);
            count + 1
        } else {
            count
        };

        let window = self.backoff_window(count);
        let cycles = state.rng.lock().gen_range(0..window);
        wait_cycles(cycles);
        cycles
    }

    /// Exclusive upper bound of the wait after `aborts` consecutive aborts.
    fn backoff_window(&self, aborts: u32) -> u64 {
        u64::from(aborts.max(1)).saturating_mul(self.config.wait_cycles_multiplier)
    }

    /// Check the cross-thread abort flag.
    pub fn is_aborted(&self, slot: ThreadSlot) -> bool {
        self.state(slot).aborted.load(Ordering::Relaxed)
    }

    /// Priority timestamp, or `None` while timid.
    pub fn priority(&self, slot: ThreadSlot) -> Option<u64> {
        match self.state(slot).timestamp.load(Ordering::Relaxed) {
            UNSET => None,
            ts => Some(ts),
        }
    }

    /// Consecutive aborts counted so far.
    pub fn abort_count(&self, slot: ThreadSlot) -> u32 {
        self.state(slot).abort_count.load(Ordering::Relaxed)
    }

    /// Writes counted in the current attempt.
    pub fn write_set_size(&self, slot: ThreadSlot) -> u32 {
        self.state(slot).write_set_size.load(Ordering::Relaxed)
    }
}

fn wait_cycles(cycles: u64) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmdb_core::VersionWord;

    static_assertions::const_assert!(std::mem::align_of::<SlotState>() >= 64);

    fn manager() -> ContentionManager {
        ContentionManager::new(ContentionConfig::default()).unwrap()
    }

    fn prioritize(cm: &ContentionManager, slot: ThreadSlot) {
        for _ in 0..cm.config().timestamp_threshold {
            cm.on_write(slot);
        }
    }

    /// Version word as seen while `slot` holds it.
    fn held_by(slot: ThreadSlot) -> Version {
        let word = VersionWord::new(0);
        word.acquire(slot);
        word.load()
    }

    #[test]
    fn test_register_hands_out_distinct_slots() {
        let cm = ContentionManager::new(ContentionConfig::default().max_threads(3)).unwrap();
        let a = cm.register().unwrap();
        let b = cm.register().unwrap();
        let c = cm.register().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert!(matches!(
            cm.register(),
            Err(Error::SlotsExhausted { capacity: 3 })
        ));
    }

    #[test]
    fn test_priority_assigned_at_threshold() {
        let cm = manager();
        let slot = cm.register().unwrap();
        cm.start(slot, false);

        for _ in 0..9 {
            cm.on_write(slot);
        }
        assert_eq!(cm.priority(slot), None);

        cm.on_write(slot);
        assert_eq!(cm.priority(slot), Some(0));

        // Further writes keep the same timestamp
        cm.on_write(slot);
        assert_eq!(cm.priority(slot), Some(0));
        assert_eq!(cm.write_set_size(slot), 11);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let cm = manager();
        let a = cm.register().unwrap();
        let b = cm.register().unwrap();
        prioritize(&cm, a);
        prioritize(&cm, b);
        assert!(cm.priority(a).unwrap() < cm.priority(b).unwrap());
    }

    #[test]
    fn test_timid_transaction_always_yields() {
        let cm = manager();
        let timid = cm.register().unwrap();
        let other = cm.register().unwrap();
        cm.start(timid, false);
        cm.start(other, false);

        // Against a timid holder
        assert_eq!(cm.should_abort(timid, held_by(other)), Resolution::Yield);

        // Against a prioritized holder
        prioritize(&cm, other);
        assert_eq!(cm.should_abort(timid, held_by(other)), Resolution::Yield);

        // Against a holder flagged aborted
        cm.state(other).aborted.store(true, Ordering::Relaxed);
        assert_eq!(cm.should_abort(timid, held_by(other)), Resolution::Yield);
        assert!(!cm.is_aborted(timid));
    }

    #[test]
    fn test_older_transaction_wins() {
        let cm = manager();
        let slots: Vec<_> = (0..3).map(|_| cm.register().unwrap()).collect();
        let (a, b) = (slots[1], slots[2]);

        // Burn timestamps so that A gets 5 and B gets 9
        cm.counter.store(5, Ordering::Relaxed);
        prioritize(&cm, a);
        cm.counter.store(9, Ordering::Relaxed);
        prioritize(&cm, b);
        assert_eq!(cm.priority(a), Some(5));
        assert_eq!(cm.priority(b), Some(9));

        // B meets A's lock: B yields and A stays alive
        assert_eq!(cm.should_abort(b, held_by(a)), Resolution::Yield);
        assert!(!cm.is_aborted(a));

        // A meets B's lock: A proceeds and B is flagged
        assert_eq!(cm.should_abort(a, held_by(b)), Resolution::Proceed);
        assert!(cm.is_aborted(b));

        // Flagged B is short-circuited from now on
        assert_eq!(
            cm.should_abort(b, held_by(a)),
            Resolution::AbortedByOthers
        );
    }

    #[test]
    fn test_doomed_owner_does_not_block() {
        let cm = manager();
        let a = cm.register().unwrap();
        let b = cm.register().unwrap();
        prioritize(&cm, a);
        prioritize(&cm, b);
        cm.state(a).aborted.store(true, Ordering::Relaxed);

        assert_eq!(cm.should_abort(b, held_by(a)), Resolution::Proceed);
    }

    #[test]
    fn test_own_or_free_lock_is_no_contention() {
        let cm = manager();
        let a = cm.register().unwrap();
        prioritize(&cm, a);
        assert_eq!(cm.should_abort(a, held_by(a)), Resolution::Proceed);
        assert_eq!(cm.should_abort(a, Version::default()), Resolution::Proceed);
    }

    #[test]
    fn test_restart_preserves_history() {
        let cm = manager();
        let slot = cm.register().unwrap();
        cm.start(slot, false);
        prioritize(&cm, slot);
        cm.on_rollback(slot);
        cm.on_rollback(slot);
        cm.state(slot).aborted.store(true, Ordering::Relaxed);

        cm.start(slot, true);
        assert!(!cm.is_aborted(slot));
        assert_eq!(cm.write_set_size(slot), 0);
        assert_eq!(cm.abort_count(slot), 2);
        assert_eq!(cm.priority(slot), Some(0));

        cm.start(slot, false);
        assert_eq!(cm.abort_count(slot), 0);
        assert_eq!(cm.priority(slot), None);
    }

    #[test]
    fn test_backoff_bound() {
        let cm = manager();
        let slot = cm.register().unwrap();
        cm.start(slot, false);
        for round in 1..=25u64 {
            let waited = cm.on_rollback(slot);
            let cap = round.min(10) * 8000;
            assert!(waited < cap, "round {}: waited {} >= {}", round, waited, cap);
        }
        assert_eq!(cm.abort_count(slot), 10);
    }

    #[test]
    fn test_backoff_window_saturates() {
        let config = ContentionConfig::default().wait_cycles_multiplier(u64::MAX / 3);
        let cm = ContentionManager::new(config).unwrap();
        assert_eq!(cm.backoff_window(1), u64::MAX / 3);
        assert_eq!(cm.backoff_window(10), u64::MAX);
        assert_eq!(cm.backoff_window(0), u64::MAX / 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(ContentionConfig::default().validate().is_ok());
        assert!(ContentionConfig::default().max_threads(0).validate().is_err());
        assert!(ContentionConfig::default().max_threads(129).validate().is_err());
        assert!(ContentionConfig::default()
            .timestamp_threshold(0)
            .validate()
            .is_err());
        assert!(ContentionConfig::default()
            .wait_cycles_multiplier(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_deserialize_with_defaults() {
        let config: ContentionConfig =
            serde_json::from_str(r#"{"timestamp_threshold": 4}"#).unwrap();
        assert_eq!(config.timestamp_threshold, 4);
        assert_eq!(config.max_threads, MAX_THREADS);
        assert_eq!(config.wait_cycles_multiplier, 8000);
    }
}
