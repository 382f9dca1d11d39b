//! Transaction manager for coordinating commit operations
//!
//! Drives the per-object commit protocol ([`Shared`]) over a transaction's
//! items and owns the global commit tid counter.
//!
//! ## Commit Sequence
//!
//! ```text
//! 0. Fail fast if another transaction flagged this one
//! 1. lock()    every item with a buffered write
//! 2. Allocate commit tid (increment global version)
//! 3. check()   every item with an observed version
//! 4. install() every item with a buffered write
//! 5. unlock()  every item still holding a lock
//! 6. cleanup(committed = true) every item
//! ```
//!
//! If any of steps 0, 1 or 3 fails, the locks taken so far are released and
//! every item gets `cleanup(committed = false)`. Nothing has been installed at
//! that point, so the abort leaves no trace in shared state beyond what the
//! structures' cleanups undo.
//!
//! ## Retry
//!
//! [`TransactionManager::run`] re-executes a transaction body until it
//! commits, backing off through the contention manager between attempts.

use crate::contention::{ContentionManager, Resolution};
use crate::transaction::{Shared, TransItem, Transaction, TransactionStatus};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tmdb_core::{AbortReason, Error, Result, ThreadSlot, VersionWord};
use tracing::{debug, warn};

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Attempts before [`TransactionManager::run`] gives up
    pub max_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 100_000,
        }
    }
}

impl TransactionConfig {
    /// Set the attempt limit.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// CommitContext
// ============================================================================

/// Commit-time view handed to [`Shared`] callbacks.
pub struct CommitContext<'a> {
    slot: ThreadSlot,
    commit_tid: u64,
    contention: &'a ContentionManager,
    failure: Cell<Option<AbortReason>>,
}

impl<'a> CommitContext<'a> {
    fn new(slot: ThreadSlot, contention: &'a ContentionManager) -> Self {
        Self {
            slot,
            commit_tid: 0,
            contention,
            failure: Cell::new(None),
        }
    }

    /// Committing thread's slot.
    pub fn slot(&self) -> ThreadSlot {
        self.slot
    }

    /// Commit tid; zero until the lock phase is over.
    pub fn commit_tid(&self) -> u64 {
        self.commit_tid
    }

    /// Record why a callback is about to fail the commit.
    pub fn fail(&self, reason: AbortReason) {
        if self.failure.get().is_none() {
            self.failure.set(Some(reason));
        }
    }

    fn failure_or(&self, default: AbortReason) -> AbortReason {
        self.failure.get().unwrap_or(default)
    }

    /// Lock `word` on behalf of `item`.
    ///
    /// A word this slot already holds counts as locked but leaves `item`
    /// unmarked, so it is released exactly once. Each round against a held
    /// word asks the contention manager; a yield or an exhausted spin budget
    /// fails the lock.
    pub fn try_lock(&self, item: &mut TransItem, word: &VersionWord) -> bool {
        if word.load().is_locked_by(self.slot) {
            return true;
        }
        let limit = self.contention.config().lock_spin_limit;
        let mut spins = 0u32;
        loop {
            match word.try_acquire(self.slot) {
                Ok(()) => {
                    item.set_locked(true);
                    return true;
                }
                Err(held) => match self.contention.should_abort(self.slot, held) {
                    Resolution::Proceed if spins < limit => {
                        spins += 1;
                        std::hint::spin_loop();
                    }
                    Resolution::Proceed => {
                        self.fail(AbortReason::LockContention);
                        return false;
                    }
                    Resolution::Yield => {
                        self.fail(AbortReason::PriorityLoss);
                        return false;
                    }
                    Resolution::AbortedByOthers => {
                        self.fail(AbortReason::AbortedByOthers);
                        return false;
                    }
                },
            }
        }
    }
}

// ============================================================================
// TransactionManager
// ============================================================================

/// Manages transaction lifecycle and commits
///
/// # Thread Safety
///
/// Commits run concurrently. Isolation comes from the version-word locks the
/// structures take in `lock`, not from a global commit lock; the manager only
/// serializes tid allocation.
#[derive(Debug)]
pub struct TransactionManager {
    /// Global version counter
    ///
    /// Monotonically increasing. Each commit attempt that passes the lock
    /// phase increments it by 1.
    version: AtomicU64,
    contention: Arc<ContentionManager>,
    config: TransactionConfig,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(contention: Arc<ContentionManager>, config: TransactionConfig) -> Self {
        Self {
            version: AtomicU64::new(0),
            contention,
            config,
        }
    }

    /// Shared contention manager.
    pub fn contention(&self) -> &Arc<ContentionManager> {
        &self.contention
    }

    /// Retry settings.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Register a worker thread.
    pub fn register(&self) -> Result<ThreadSlot> {
        self.contention.register()
    }

    /// Get current global version
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Allocate next commit tid
    ///
    /// Tids of aborted commits are never reused, so committed tids may have
    /// gaps.
    pub fn allocate_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Begin a fresh transaction on `slot`.
    pub fn begin(&self, slot: ThreadSlot) -> Transaction {
        Transaction::new(Arc::clone(&self.contention), slot, false)
    }

    /// Begin a retry on `slot`, keeping its contention history.
    pub fn restart(&self, slot: ThreadSlot) -> Transaction {
        Transaction::new(Arc::clone(&self.contention), slot, true)
    }

    /// Commit a transaction
    ///
    /// # Returns
    /// - `Ok(commit_tid)` on success
    /// - `Err(Error::Aborted { .. })` if a lock or validation failed; the
    ///   transaction is rolled back
    pub fn commit(&self, txn: &mut Transaction) -> Result<u64> {
        txn.ensure_active()?;
        let slot = txn.slot();

        // Step 0: someone with higher priority already decided
        if self.contention.is_aborted(slot) {
            return Err(self.fail(txn, AbortReason::AbortedByOthers));
        }

        let mut ctx = CommitContext::new(slot, &self.contention);

        // Step 1: lock write set
        let mut failure = None;
        for item in txn.items.iter_mut().filter(|item| item.has_write()) {
            let owner: Arc<dyn Shared> = Arc::clone(item.owner());
            if !owner.lock(item, &ctx) {
                failure = Some(ctx.failure_or(AbortReason::LockContention));
                break;
            }
        }
        if let Some(reason) = failure {
            return Err(self.fail(txn, reason));
        }

        // Step 2: allocate commit tid
        ctx.commit_tid = self.allocate_version();

        // Step 3: validate read set
        let valid = txn
            .items
            .iter()
            .filter(|item| item.has_read())
            .all(|item| item.owner().check(item, &ctx));
        if !valid {
            let reason = if self.contention.is_aborted(slot) {
                AbortReason::AbortedByOthers
            } else {
                ctx.failure_or(AbortReason::ValidationFailed)
            };
            return Err(self.fail(txn, reason));
        }

        // Step 4: install
        for item in txn.items.iter_mut().filter(|item| item.has_write()) {
            let owner = Arc::clone(item.owner());
            owner.install(item, &ctx);
        }

        // Step 5: unlock
        for item in txn.items.iter_mut().filter(|item| item.is_locked()) {
            let owner = Arc::clone(item.owner());
            owner.unlock(item);
            item.set_locked(false);
        }

        // Step 6: cleanup
        for item in txn.items.iter_mut() {
            let owner = Arc::clone(item.owner());
            owner.cleanup(item, slot, true);
        }

        let tid = ctx.commit_tid;
        txn.set_status(TransactionStatus::Committed { tid });
        debug!(%slot, tid, items = txn.len(), "transaction committed");
        Ok(tid)
    }

    fn fail(&self, txn: &mut Transaction, reason: AbortReason) -> Error {
        txn.rollback(reason);
        Error::aborted(reason)
    }

    /// Explicitly abort a transaction
    ///
    /// Every touched object gets `cleanup(committed = false)`.
    pub fn abort(&self, txn: &mut Transaction, reason: AbortReason) -> Result<()> {
        txn.ensure_active()?;
        txn.rollback(reason);
        Ok(())
    }

    /// Run `body` as a transaction on `slot` until it commits.
    ///
    /// Retryable errors from the body or the commit roll the attempt back,
    /// back off and re-run the body on a restarted transaction. Other errors
    /// roll back and are returned as-is.
    pub fn run<R, F>(&self, slot: ThreadSlot, mut body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        let mut txn = self.begin(slot);
        for attempt in 1..=self.config.max_retries {
            let outcome = body(&mut txn).and_then(|value| {
                self.commit(&mut txn)?;
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if txn.is_active() {
                        let reason = e.abort_reason().unwrap_or(AbortReason::ValidationFailed);
                        txn.rollback(reason);
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let wait_cycles = self.contention.on_rollback(slot);
                    debug!(%slot, attempt, wait_cycles, error = %e, "retrying transaction");
                    txn = self.restart(slot);
                }
            }
        }
        warn!(%slot, attempts = self.config.max_retries, "transaction retries exhausted");
        Err(Error::RetriesExhausted {
            attempts: self.config.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contention::ContentionConfig;
    use crate::transaction::{object_id, ItemKey, Key};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Versioned register: the simplest structure speaking the protocol.
    struct Register {
        word: VersionWord,
        value: Mutex<u64>,
        cleanups: Mutex<Vec<bool>>,
    }

    impl Register {
        fn new(value: u64) -> Arc<Self> {
            Arc::new(Self {
                word: VersionWord::new(0),
                value: Mutex::new(value),
                cleanups: Mutex::new(Vec::new()),
            })
        }

        fn read(self: &Arc<Self>, txn: &mut Transaction) -> u64 {
            let owner: Arc<dyn Shared> = self.clone();
            if let Some(v) = txn
                .find(object_id(&**self), ItemKey::Sentinel(0))
                .and_then(|item| item.write_value::<u64>())
            {
                return *v;
            }
            let version = self.word.load();
            let value = *self.value.lock();
            txn.item(&owner, Key::Sentinel(0)).add_read(version);
            value
        }

        fn write(self: &Arc<Self>, txn: &mut Transaction, value: u64) {
            let owner: Arc<dyn Shared> = self.clone();
            txn.item(&owner, Key::Sentinel(0)).add_write(value);
        }
    }

    impl Shared for Register {
        fn lock(&self, item: &mut TransItem, ctx: &CommitContext<'_>) -> bool {
            ctx.try_lock(item, &self.word)
        }

        fn check(&self, item: &TransItem, ctx: &CommitContext<'_>) -> bool {
            let current = self.word.load();
            let observed = item.read_version().unwrap_or_default();
            current.same_version(observed)
                && (!current.is_locked() || current.is_locked_by(ctx.slot()))
        }

        fn install(&self, item: &mut TransItem, ctx: &CommitContext<'_>) {
            if let Some(v) = item.write_value::<u64>() {
                *self.value.lock() = *v;
            }
            self.word.set_version(ctx.commit_tid());
        }

        fn unlock(&self, _item: &mut TransItem) {
            self.word.release();
        }

        fn cleanup(&self, _item: &mut TransItem, _slot: ThreadSlot, committed: bool) {
            self.cleanups.lock().push(committed);
        }
    }

    fn manager() -> TransactionManager {
        let cm = Arc::new(ContentionManager::new(ContentionConfig::default()).unwrap());
        TransactionManager::new(cm, TransactionConfig::default())
    }

    #[test]
    fn test_allocate_version_is_monotonic() {
        let tm = manager();
        assert_eq!(tm.current_version(), 0);
        assert_eq!(tm.allocate_version(), 1);
        assert_eq!(tm.allocate_version(), 2);
        assert_eq!(tm.current_version(), 2);
    }

    #[test]
    fn test_commit_installs_and_cleans_up() {
        let tm = manager();
        let slot = tm.register().unwrap();
        let reg = Register::new(1);

        let mut txn = tm.begin(slot);
        let v = reg.read(&mut txn);
        reg.write(&mut txn, v + 1);
        assert_eq!(reg.read(&mut txn), 2);
        let tid = tm.commit(&mut txn).unwrap();

        assert_eq!(*reg.value.lock(), 2);
        assert_eq!(reg.word.load().sequence(), tid);
        assert!(!reg.word.load().is_locked());
        assert_eq!(*reg.cleanups.lock(), vec![true]);
        assert_eq!(txn.status(), TransactionStatus::Committed { tid });
    }

    #[test]
    fn test_stale_read_aborts() {
        let tm = manager();
        let a = tm.register().unwrap();
        let b = tm.register().unwrap();
        let reg = Register::new(10);

        let mut t1 = tm.begin(a);
        let v = reg.read(&mut t1);
        reg.write(&mut t1, v + 1);

        let mut t2 = tm.begin(b);
        reg.write(&mut t2, 99);
        tm.commit(&mut t2).unwrap();

        let err = tm.commit(&mut t1).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::ValidationFailed));
        assert_eq!(*reg.value.lock(), 99);
        assert!(!reg.word.load().is_locked());
        assert_eq!(*reg.cleanups.lock(), vec![true, false]);
    }

    #[test]
    fn test_timid_committer_yields_to_held_lock() {
        let tm = manager();
        let a = tm.register().unwrap();
        let b = tm.register().unwrap();
        let reg = Register::new(0);

        let mut txn = tm.begin(a);
        reg.write(&mut txn, 5);

        reg.word.acquire(b);
        let err = tm.commit(&mut txn).unwrap_err();
        reg.word.release();

        assert_eq!(err.abort_reason(), Some(AbortReason::PriorityLoss));
        assert_eq!(*reg.value.lock(), 0);
    }

    #[test]
    fn test_flagged_transaction_fails_fast() {
        let tm = manager();
        let a = tm.register().unwrap();
        let b = tm.register().unwrap();
        let reg = Register::new(0);

        let mut victim = tm.begin(b);
        reg.write(&mut victim, 1);

        // Make `a` old and `b` young, then let `a` meet `b`'s lock
        let mut winner = tm.begin(a);
        for _ in 0..10 {
            tm.contention().on_write(a);
        }
        for _ in 0..10 {
            tm.contention().on_write(b);
        }
        let word = VersionWord::new(0);
        word.acquire(b);
        assert_eq!(
            tm.contention().should_abort(a, word.load()),
            Resolution::Proceed
        );

        let err = tm.commit(&mut victim).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::AbortedByOthers));
        assert_eq!(*reg.cleanups.lock(), vec![false]);
        tm.abort(&mut winner, AbortReason::User).unwrap();
    }

    #[test]
    fn test_commit_twice_is_rejected() {
        let tm = manager();
        let slot = tm.register().unwrap();
        let mut txn = tm.begin(slot);
        tm.commit(&mut txn).unwrap();
        assert!(matches!(tm.commit(&mut txn), Err(Error::NotActive(_))));
        assert!(matches!(
            tm.abort(&mut txn, AbortReason::User),
            Err(Error::NotActive(_))
        ));
    }

    #[test]
    fn test_run_retries_until_commit() {
        let tm = manager();
        let slot = tm.register().unwrap();
        let reg = Register::new(0);
        let mut attempts = 0;

        let result = tm.run(slot, |txn| {
            attempts += 1;
            let v = reg.read(txn);
            if attempts < 3 {
                return Err(Error::aborted(AbortReason::ForeignInsert));
            }
            reg.write(txn, v + 7);
            Ok(v + 7)
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
        assert_eq!(tm.contention().abort_count(slot), 2);
        assert_eq!(*reg.cleanups.lock(), vec![false, false, true]);
    }

    #[test]
    fn test_run_gives_up() {
        let cm = Arc::new(ContentionManager::new(ContentionConfig::default()).unwrap());
        let tm = TransactionManager::new(cm, TransactionConfig::default().max_retries(4));
        let slot = tm.register().unwrap();

        let result: Result<()> = tm.run(slot, |_| Err(Error::Conflict("always".into())));
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 4 })));
    }

    #[test]
    fn test_run_does_not_retry_user_abort() {
        let tm = manager();
        let slot = tm.register().unwrap();
        let mut attempts = 0;
        let result: Result<()> = tm.run(slot, |_| {
            attempts += 1;
            Err(Error::aborted(AbortReason::User))
        });
        assert_eq!(result.unwrap_err().abort_reason(), Some(AbortReason::User));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_concurrent_increments_are_serializable() {
        let tm = Arc::new(manager());
        let reg = Register::new(0);
        let done = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tm = Arc::clone(&tm);
                let reg = Arc::clone(&reg);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let slot = tm.register().unwrap();
                    for _ in 0..250 {
                        tm.run(slot, |txn| {
                            let v = reg.read(txn);
                            reg.write(txn, v + 1);
                            Ok(())
                        })
                        .unwrap();
                        done.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(done.load(Ordering::Relaxed), 1000);
        assert_eq!(*reg.value.lock(), 1000);
        assert!(!reg.word.load().is_locked());
    }
}
