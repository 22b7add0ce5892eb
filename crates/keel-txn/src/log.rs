//! The shared transaction log.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use keel_common::types::{PageId, TxnId};

use crate::config::TxnLogConfig;
use crate::error::{TxnLogError, TxnLogResult};
use crate::record::{CheckpointMemento, EventMemento, LogPosition, TxnEvent};
use crate::stream::{PagedLogWriter, SpillStream};
use crate::txn::{Transaction, TxnCore, TxnState};

/// What a checkpoint should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Drop all active-transaction and retained-segment bookkeeping without
    /// touching storage. Simulates a crash; used by tests and shutdown
    /// paths that intend recovery to run.
    Discard,
    /// Flush everything; the returned memento describes this checkpoint.
    FlushAll,
    /// Fuzzy flush: the returned memento is the *previous* checkpoint's,
    /// and this one is retained as the new "last" memento.
    FlushFuzzy,
}

/// Shared-log statistics.
#[derive(Debug, Default)]
pub struct TxnLogStats {
    /// Commits that produced a commit record.
    pub commits: AtomicU64,
    /// Commits dropped by the empty-commit optimization.
    pub empty_commits: AtomicU64,
    /// Rollbacks reported to the shared log.
    pub rollbacks: AtomicU64,
    /// Checkpoints taken.
    pub checkpoints: AtomicU64,
    /// Physical shared-log flushes (forced page breaks).
    pub log_flushes: AtomicU64,
}

/// State guarded by the log mutex.
struct LogShared {
    /// Append cursor of the shared log.
    out: PagedLogWriter,
    /// Transactions created and not yet resolved.
    active: Vec<(TxnId, Arc<Mutex<TxnCore>>)>,
    /// Long-log segments that must survive until checkpoint reclamation:
    /// committed segments, plus segments of rolled-back transactions that
    /// recovery might still need to undo.
    retained_long_logs: Vec<PathBuf>,
    /// Watermark into `retained_long_logs` as of the last reclamation.
    n_retained_before_checkpoint: usize,
    /// Next transaction id to assign.
    next_txn_id: TxnId,
    /// The last checkpoint memento, kept for fuzzy checkpoint handover.
    last_checkpoint: CheckpointMemento,
}

/// The single shared transaction log.
///
/// Creates transactions, serializes their commit and rollback events with
/// group-commit batching, and handles checkpointing and log truncation.
/// Everything shared lives behind one mutex; the paired condition variable
/// exists solely for group-commit batching.
pub struct TransactionLog {
    config: TxnLogConfig,
    online_uuid: Uuid,
    shared: Mutex<LogShared>,
    flushed: Condvar,
    stats: TxnLogStats,
}

impl TransactionLog {
    /// Creates a new transaction log rooted at the configured directory.
    ///
    /// `online_uuid` identifies this instance; every shared-log page is
    /// stamped with it so recovery can tell this instance's pages from
    /// stale or unwritten ones.
    pub fn new(config: TxnLogConfig, online_uuid: Uuid) -> TxnLogResult<Arc<Self>> {
        config.validate().map_err(TxnLogError::config)?;
        std::fs::create_dir_all(&config.dir)?;
        let out = PagedLogWriter::create(
            config.shared_log_path(),
            online_uuid,
            config.page_size,
            true, // every full shared-log page is synced as written
        )?;
        let last_checkpoint = CheckpointMemento {
            log_position: out.position(),
            n_uncommitted: 0,
            next_txn_id: TxnId::FIRST,
        };
        Ok(Arc::new(Self {
            config,
            online_uuid,
            shared: Mutex::new(LogShared {
                out,
                active: Vec::new(),
                retained_long_logs: Vec::new(),
                n_retained_before_checkpoint: 0,
                next_txn_id: TxnId::FIRST,
                last_checkpoint,
            }),
            flushed: Condvar::new(),
            stats: TxnLogStats::default(),
        }))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TxnLogConfig {
        &self.config
    }

    /// Returns the log statistics.
    pub fn stats(&self) -> &TxnLogStats {
        &self.stats
    }

    /// Returns the shared log's current append position.
    pub fn position(&self) -> LogPosition {
        self.shared.lock().out.position()
    }

    /// Overrides the next transaction id to assign.
    ///
    /// Called after recovery with the id the checkpoint memento preserved.
    pub fn set_next_txn_id(&self, next: TxnId) {
        self.shared.lock().next_txn_id = next;
    }

    /// Starts a new logical transaction.
    ///
    /// Assigns the next `TxnId` (exposed on the handle for the caller's
    /// page-lock attribution) and registers the transaction as uncommitted.
    pub fn new_logical_txn(self: &Arc<Self>) -> Transaction {
        let mut shared = self.shared.lock();
        let txn_id = shared.next_txn_id;
        shared.next_txn_id = txn_id.next();
        let out = SpillStream::new(
            self.config.long_log_path(txn_id),
            self.online_uuid,
            self.config.page_size,
            self.config.spill_threshold,
        );
        let core = Arc::new(Mutex::new(TxnCore::new(txn_id, out)));
        shared.active.push((txn_id, Arc::clone(&core)));
        Transaction::new(Arc::clone(self), core, txn_id)
    }

    /// Minimum id among active transactions, or the next id to be assigned
    /// when none are active.
    pub fn oldest_active_txn_id(&self) -> TxnId {
        let shared = self.shared.lock();
        shared
            .active
            .iter()
            .map(|(id, _)| *id)
            .min()
            .unwrap_or(shared.next_txn_id)
    }

    /// Commits a transaction.
    ///
    /// A transaction that logged nothing is dropped with no record. A
    /// spilled transaction's memento points at its long-log segment, which
    /// is flushed and retained for checkpoint reclamation; otherwise the
    /// private content is copied inline after the memento. Either way the
    /// append is subject to group commit before this returns, so the commit
    /// is durable once the caller regains control.
    pub(crate) fn commit_txn(
        &self,
        txn_id: TxnId,
        core: &Arc<Mutex<TxnCore>>,
    ) -> TxnLogResult<()> {
        let mut shared = self.shared.lock();
        let mut core = core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "commit in state {}",
            core.state
        );
        let mut memento = EventMemento {
            event: TxnEvent::Commit,
            long_log: core.out.is_spilled(),
            n_participants: core.participants.len() as u32,
            txn_id,
            cb_action_last: core.svpt.cb_action_prev,
            log_position: LogPosition::inline(0),
        };
        if core.out.is_spilled() {
            core.out.hard_page_break()?;
            memento.log_position = core.out.position();
            let path = core.out.finish();
            shared.retained_long_logs.push(path);
        } else {
            if core.svpt.cb_logged == 0 {
                // empty commit: common under autocommit, where closing a
                // cursor commits; it must not cost a log write
                core.state = TxnState::Committed;
                core.participants.clear();
                drop(core);
                remove_active(&mut shared, txn_id);
                self.stats.empty_commits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            memento.log_position = LogPosition::inline(core.svpt.cb_logged);
        }
        shared.out.write_bytes(&memento.to_bytes())?;
        if !memento.long_log {
            shared.out.write_bytes(core.out.buffered())?;
        }
        core.state = TxnState::Committed;
        core.participants.clear();
        debug!(
            txn_id = %txn_id,
            long_log = memento.long_log,
            cb_logged = memento.log_position.cb_offset,
            "transaction committed"
        );
        drop(core);
        remove_active(&mut shared, txn_id);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_with_group(shared)
    }

    /// Waits out the group-commit interval, flushing if nobody else does.
    ///
    /// The caller has appended its commit record. Record the page the
    /// append cursor is on; if another thread's flush moves the cursor to a
    /// later page, that flush covered this record (shared-log page writes
    /// are synchronous). On timeout this thread forces the page break
    /// itself and wakes every waiter.
    fn commit_with_group(&self, mut shared: MutexGuard<'_, LogShared>) -> TxnLogResult<()> {
        let interval = self.config.group_commit_interval;
        let start_page = shared.out.position().page;
        if interval.is_zero() {
            shared.out.hard_page_break()?;
            self.stats.log_flushes.fetch_add(1, Ordering::Relaxed);
            self.flushed.notify_all();
            return Ok(());
        }
        let deadline = Instant::now() + interval;
        loop {
            let wait = self.flushed.wait_until(&mut shared, deadline);
            if shared.out.position().page != start_page {
                // someone else flushed for us
                return Ok(());
            }
            if wait.timed_out() {
                shared.out.hard_page_break()?;
                self.stats.log_flushes.fetch_add(1, Ordering::Relaxed);
                self.flushed.notify_all();
                return Ok(());
            }
            // spurious wakeup: go around again
        }
    }

    /// Reports a rollback.
    ///
    /// A never-checkpointed transaction is forgotten with no trace; its
    /// fate cannot matter to recovery. Otherwise a rollback record is
    /// appended so a single recovery pass knows the transaction's fate.
    /// There is no group-commit wait: an abort needs no durability
    /// confirmation.
    pub(crate) fn rollback_txn(
        &self,
        txn_id: TxnId,
        checkpointed: bool,
        retained_long_log: Option<PathBuf>,
    ) -> TxnLogResult<()> {
        let mut shared = self.shared.lock();
        if checkpointed {
            let memento = EventMemento {
                event: TxnEvent::Rollback,
                long_log: true,
                n_participants: 0,
                txn_id,
                cb_action_last: 0,
                log_position: LogPosition::inline(0),
            };
            shared.out.write_bytes(&memento.to_bytes())?;
        }
        if let Some(path) = retained_long_log {
            shared.retained_long_logs.push(path);
        }
        remove_active(&mut shared, txn_id);
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id = %txn_id, checkpointed, "transaction rolled back");
        Ok(())
    }

    /// Drops a transaction that was abandoned without commit or rollback.
    pub(crate) fn forget_txn(&self, txn_id: TxnId) {
        let mut shared = self.shared.lock();
        remove_active(&mut shared, txn_id);
    }

    /// Takes a checkpoint.
    ///
    /// Records the current position, per-active-transaction state, and the
    /// next transaction id. Every active transaction gets a checkpoint
    /// record forced into its own long log (promoting short transactions to
    /// long-log form, since only a long log gives a position to checkpoint
    /// against), followed by a page break in the shared log.
    ///
    /// For [`CheckpointKind::FlushFuzzy`] the returned memento is the one
    /// retained by the previous checkpoint, keeping exactly one "last"
    /// memento available. For [`CheckpointKind::Discard`] the bookkeeping is
    /// dropped wholesale and the returned memento is not meaningful.
    ///
    /// Callers must quiesce transactions first: a transaction caught inside
    /// an open logical action is a contract violation and panics.
    pub fn checkpoint(&self, kind: CheckpointKind) -> TxnLogResult<CheckpointMemento> {
        let mut shared = self.shared.lock();
        if kind == CheckpointKind::Discard {
            shared.active.clear();
            shared.retained_long_logs.clear();
            shared.n_retained_before_checkpoint = 0;
            return Ok(shared.last_checkpoint);
        }
        let mut memento = CheckpointMemento {
            log_position: shared.out.position(),
            n_uncommitted: 0,
            next_txn_id: shared.next_txn_id,
        };
        let cores: Vec<(TxnId, Arc<Mutex<TxnCore>>)> = shared.active.clone();
        let mut n_uncommitted = 0u32;
        for (txn_id, core) in &cores {
            let mut core = core.lock();
            match core.state {
                TxnState::LoggingTxn => {
                    self.checkpoint_txn(&mut shared, &mut core)?;
                    n_uncommitted += 1;
                }
                TxnState::LoggingAction => {
                    panic!("checkpoint while transaction {} has an open action", txn_id)
                }
                // resolving concurrently; its event record lands after this
                // checkpoint's position and the scan will order it correctly
                _ => {}
            }
        }
        memento.n_uncommitted = n_uncommitted;
        shared.out.hard_page_break()?;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats.log_flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            position = memento.log_position.cb_offset,
            n_uncommitted, "checkpoint"
        );
        if kind == CheckpointKind::FlushFuzzy {
            // hand back the previous memento; keep this one as the new last
            std::mem::swap(&mut memento, &mut shared.last_checkpoint);
        }
        Ok(memento)
    }

    /// Writes one active transaction's checkpoint state.
    fn checkpoint_txn(&self, shared: &mut LogShared, core: &mut TxnCore) -> TxnLogResult<()> {
        // the page break converts small transactions into long-log form;
        // recording their incomplete state in the shared log instead would
        // avoid that, at the cost of a second record format
        core.describe_all_participants()?;
        core.out.hard_page_break()?;
        let memento = EventMemento {
            event: TxnEvent::Checkpoint,
            long_log: true,
            n_participants: core.participants.len() as u32,
            txn_id: core.txn_id,
            cb_action_last: core.svpt.cb_action_prev,
            log_position: core.out.position(),
        };
        shared.out.write_bytes(&memento.to_bytes())?;
        core.checkpointed = true;
        Ok(())
    }

    /// Reclaims log space made obsolete by a checkpoint.
    ///
    /// Shared-log pages strictly before the memento's page are zeroed (the
    /// checkpoint page itself is retained). Retained long-log segments are
    /// reclaimed fully, or, for a fuzzy checkpoint, only those already
    /// retained when the previous reclamation ran.
    pub fn deallocate_checkpointed_log(
        &self,
        memento: &CheckpointMemento,
        kind: CheckpointKind,
    ) -> TxnLogResult<()> {
        let mut shared = self.shared.lock();
        if memento.log_position.page.is_valid() && memento.log_position.page > PageId::FIRST {
            shared.out.deallocate_before(memento.log_position.page)?;
        }
        let reclaimed: Vec<PathBuf> = if kind == CheckpointKind::FlushFuzzy {
            let n = shared
                .n_retained_before_checkpoint
                .min(shared.retained_long_logs.len());
            shared.retained_long_logs.drain(..n).collect()
        } else {
            shared.retained_long_logs.drain(..).collect()
        };
        shared.n_retained_before_checkpoint = shared.retained_long_logs.len();
        drop(shared);
        for path in reclaimed {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("TransactionLog")
            .field("dir", &self.config.dir)
            .field("position", &shared.out.position())
            .field("active_txns", &shared.active.len())
            .field("next_txn_id", &shared.next_txn_id)
            .finish()
    }
}

fn remove_active(shared: &mut LogShared, txn_id: TxnId) {
    shared.active.retain(|(id, _)| *id != txn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_log(dir: &std::path::Path) -> Arc<TransactionLog> {
        let config = TxnLogConfig::new(dir)
            .with_page_size(256)
            .with_spill_threshold(1024)
            .with_group_commit_interval(std::time::Duration::ZERO);
        TransactionLog::new(config, Uuid::new_v4()).unwrap()
    }

    #[test]
    fn test_txn_id_assignment() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let t1 = log.new_logical_txn();
        let t2 = log.new_logical_txn();
        assert!(t2.txn_id() > t1.txn_id());
        assert_eq!(log.oldest_active_txn_id(), t1.txn_id());

        t1.commit().unwrap();
        t2.commit().unwrap();
    }

    #[test]
    fn test_oldest_active_falls_back_to_next() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let t1 = log.new_logical_txn();
        let id1 = t1.txn_id();
        t1.commit().unwrap();
        assert_eq!(log.oldest_active_txn_id(), id1.next());
    }

    #[test]
    fn test_empty_commit_leaves_no_trace() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let before = log.position();
        let txn = log.new_logical_txn();
        txn.commit().unwrap();
        assert_eq!(log.position(), before);
        assert_eq!(log.stats().empty_commits.load(Ordering::Relaxed), 1);
        assert_eq!(log.stats().commits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_untraced_rollback_of_unknown_txn() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let before = log.position();
        let txn = log.new_logical_txn();
        txn.rollback().unwrap();
        assert_eq!(log.position(), before);
        assert_eq!(log.oldest_active_txn_id(), TxnId::new(2));
    }

    #[test]
    fn test_set_next_txn_id() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        log.set_next_txn_id(TxnId::new(77));
        let txn = log.new_logical_txn();
        assert_eq!(txn.txn_id(), TxnId::new(77));
        txn.commit().unwrap();
    }

    #[test]
    fn test_checkpoint_empty_log() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let memento = log.checkpoint(CheckpointKind::FlushAll).unwrap();
        assert_eq!(memento.n_uncommitted, 0);
        assert_eq!(memento.next_txn_id, TxnId::FIRST);
        log.deallocate_checkpointed_log(&memento, CheckpointKind::FlushAll)
            .unwrap();
    }

    #[test]
    fn test_fuzzy_checkpoint_returns_previous_memento() {
        let tmp = TempDir::new().unwrap();
        let log = test_log(tmp.path());

        let first = log.checkpoint(CheckpointKind::FlushFuzzy).unwrap();
        assert_eq!(first.n_uncommitted, 0);

        // move the id sequence forward so the two checkpoints differ
        let txn = log.new_logical_txn();
        txn.rollback().unwrap();
        let second = log.checkpoint(CheckpointKind::FlushFuzzy).unwrap();

        // the second fuzzy checkpoint hands back the first checkpoint's
        // view, from before the transaction existed
        assert_eq!(second.next_txn_id, TxnId::FIRST);
    }
}
