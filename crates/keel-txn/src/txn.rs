//! Per-transaction lifecycle and private logging.
//!
//! # Transaction states
//!
//! ```text
//!                begin_logical_action
//!   ┌─────────────┐ ──────────────▶ ┌────────────────┐
//!   │ LOGGING_TXN │                 │ LOGGING_ACTION │
//!   └─────────────┘ ◀────────────── └────────────────┘
//!      │        │         end
//!   commit   rollback
//!      │        │
//!      ▼        ▼
//! ┌───────────┐ ┌──────────────┐      ┌─────────────┐
//! │ COMMITTED │ │ ROLLING_BACK │ ───▶ │ ROLLED_BACK │
//! └───────────┘ └──────────────┘      └─────────────┘
//! ```
//!
//! Partial (savepoint) rollback stays in `LOGGING_TXN`. Calling a method in
//! the wrong state is a collaborator bug and panics.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use keel_common::types::{LogicalActionType, SavepointId, TxnId};

use crate::error::TxnLogResult;
use crate::log::TransactionLog;
use crate::participant::Participant;
use crate::record::{
    ActionHeader, ParticipantRef, Savepoint, ACTION_DESCRIBE_PARTICIPANT,
    ACTION_ROLLBACK_TO_SAVEPOINT,
};
use crate::recovery::txn::RecoveryTxn;
use crate::stream::SpillStream;

/// The lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting logical actions.
    LoggingTxn,
    /// A logical action is open; payload bytes are being written.
    LoggingAction,
    /// Full rollback in progress.
    RollingBack,
    /// Fully rolled back. Terminal.
    RolledBack,
    /// Committed. Terminal.
    Committed,
}

impl TxnState {
    /// Returns true if the transaction has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RolledBack | Self::Committed)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggingTxn => write!(f, "LOGGING_TXN"),
            Self::LoggingAction => write!(f, "LOGGING_ACTION"),
            Self::RollingBack => write!(f, "ROLLING_BACK"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
            Self::Committed => write!(f, "COMMITTED"),
        }
    }
}

/// The mutable heart of a transaction.
///
/// Shared between the caller-facing [`Transaction`] handle and the
/// [`TransactionLog`], which must reach into active transactions' private
/// streams at checkpoint time. A single caller thread drives each
/// transaction; the mutex exists for that checkpoint access, not for
/// concurrent caller use.
pub(crate) struct TxnCore {
    pub(crate) txn_id: TxnId,
    pub(crate) state: TxnState,
    /// The private output stream, spilling to a long-log segment when large.
    pub(crate) out: SpillStream,
    /// The running savepoint.
    pub(crate) svpt: Savepoint,
    /// Savepoints created by the caller, indexed by `SavepointId`.
    pub(crate) savepoints: Vec<Savepoint>,
    /// Participants joined to this transaction, in join order.
    pub(crate) participants: Vec<Arc<dyn Participant>>,
    /// Whether any checkpoint record has been written for this transaction.
    pub(crate) checkpointed: bool,
}

impl TxnCore {
    pub(crate) fn new(txn_id: TxnId, out: SpillStream) -> Self {
        Self {
            txn_id,
            state: TxnState::LoggingTxn,
            out,
            svpt: Savepoint::default(),
            savepoints: Vec::new(),
            participants: Vec::new(),
            checkpointed: false,
        }
    }

    /// Writes an action header carrying the running backward-chain size.
    fn begin_action(
        &mut self,
        participant: ParticipantRef,
        action_type: LogicalActionType,
    ) -> TxnLogResult<()> {
        let header = ActionHeader {
            participant,
            action_type,
            cb_action_prev: self.svpt.cb_action_prev,
        };
        self.out.write_bytes(&header.to_bytes())
    }

    /// Closes the open action, advancing the running savepoint.
    fn end_action(&mut self) {
        let cb_logged = self.out.cb_logged();
        self.svpt.cb_action_prev = cb_logged - self.svpt.cb_logged;
        self.svpt.cb_logged = cb_logged;
    }

    /// Logs a DESCRIBE record for one participant.
    fn log_describe(
        &mut self,
        reference: ParticipantRef,
        participant: &dyn Participant,
    ) -> TxnLogResult<()> {
        self.begin_action(reference, ACTION_DESCRIBE_PARTICIPANT)?;
        let class_id = participant.participant_class_id();
        self.out.write_bytes(&class_id.as_u64().to_le_bytes())?;
        participant.describe_participant(&mut self.out)?;
        self.end_action();
        Ok(())
    }

    /// Re-describes every joined participant.
    ///
    /// Run by checkpoint just before it records this transaction's log
    /// position, so a backward walk from that position meets every
    /// participant's description before any undoable action.
    pub(crate) fn describe_all_participants(&mut self) -> TxnLogResult<()> {
        let participants = self.participants.clone();
        for (index, participant) in participants.iter().enumerate() {
            self.log_describe(ParticipantRef::from_index(index), participant.as_ref())?;
        }
        Ok(())
    }

    /// Replays undo over the private log, down to `to` or all the way.
    fn replay_undo(&mut self, to: Option<Savepoint>) -> TxnLogResult<()> {
        let svpt_end = self.svpt;
        let min_offset = to.map_or(0, |s| s.cb_logged);
        let participants = self.participants.clone();
        let mut reader = self.out.reader()?;
        let mut replay = RecoveryTxn::online(&mut reader, &participants);
        replay.undo_actions(svpt_end, u64::MAX, min_offset)?;
        Ok(())
    }
}

/// A logical transaction.
///
/// Created by [`TransactionLog::new_logical_txn`]; ends with
/// [`commit`](Self::commit) or [`rollback`](Self::rollback). One thread
/// drives a transaction at a time; callers serialize their own use of it.
pub struct Transaction {
    log: Arc<TransactionLog>,
    core: Arc<Mutex<TxnCore>>,
    txn_id: TxnId,
}

impl Transaction {
    pub(crate) fn new(log: Arc<TransactionLog>, core: Arc<Mutex<TxnCore>>, txn_id: TxnId) -> Self {
        Self { log, core, txn_id }
    }

    /// Returns this transaction's id.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Joins a participant to this transaction.
    ///
    /// Idempotent for a participant already joined. Otherwise the
    /// participant is recorded and a DESCRIBE record carrying its class id
    /// and self-description is logged immediately, so replay can
    /// reconstruct it before meeting any of its actions.
    pub fn add_participant(&self, participant: &Arc<dyn Participant>) -> TxnLogResult<()> {
        let mut core = self.core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "add_participant in state {}",
            core.state
        );
        if core
            .participants
            .iter()
            .any(|p| Arc::ptr_eq(p, participant))
        {
            return Ok(());
        }
        core.participants.push(Arc::clone(participant));
        let reference = ParticipantRef::from_index(core.participants.len() - 1);
        core.log_describe(reference, participant.as_ref())
    }

    /// Opens a logical action for a joined participant.
    ///
    /// Writes the action header and returns a writer for the payload bytes.
    /// The action must be closed with [`ActionWriter::end`] before any other
    /// transaction method is called.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is not in `LOGGING_TXN`, if the action type
    /// is reserved, or if the participant never joined this transaction.
    pub fn begin_logical_action(
        &self,
        participant: &Arc<dyn Participant>,
        action_type: LogicalActionType,
    ) -> TxnLogResult<ActionWriter<'_>> {
        assert!(
            !action_type.is_reserved(),
            "action type {} is reserved",
            action_type
        );
        let mut core = self.core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "begin_logical_action in state {}",
            core.state
        );
        let index = core
            .participants
            .iter()
            .position(|p| Arc::ptr_eq(p, participant))
            .expect("participant has not joined this transaction");
        core.begin_action(ParticipantRef::from_index(index), action_type)?;
        core.state = TxnState::LoggingAction;
        Ok(ActionWriter { core })
    }

    /// Snapshots the running savepoint, returning its id.
    pub fn create_savepoint(&self) -> SavepointId {
        let mut core = self.core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "create_savepoint in state {}",
            core.state
        );
        let svpt = core.svpt;
        core.savepoints.push(svpt);
        SavepointId::new((core.savepoints.len() - 1) as u32)
    }

    /// Releases the given savepoint and every later one.
    ///
    /// Purely a bookkeeping release; nothing is logged and durability is
    /// unaffected.
    pub fn commit_savepoint(&self, id: SavepointId) {
        let mut core = self.core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "commit_savepoint in state {}",
            core.state
        );
        assert!(id.index() < core.savepoints.len(), "unknown savepoint {}", id);
        core.savepoints.truncate(id.index());
    }

    /// Performs bounded undo back to the given savepoint.
    ///
    /// The undone actions stay in the log; a `ROLLBACK_TO_SAVEPOINT` record
    /// is appended so recovery reproduces the same partial undo. The
    /// savepoint remains valid and can be rolled back to again.
    pub fn rollback_to_savepoint(&self, id: SavepointId) -> TxnLogResult<()> {
        let mut core = self.core.lock();
        assert_eq!(
            core.state,
            TxnState::LoggingTxn,
            "rollback_to_savepoint in state {}",
            core.state
        );
        let old_svpt = *core
            .savepoints
            .get(id.index())
            .unwrap_or_else(|| panic!("unknown savepoint {}", id));
        core.replay_undo(Some(old_svpt))?;
        core.begin_action(ParticipantRef::NONE, ACTION_ROLLBACK_TO_SAVEPOINT)?;
        core.out.write_bytes(&old_svpt.to_bytes())?;
        core.end_action();
        Ok(())
    }

    /// Rolls the whole transaction back.
    ///
    /// Replays full undo over the private log, forgets all participants,
    /// discards the private stream, and reports the rollback to the shared
    /// log. A transaction that was never checkpointed leaves no trace.
    pub fn rollback(self) -> TxnLogResult<()> {
        let (checkpointed, retained) = {
            let mut core = self.core.lock();
            assert_eq!(
                core.state,
                TxnState::LoggingTxn,
                "rollback in state {}",
                core.state
            );
            core.state = TxnState::RollingBack;
            core.replay_undo(None)?;
            core.state = TxnState::RolledBack;
            core.participants.clear();
            let checkpointed = core.checkpointed;
            let retained = if checkpointed {
                // recovery may still need the long log to undo this txn
                Some(core.out.finish())
            } else {
                core.out.discard()?;
                None
            };
            (checkpointed, retained)
        };
        self.log.rollback_txn(self.txn_id, checkpointed, retained)
    }

    /// Commits the transaction, blocking until its commit record is durable.
    pub fn commit(self) -> TxnLogResult<()> {
        self.log.commit_txn(self.txn_id, &self.core)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self.core.lock().state;
        if !state.is_terminal() {
            // abandoned without commit or rollback; unregister it so a
            // later checkpoint does not record a dead transaction
            self.log.forget_txn(self.txn_id);
            let mut core = self.core.lock();
            core.state = TxnState::RolledBack;
            core.participants.clear();
            let _ = core.out.discard();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("state", &core.state)
            .field("cb_logged", &core.svpt.cb_logged)
            .field("participants", &core.participants.len())
            .field("checkpointed", &core.checkpointed)
            .finish()
    }
}

/// Writer for one open logical action's payload.
///
/// Returned by [`Transaction::begin_logical_action`]; the action is closed
/// with [`end`](Self::end), which returns the transaction to `LOGGING_TXN`
/// and links the record into the backward chain.
pub struct ActionWriter<'a> {
    core: MutexGuard<'a, TxnCore>,
}

impl ActionWriter<'_> {
    /// Closes the action.
    pub fn end(mut self) {
        assert_eq!(
            self.core.state,
            TxnState::LoggingAction,
            "end outside LOGGING_ACTION"
        );
        self.core.end_action();
        self.core.state = TxnState::LoggingTxn;
    }
}

impl Write for ActionWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
