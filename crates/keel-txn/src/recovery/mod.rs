//! Crash recovery.
//!
//! Recovery scans the shared log forward from the last checkpoint, redoing
//! committed transactions and undoing the ones that were active at
//! checkpoint time and never resolved afterward. Participants are
//! reconstructed on demand from their logged descriptions.

pub(crate) mod txn;

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use keel_common::types::TxnId;

use crate::config::TxnLogConfig;
use crate::error::{TxnLogError, TxnLogResult};
use crate::participant::ParticipantFactory;
use crate::record::{CheckpointMemento, EventMemento, Savepoint, TxnEvent};
use crate::recovery::txn::RecoveryTxn;
use crate::stream::{LogInputStream, PagedLogReader};

/// Crash-time counterpart of the transaction log.
///
/// Reads the same storage a [`crate::log::TransactionLog`] instance wrote
/// (shared log plus long-log segments) and replays it through participants
/// reconstructed by the supplied factory. Recovery either terminates with
/// every unresolved transaction undone, or fails; there is no partial
/// success, and a failure here is fatal to kernel startup.
pub struct RecoveryLog {
    factory: Arc<dyn ParticipantFactory>,
    config: TxnLogConfig,
    online_uuid: Uuid,
}

impl RecoveryLog {
    /// Creates a recovery log over the given log directory.
    ///
    /// `online_uuid` must be the instance UUID the log's pages were stamped
    /// with.
    pub fn new(
        factory: Arc<dyn ParticipantFactory>,
        config: TxnLogConfig,
        online_uuid: Uuid,
    ) -> Self {
        Self {
            factory,
            config,
            online_uuid,
        }
    }

    /// Replays the log from the given checkpoint.
    ///
    /// Seeks to the memento's position and reads its block of CHECKPOINT
    /// event records (the transactions dangling at checkpoint time), then
    /// scans forward to end-of-stream. A COMMIT redoes its transaction; a
    /// ROLLBACK undoes its (necessarily dangling) transaction; CHECKPOINT
    /// records from later checkpoints are ignored. Whatever is still
    /// dangling after the scan is undone, in transaction-id order.
    pub fn recover(&self, memento: &CheckpointMemento) -> TxnLogResult<()> {
        let mut input = PagedLogReader::open(
            self.config.shared_log_path(),
            self.online_uuid,
            self.config.page_size,
        )?;
        input.seek(&memento.log_position)?;

        let mut dangling: BTreeMap<TxnId, EventMemento> = BTreeMap::new();
        for _ in 0..memento.n_uncommitted {
            let event = read_event(&mut input)?.ok_or_else(|| {
                TxnLogError::inconsistent_event("checkpoint record block truncated")
            })?;
            if event.event != TxnEvent::Checkpoint {
                return Err(TxnLogError::inconsistent_event(format!(
                    "expected a checkpoint record, found {}",
                    event.event
                )));
            }
            dangling.insert(event.txn_id, event);
        }

        while let Some(event) = read_event(&mut input)? {
            match event.event {
                TxnEvent::Checkpoint => {
                    // a later checkpoint's record; scan order already
                    // resolves everything it would tell us
                }
                TxnEvent::Commit => {
                    let checkpoint = dangling.remove(&event.txn_id);
                    debug!(txn_id = %event.txn_id, long_log = event.long_log, "redo");
                    self.redo_txn(&event, checkpoint.as_ref(), &mut input)?;
                }
                TxnEvent::Rollback => {
                    let checkpoint = dangling.remove(&event.txn_id).ok_or_else(|| {
                        TxnLogError::inconsistent_event(format!(
                            "rollback event for transaction {} never checkpointed",
                            event.txn_id
                        ))
                    })?;
                    debug!(txn_id = %event.txn_id, "undo (rolled back)");
                    self.undo_txn(&checkpoint)?;
                }
            }
        }

        for (txn_id, checkpoint) in dangling {
            debug!(%txn_id, "undo (dangling)");
            self.undo_txn(&checkpoint)?;
        }
        Ok(())
    }

    /// Redoes one committed transaction.
    ///
    /// With a checkpoint record, the transaction's pre-checkpoint effects
    /// are already durable: replay first walks the descriptions the
    /// checkpoint forced out (reconstructing participants, undoing
    /// nothing), then redoes forward from the checkpoint position to the
    /// commit position. Without one, the whole transaction is redone from
    /// its start: the long-log segment, or the content copied inline after
    /// the commit memento.
    fn redo_txn(
        &self,
        commit: &EventMemento,
        checkpoint: Option<&EventMemento>,
        shared: &mut PagedLogReader,
    ) -> TxnLogResult<()> {
        if !commit.long_log {
            if checkpoint.is_some() {
                return Err(TxnLogError::inconsistent_event(
                    "checkpointed transaction committed without a long log",
                ));
            }
            let mut replay = RecoveryTxn::recovery(shared, self.factory.as_ref());
            return replay.redo_actions(commit.log_position.cb_offset);
        }

        let mut input = self.open_long_log(commit.txn_id)?;
        let mut replay = RecoveryTxn::recovery(&mut input, self.factory.as_ref());
        let cb_redo = match checkpoint {
            Some(ck) => {
                // resolve participant references from the descriptions
                // logged just before the checkpoint position
                replay.undo_actions(
                    Savepoint {
                        cb_logged: ck.log_position.cb_offset,
                        cb_action_prev: ck.cb_action_last,
                    },
                    0,
                    0,
                )?;
                replay.seek(&ck.log_position)?;
                commit
                    .log_position
                    .cb_offset
                    .checked_sub(ck.log_position.cb_offset)
                    .ok_or_else(|| {
                        TxnLogError::inconsistent_event("commit position precedes its checkpoint")
                    })?
            }
            None => commit.log_position.cb_offset,
        };
        replay.redo_actions(cb_redo)
    }

    /// Undoes one unresolved transaction from its checkpoint state.
    fn undo_txn(&self, checkpoint: &EventMemento) -> TxnLogResult<()> {
        let mut input = self.open_long_log(checkpoint.txn_id)?;
        let mut replay = RecoveryTxn::recovery(&mut input, self.factory.as_ref());
        replay.seek(&checkpoint.log_position)?;
        replay.undo_actions(
            Savepoint {
                cb_logged: checkpoint.log_position.cb_offset,
                cb_action_prev: checkpoint.cb_action_last,
            },
            u64::MAX,
            0,
        )?;
        Ok(())
    }

    /// Opens a transaction's long-log segment.
    fn open_long_log(&self, txn_id: TxnId) -> TxnLogResult<PagedLogReader> {
        let path = self.config.long_log_path(txn_id);
        if !path.exists() {
            return Err(TxnLogError::LongLogMissing { txn_id, path });
        }
        PagedLogReader::open(path, self.online_uuid, self.config.page_size)
    }
}

impl std::fmt::Debug for RecoveryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryLog")
            .field("dir", &self.config.dir)
            .finish()
    }
}

/// Reads the next event memento, or `None` at end-of-stream.
///
/// A short read (the stream ran out mid-record) is also end-of-stream: the
/// record was never durably completed.
fn read_event(input: &mut PagedLogReader) -> TxnLogResult<Option<EventMemento>> {
    let mut bytes = [0u8; EventMemento::SIZE];
    let mut filled = 0;
    while filled < bytes.len() {
        match input.read(&mut bytes[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    EventMemento::from_bytes(&bytes).map(Some)
}
