//! Logged participant interfaces.
//!
//! A participant is any storage structure (page allocator, B-tree, ...) that
//! logs logical actions through a transaction and can replay them. The log
//! never interprets a participant's action payloads; it only brackets them
//! with headers and hands them back during replay.

use std::io::Write;
use std::sync::Arc;

use keel_common::types::{LogicalActionType, ParticipantClassId};

use crate::error::TxnLogResult;
use crate::stream::LogInputStream;

/// A transactional storage structure that logs logical actions.
///
/// Replay contract: `redo_logical_action` and `undo_logical_action` must
/// consume exactly the bytes the action wrote when it was logged, even when
/// some of them are irrelevant to the particular replay being performed;
/// the stream position after the call delimits the next record.
pub trait Participant: Send + Sync {
    /// Returns the class identifier used to reconstruct this participant
    /// during recovery.
    fn participant_class_id(&self) -> ParticipantClassId;

    /// Writes whatever is needed to reconstruct this participant.
    fn describe_participant(&self, out: &mut dyn Write) -> TxnLogResult<()>;

    /// Reapplies one logged action.
    fn redo_logical_action(
        &self,
        action_type: LogicalActionType,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<()>;

    /// Reverses one logged action.
    fn undo_logical_action(
        &self,
        action_type: LogicalActionType,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<()>;
}

/// Reconstructs participants from their logged descriptions during recovery.
pub trait ParticipantFactory: Send + Sync {
    /// Loads a participant of the given class, consuming exactly the bytes
    /// its `describe_participant` wrote.
    ///
    /// Implementations may pool and return one instance for identical
    /// descriptions.
    fn load_participant(
        &self,
        class_id: ParticipantClassId,
        log: &mut dyn LogInputStream,
    ) -> TxnLogResult<Arc<dyn Participant>>;
}
