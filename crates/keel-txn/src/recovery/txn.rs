//! Per-transaction replay engine.
//!
//! One `RecoveryTxn` replays a single transaction's log, forward (redo) or
//! backward (undo). The same engine drives online rollback, where logged
//! participant references resolve to live objects, and crash recovery, where
//! they resolve through a map populated from DESCRIBE records by the
//! participant factory.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use keel_common::types::ParticipantClassId;

use crate::error::{TxnLogError, TxnLogResult};
use crate::participant::{Participant, ParticipantFactory};
use crate::record::{
    ActionHeader, LogPosition, ParticipantRef, Savepoint, ACTION_DESCRIBE_PARTICIPANT,
    ACTION_ROLLBACK_TO_SAVEPOINT,
};
use crate::stream::LogInputStream;

/// How logged participant references are resolved.
enum Swizzler<'a> {
    /// Online replay: the transaction's join list is live.
    Online {
        participants: &'a [Arc<dyn Participant>],
    },
    /// Recovery: references map to factory-reconstructed instances.
    Recovery {
        factory: &'a dyn ParticipantFactory,
        map: HashMap<u64, Arc<dyn Participant>>,
    },
}

/// Replays one transaction's logical log.
pub(crate) struct RecoveryTxn<'a> {
    input: &'a mut dyn LogInputStream,
    /// Stream offset of the transaction's first logged byte. All savepoint
    /// arithmetic is relative to this (nonzero only for commit content
    /// stored inline in the shared log).
    base: u64,
    swizzler: Swizzler<'a>,
}

impl<'a> RecoveryTxn<'a> {
    /// Creates an online replayer over a live transaction's private log.
    pub(crate) fn online(
        input: &'a mut dyn LogInputStream,
        participants: &'a [Arc<dyn Participant>],
    ) -> Self {
        Self {
            input,
            base: 0,
            swizzler: Swizzler::Online { participants },
        }
    }

    /// Creates a recovery replayer.
    ///
    /// The stream's current offset becomes the transaction base, so this
    /// must be constructed while the stream sits at the transaction's first
    /// byte (a long log's start, or just past an inline commit memento).
    pub(crate) fn recovery(
        input: &'a mut dyn LogInputStream,
        factory: &'a dyn ParticipantFactory,
    ) -> Self {
        let base = input.offset();
        Self {
            input,
            base,
            swizzler: Swizzler::Recovery {
                factory,
                map: HashMap::new(),
            },
        }
    }

    /// Seeks the underlying stream to an exact position.
    pub(crate) fn seek(&mut self, position: &LogPosition) -> TxnLogResult<()> {
        self.input.seek(position)
    }

    /// Replays actions forward for exactly `cb_redo` bytes.
    ///
    /// DESCRIBE records reconstruct participants; a ROLLBACK_TO_SAVEPOINT
    /// record re-runs the bounded undo it stands for before the forward walk
    /// continues.
    pub(crate) fn redo_actions(&mut self, cb_redo: u64) -> TxnLogResult<()> {
        let end = self.input.offset() + cb_redo;
        while self.input.offset() < end {
            let header = read_action_header(self.input)?;
            match header.action_type {
                ACTION_DESCRIBE_PARTICIPANT => {
                    self.load_described(header.participant)?;
                }
                ACTION_ROLLBACK_TO_SAVEPOINT => {
                    let old_svpt = read_savepoint(self.input)?;
                    let resume = self.input.offset();
                    let record_start = resume
                        .checked_sub(self.base)
                        .and_then(|o| {
                            o.checked_sub((ActionHeader::SIZE + Savepoint::SIZE) as u64)
                        })
                        .ok_or_else(|| {
                            TxnLogError::inconsistent_event("rollback record before stream base")
                        })?;
                    let svpt_end = Savepoint {
                        cb_logged: record_start,
                        cb_action_prev: header.cb_action_prev,
                    };
                    self.undo_actions(svpt_end, u64::MAX, old_svpt.cb_logged)?;
                    self.input.seek_offset(resume)?;
                }
                action_type => {
                    let participant = self.swizzle(header.participant)?;
                    participant.redo_logical_action(action_type, self.input)?;
                }
            }
        }
        if self.input.offset() != end {
            return Err(TxnLogError::inconsistent_event(format!(
                "redo overran its range: at {}, expected {}",
                self.input.offset(),
                end
            )));
        }
        Ok(())
    }

    /// Walks the action chain backward from `svpt_end`, undoing as it goes.
    ///
    /// Stops after `max_actions` undoable actions or upon reaching
    /// `min_offset`; callers bound a walk by one or the other, never both.
    /// DESCRIBE records reconstruct participants without counting as undo
    /// steps; a ROLLBACK_TO_SAVEPOINT record moves the walk directly to the
    /// savepoint it carries, since everything above it was already undone
    /// when it was logged. Returns the number of actions undone.
    pub(crate) fn undo_actions(
        &mut self,
        svpt_end: Savepoint,
        max_actions: u64,
        min_offset: u64,
    ) -> TxnLogResult<u64> {
        let mut svpt = svpt_end;
        let mut n_undone = 0u64;
        loop {
            if svpt.cb_logged <= min_offset || svpt.cb_action_prev == 0 {
                break;
            }
            let start = svpt
                .cb_logged
                .checked_sub(svpt.cb_action_prev)
                .ok_or_else(|| TxnLogError::inconsistent_event("action chain underflow"))?;
            if start < min_offset {
                break;
            }
            self.input.seek_offset(self.base + start)?;
            let header = read_action_header(self.input)?;
            match header.action_type {
                ACTION_DESCRIBE_PARTICIPANT => {
                    self.load_described(header.participant)?;
                    svpt = Savepoint {
                        cb_logged: start,
                        cb_action_prev: header.cb_action_prev,
                    };
                }
                ACTION_ROLLBACK_TO_SAVEPOINT => {
                    let old_svpt = read_savepoint(self.input)?;
                    svpt = old_svpt;
                }
                action_type => {
                    if n_undone >= max_actions {
                        break;
                    }
                    let participant = self.swizzle(header.participant)?;
                    participant.undo_logical_action(action_type, self.input)?;
                    n_undone += 1;
                    svpt = Savepoint {
                        cb_logged: start,
                        cb_action_prev: header.cb_action_prev,
                    };
                }
            }
        }
        Ok(n_undone)
    }

    /// Resolves a logged participant reference.
    fn swizzle(&self, reference: ParticipantRef) -> TxnLogResult<Arc<dyn Participant>> {
        let resolved = match &self.swizzler {
            Swizzler::Online { participants } => reference
                .index()
                .and_then(|i| participants.get(i))
                .cloned(),
            Swizzler::Recovery { map, .. } => map.get(&reference.as_u64()).cloned(),
        };
        resolved.ok_or(TxnLogError::UnknownParticipant {
            reference: reference.as_u64(),
        })
    }

    /// Handles a DESCRIBE record.
    ///
    /// During recovery the description is always consumed through the
    /// factory, even for a reference already resolved (streams legitimately
    /// carry repeated descriptions; the factory may pool). Online the
    /// participant is already live and nothing is read; callers position
    /// the stream explicitly around describe records.
    fn load_described(&mut self, reference: ParticipantRef) -> TxnLogResult<()> {
        match &mut self.swizzler {
            Swizzler::Online { .. } => Ok(()),
            Swizzler::Recovery { factory, map } => {
                let mut class_bytes = [0u8; 8];
                read_exact_or_truncated(self.input, &mut class_bytes)?;
                let class_id = ParticipantClassId::new(u64::from_le_bytes(class_bytes));
                let participant = factory.load_participant(class_id, self.input)?;
                map.insert(reference.as_u64(), participant);
                Ok(())
            }
        }
    }
}

/// Reads one action header at the current stream position.
fn read_action_header(input: &mut dyn LogInputStream) -> TxnLogResult<ActionHeader> {
    let mut bytes = [0u8; ActionHeader::SIZE];
    read_exact_or_truncated(input, &mut bytes)?;
    Ok(ActionHeader::from_bytes(&bytes))
}

/// Reads one savepoint at the current stream position.
fn read_savepoint(input: &mut dyn LogInputStream) -> TxnLogResult<Savepoint> {
    let mut bytes = [0u8; Savepoint::SIZE];
    read_exact_or_truncated(input, &mut bytes)?;
    Ok(Savepoint::from_bytes(&bytes))
}

/// Reads an exact number of bytes, reporting a truncated record on a short
/// stream. Replay reads are positioned, so running out of bytes here is
/// corruption, not a normal end-of-stream.
fn read_exact_or_truncated(input: &mut dyn LogInputStream, buf: &mut [u8]) -> TxnLogResult<()> {
    let offset = input.offset();
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => return Err(TxnLogError::truncated_record(offset, buf.len())),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
