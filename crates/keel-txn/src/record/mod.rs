//! Stored record structures.
//!
//! Every struct here has a fixed little-endian layout and is written by
//! value into a log stream. None of them is retained beyond the operation
//! that produces or consumes it.

use std::fmt;

use bytes::{Buf, BufMut};

use keel_common::types::{LogicalActionType, PageId, TxnId};

use crate::error::{TxnLogError, TxnLogResult};

/// Action code for a record describing a joined participant.
///
/// The payload is the participant's class id followed by whatever bytes its
/// `describe_participant` wrote.
pub const ACTION_DESCRIBE_PARTICIPANT: LogicalActionType =
    LogicalActionType::new(LogicalActionType::RESERVED_BASE | 0x1);

/// Action code for a record marking a completed partial rollback.
///
/// The payload is the [`Savepoint`] the rollback returned to, so replay can
/// reproduce the same bounded undo.
pub const ACTION_ROLLBACK_TO_SAVEPOINT: LogicalActionType =
    LogicalActionType::new(LogicalActionType::RESERVED_BASE | 0x2);

/// Reference to a logged participant.
///
/// Online, this resolves to the live participant through the transaction's
/// join list (1-based position); during recovery it is an opaque key mapped
/// to the reconstructed instance. Zero marks log-internal records that have
/// no participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ParticipantRef(u64);

impl ParticipantRef {
    /// Reference used by log-internal records.
    pub const NONE: Self = Self(0);

    /// Creates a reference from a zero-based join index.
    #[inline]
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u64 + 1)
    }

    /// Returns the zero-based join index, or `None` for a log-internal ref.
    #[inline]
    #[must_use]
    pub const fn index(self) -> Option<usize> {
        match self.0 {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Creates a reference from a raw logged value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// An exact position within a paged log stream.
///
/// Combines the physical address (page id + byte offset within that page's
/// payload) with the cumulative count of logical bytes written up to this
/// point. The cumulative offset is what record-chain arithmetic uses; the
/// physical address is what seeks use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    /// Page the position falls on.
    pub page: PageId,
    /// Byte offset within the page payload.
    pub offset: u32,
    /// Cumulative logical byte offset from the start of the stream.
    pub cb_offset: u64,
}

impl LogPosition {
    /// Serialized size in bytes.
    pub const SIZE: usize = 20;

    /// Position at the start of a stream.
    pub const START: Self = Self {
        page: PageId::FIRST,
        offset: 0,
        cb_offset: 0,
    };

    /// Position describing commit content stored inline in the shared log.
    ///
    /// Inline content has no address of its own; only its length matters.
    #[must_use]
    pub const fn inline(cb_logged: u64) -> Self {
        Self {
            page: PageId::INVALID,
            offset: 0,
            cb_offset: cb_logged,
        }
    }

    /// Returns true if this position refers to inline commit content.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        !self.page.is_valid()
    }

    /// Serializes the position.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.page.as_u64());
        buf.put_u32_le(self.offset);
        buf.put_u64_le(self.cb_offset);
    }

    /// Deserializes a position.
    pub fn deserialize(buf: &mut impl Buf) -> Self {
        let page = PageId::new(buf.get_u64_le());
        let offset = buf.get_u32_le();
        let cb_offset = buf.get_u64_le();
        Self {
            page,
            offset,
            cb_offset,
        }
    }
}

/// A resumable position within one transaction's private log.
///
/// `cb_logged` is the number of bytes logged through this point and
/// `cb_action_prev` the size of the immediately preceding action record.
/// Because every action header also carries its predecessor's size, the
/// savepoint chain forms an implicit backward linked list through the log:
/// subtracting `cb_action_prev` from `cb_logged` always lands on the start
/// of the previous record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Savepoint {
    /// Cumulative bytes logged through this point.
    pub cb_logged: u64,
    /// Size of the immediately preceding action record.
    pub cb_action_prev: u64,
}

impl Savepoint {
    /// Serialized size in bytes.
    pub const SIZE: usize = 16;

    /// Serializes the savepoint.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.cb_logged);
        buf.put_u64_le(self.cb_action_prev);
    }

    /// Serializes the savepoint to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes a savepoint.
    pub fn deserialize(buf: &mut impl Buf) -> Self {
        let cb_logged = buf.get_u64_le();
        let cb_action_prev = buf.get_u64_le();
        Self {
            cb_logged,
            cb_action_prev,
        }
    }

    /// Deserializes a savepoint from a byte slice.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self::deserialize(&mut &bytes[..])
    }
}

/// Header preceding every logical action in a transaction's log.
///
/// Layout (20 bytes):
/// - participant: 8 bytes (logged participant reference, 0 = log-internal)
/// - action_type: 4 bytes
/// - cb_action_prev: 8 bytes (size of the previous action record)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHeader {
    /// The participant whose action this is.
    pub participant: ParticipantRef,
    /// Participant-defined (or log-reserved) action type code.
    pub action_type: LogicalActionType,
    /// Size of the previous action record, forming the backward chain.
    pub cb_action_prev: u64,
}

impl ActionHeader {
    /// Serialized size in bytes.
    pub const SIZE: usize = 20;

    /// Serializes the header.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.participant.as_u64());
        buf.put_u32_le(self.action_type.as_u32());
        buf.put_u64_le(self.cb_action_prev);
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes a header from a byte slice.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        let participant = ParticipantRef::from_raw(buf.get_u64_le());
        let action_type = LogicalActionType::new(buf.get_u32_le());
        let cb_action_prev = buf.get_u64_le();
        Self {
            participant,
            action_type,
            cb_action_prev,
        }
    }
}

/// Transaction lifecycle event recorded in the shared log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnEvent {
    /// The transaction committed.
    Commit = 1,
    /// The transaction rolled back.
    Rollback = 2,
    /// The transaction was active when a checkpoint was taken.
    Checkpoint = 3,
}

impl TxnEvent {
    /// Converts the event to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates an event from a u8.
    pub fn from_u8(value: u8) -> TxnLogResult<Self> {
        match value {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Rollback),
            3 => Ok(Self::Checkpoint),
            code => Err(TxnLogError::UnknownEvent { code }),
        }
    }
}

impl fmt::Display for TxnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => write!(f, "COMMIT"),
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Checkpoint => write!(f, "CHECKPOINT"),
        }
    }
}

/// Shared-log record resolving one transaction's fate.
///
/// Layout (44 bytes):
/// - event: 1 byte
/// - long_log: 1 byte
/// - reserved: 2 bytes
/// - n_participants: 4 bytes
/// - txn_id: 8 bytes
/// - cb_action_last: 8 bytes (size of the transaction's last action record)
/// - log_position: 20 bytes
///
/// For a commit, `log_position` is either the end of the transaction's
/// long-log segment or an inline position carrying the content length; for a
/// checkpoint it is the transaction's long-log position at checkpoint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMemento {
    /// What happened to the transaction.
    pub event: TxnEvent,
    /// Whether the transaction's content lives in a long-log segment.
    pub long_log: bool,
    /// Number of participants joined at event time.
    pub n_participants: u32,
    /// The transaction.
    pub txn_id: TxnId,
    /// Size of the last action record (the undo walk's entry point).
    pub cb_action_last: u64,
    /// Position resolving where the transaction's content ends.
    pub log_position: LogPosition,
}

impl EventMemento {
    /// Serialized size in bytes.
    pub const SIZE: usize = 44;

    /// Serializes the memento to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u8(self.event.as_u8());
        cursor.put_u8(self.long_log as u8);
        cursor.put_u16_le(0); // reserved
        cursor.put_u32_le(self.n_participants);
        cursor.put_u64_le(self.txn_id.as_u64());
        cursor.put_u64_le(self.cb_action_last);
        self.log_position.serialize(&mut cursor);
        buf
    }

    /// Deserializes a memento from a byte slice.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> TxnLogResult<Self> {
        let mut buf = &bytes[..];
        let event = TxnEvent::from_u8(buf.get_u8())?;
        let long_log = buf.get_u8() != 0;
        let _reserved = buf.get_u16_le();
        let n_participants = buf.get_u32_le();
        let txn_id = TxnId::new(buf.get_u64_le());
        let cb_action_last = buf.get_u64_le();
        let log_position = LogPosition::deserialize(&mut buf);
        Ok(Self {
            event,
            long_log,
            n_participants,
            txn_id,
            cb_action_last,
            log_position,
        })
    }
}

/// The minimum durable state needed to resume recovery scanning.
///
/// Layout (32 bytes):
/// - log_position: 20 bytes (where the checkpoint's event records begin)
/// - n_uncommitted: 4 bytes (transactions active at checkpoint time)
/// - next_txn_id: 8 bytes (id to assign after recovery)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMemento {
    /// Shared-log position of the checkpoint record block.
    pub log_position: LogPosition,
    /// Count of transactions uncommitted at checkpoint time.
    pub n_uncommitted: u32,
    /// Next transaction id to assign.
    pub next_txn_id: TxnId,
}

impl CheckpointMemento {
    /// Serialized size in bytes.
    pub const SIZE: usize = 32;

    /// Serializes the memento to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.log_position.serialize(&mut cursor);
        cursor.put_u32_le(self.n_uncommitted);
        cursor.put_u64_le(self.next_txn_id.as_u64());
        buf
    }

    /// Deserializes a memento from a byte slice.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        let log_position = LogPosition::deserialize(&mut buf);
        let n_uncommitted = buf.get_u32_le();
        let next_txn_id = TxnId::new(buf.get_u64_le());
        Self {
            log_position,
            n_uncommitted,
            next_txn_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ref() {
        assert_eq!(ParticipantRef::NONE.index(), None);
        let r = ParticipantRef::from_index(0);
        assert_eq!(r.as_u64(), 1);
        assert_eq!(r.index(), Some(0));
        assert_eq!(ParticipantRef::from_raw(r.as_u64()), r);
    }

    #[test]
    fn test_reserved_action_codes() {
        assert!(ACTION_DESCRIBE_PARTICIPANT.is_reserved());
        assert!(ACTION_ROLLBACK_TO_SAVEPOINT.is_reserved());
        assert_ne!(ACTION_DESCRIBE_PARTICIPANT, ACTION_ROLLBACK_TO_SAVEPOINT);
    }

    #[test]
    fn test_action_header_roundtrip() {
        let header = ActionHeader {
            participant: ParticipantRef::from_index(2),
            action_type: LogicalActionType::new(17),
            cb_action_prev: 345,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), ActionHeader::SIZE);
        assert_eq!(ActionHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_savepoint_roundtrip() {
        let svpt = Savepoint {
            cb_logged: 9001,
            cb_action_prev: 24,
        };
        assert_eq!(Savepoint::from_bytes(&svpt.to_bytes()), svpt);
    }

    #[test]
    fn test_inline_position() {
        let pos = LogPosition::inline(512);
        assert!(pos.is_inline());
        assert_eq!(pos.cb_offset, 512);

        let pos = LogPosition {
            page: PageId::new(3),
            offset: 100,
            cb_offset: 8292,
        };
        assert!(!pos.is_inline());
    }

    #[test]
    fn test_event_memento_roundtrip() {
        let memento = EventMemento {
            event: TxnEvent::Commit,
            long_log: true,
            n_participants: 2,
            txn_id: TxnId::new(42),
            cb_action_last: 36,
            log_position: LogPosition {
                page: PageId::new(5),
                offset: 77,
                cb_offset: 16384,
            },
        };
        let decoded = EventMemento::from_bytes(&memento.to_bytes()).unwrap();
        assert_eq!(decoded, memento);
    }

    #[test]
    fn test_event_memento_rejects_unknown_event() {
        let memento = EventMemento {
            event: TxnEvent::Rollback,
            long_log: false,
            n_participants: 0,
            txn_id: TxnId::new(1),
            cb_action_last: 0,
            log_position: LogPosition::inline(0),
        };
        let mut bytes = memento.to_bytes();
        bytes[0] = 0xEE;
        assert!(matches!(
            EventMemento::from_bytes(&bytes),
            Err(TxnLogError::UnknownEvent { code: 0xEE })
        ));
    }

    #[test]
    fn test_checkpoint_memento_roundtrip() {
        let memento = CheckpointMemento {
            log_position: LogPosition {
                page: PageId::new(9),
                offset: 0,
                cb_offset: 36864,
            },
            n_uncommitted: 3,
            next_txn_id: TxnId::new(100),
        };
        assert_eq!(CheckpointMemento::from_bytes(&memento.to_bytes()), memento);
    }
}
