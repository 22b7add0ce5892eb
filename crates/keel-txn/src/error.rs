//! Transaction log error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use keel_common::types::{PageId, ParticipantClassId, TxnId};

/// Result type for transaction log operations.
pub type TxnLogResult<T> = Result<T, TxnLogError>;

/// Errors that can occur during transaction logging and recovery.
///
/// Contract violations (calling methods in the wrong lifecycle state,
/// rolling back to an unknown savepoint) are *not* represented here; they
/// are collaborator bugs and fail fast with a panic. An unreadable page hit
/// by a sequential scan is also not an error: the paged stream reports it as
/// end-of-stream, which is the normal recovery boundary.
#[derive(Debug, Error)]
pub enum TxnLogError {
    /// I/O error from the underlying log storage.
    #[error("log I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// A page that was expected to be valid failed validation.
    ///
    /// Raised only for positioned reads (seeks); a sequential scan treats an
    /// invalid page as end-of-stream instead.
    #[error("log page {page} corrupted: {reason}")]
    PageCorrupted {
        /// The page that failed validation.
        page: PageId,
        /// Why validation failed.
        reason: String,
    },

    /// A stored record ended before its fixed layout was satisfied.
    #[error("truncated record at offset {offset}: needed {expected} bytes")]
    TruncatedRecord {
        /// Stream offset of the truncated record.
        offset: u64,
        /// Bytes the record layout requires.
        expected: usize,
    },

    /// A replay seek targeted a position outside the stream.
    #[error("seek to offset {offset} outside stream of {len} bytes")]
    SeekOutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The stream length.
        len: u64,
    },

    /// An event memento carried an unknown event code.
    #[error("unknown transaction event code {code}")]
    UnknownEvent {
        /// The unrecognized code.
        code: u8,
    },

    /// A logged participant reference could not be resolved.
    #[error("unresolved participant reference {reference}")]
    UnknownParticipant {
        /// The raw logged reference.
        reference: u64,
    },

    /// The participant factory failed to reconstruct a participant.
    #[error("failed to load participant of class {class_id}: {reason}")]
    ParticipantLoad {
        /// Class the factory was asked for.
        class_id: ParticipantClassId,
        /// Factory-supplied reason.
        reason: String,
    },

    /// Recovery needed a transaction's long-log segment but it is gone.
    #[error("long log segment missing for transaction {txn_id}: {path}")]
    LongLogMissing {
        /// The transaction whose segment is missing.
        txn_id: TxnId,
        /// Expected segment path.
        path: PathBuf,
    },

    /// The recovery scan observed an inconsistent event sequence.
    #[error("inconsistent log event sequence: {reason}")]
    InconsistentEvent {
        /// What was inconsistent.
        reason: String,
    },

    /// Configuration error.
    #[error("transaction log configuration error: {reason}")]
    Config {
        /// Why the configuration is invalid.
        reason: String,
    },
}

impl TxnLogError {
    /// Creates a page corrupted error.
    pub fn page_corrupted(page: PageId, reason: impl Into<String>) -> Self {
        Self::PageCorrupted {
            page,
            reason: reason.into(),
        }
    }

    /// Creates a truncated record error.
    pub fn truncated_record(offset: u64, expected: usize) -> Self {
        Self::TruncatedRecord { offset, expected }
    }

    /// Creates a participant load error.
    pub fn participant_load(class_id: ParticipantClassId, reason: impl Into<String>) -> Self {
        Self::ParticipantLoad {
            class_id,
            reason: reason.into(),
        }
    }

    /// Creates an inconsistent event sequence error.
    pub fn inconsistent_event(reason: impl Into<String>) -> Self {
        Self::InconsistentEvent {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if this error indicates log corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::PageCorrupted { .. }
                | Self::TruncatedRecord { .. }
                | Self::SeekOutOfBounds { .. }
                | Self::UnknownEvent { .. }
                | Self::InconsistentEvent { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TxnLogError::page_corrupted(PageId::new(7), "bad checksum");
        assert!(err.is_corruption());

        let err = TxnLogError::config("zero page size");
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk gone");
        let err: TxnLogError = io_err.into();
        assert!(matches!(err, TxnLogError::Io { .. }));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = TxnLogError::truncated_record(128, 44);
        let msg = format!("{}", err);
        assert!(msg.contains("128"));
        assert!(msg.contains("44"));
    }
}
