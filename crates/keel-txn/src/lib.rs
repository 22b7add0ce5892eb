//! # keel-txn
//!
//! Logical transaction logging and crash recovery for the Keel storage
//! kernel.
//!
//! Transactional storage structures ([`Participant`]s) log high-level
//! *logical* actions, not page images, through a [`Transaction`]. Each
//! transaction writes to its own private stream, which spills to a long-log
//! segment file once it outgrows memory. On commit, the content (or a
//! pointer to the spilled segment) is appended to the single shared
//! [`TransactionLog`], batched into page flushes by group commit. After a
//! crash, a [`RecoveryLog`] scans the shared log from the last checkpoint,
//! redoing committed transactions and undoing unresolved ones, calling back
//! into participants reconstructed by a [`ParticipantFactory`].
//!
//! ## Record chaining
//!
//! Every action record carries the size of its predecessor:
//!
//! ```text
//!          ┌──────────────┬─────────┐┌──────────────┬─────────┐
//!   ...    │ ActionHeader │ payload ││ ActionHeader │ payload │   ...
//!          │ cb_action_prev ────────┼┼──▶ start of previous   │
//!          └──────────────┴─────────┘└──────────────┴─────────┘
//! ```
//!
//! so undo walks the log backward with no separate index, and a savepoint
//! is nothing more than a (bytes-logged, previous-record-size) pair.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// Stored record structures.
pub mod record;

/// Paged log streams.
pub mod stream;

/// Logged participant interfaces.
pub mod participant;

/// Per-transaction lifecycle and private logging.
pub mod txn;

/// The shared transaction log.
pub mod log;

/// Crash recovery.
pub mod recovery;

// Re-exports for convenience
pub use config::TxnLogConfig;
pub use error::{TxnLogError, TxnLogResult};
pub use log::{CheckpointKind, TransactionLog, TxnLogStats};
pub use participant::{Participant, ParticipantFactory};
pub use record::{
    ActionHeader, CheckpointMemento, EventMemento, LogPosition, ParticipantRef, Savepoint,
    TxnEvent, ACTION_DESCRIBE_PARTICIPANT, ACTION_ROLLBACK_TO_SAVEPOINT,
};
pub use recovery::RecoveryLog;
pub use stream::LogInputStream;
pub use txn::{ActionWriter, Transaction, TxnState};
