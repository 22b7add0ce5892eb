//! # keel-common
//!
//! Common types and constants for the Keel storage kernel.
//!
//! This crate provides the foundational identifier types shared across the
//! kernel's components:
//!
//! - **Types**: core identifiers (`TxnId`, `PageId`, `SavepointId`,
//!   `ParticipantClassId`, `LogicalActionType`)
//! - **Constants**: system-wide constants and limits
//!
//! ## Example
//!
//! ```rust
//! use keel_common::types::{PageId, TxnId};
//!
//! let page = PageId::new(42);
//! let txn = TxnId::FIRST;
//! assert!(txn.is_valid());
//! assert_eq!(page.as_u64(), 42);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{LogicalActionType, PageId, ParticipantClassId, SavepointId, TxnId};
