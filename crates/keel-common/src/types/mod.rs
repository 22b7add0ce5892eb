//! Core type definitions for the Keel storage kernel.

mod ids;

pub use ids::{LogicalActionType, PageId, ParticipantClassId, SavepointId, TxnId};
