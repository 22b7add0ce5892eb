//! Core identifier types for the Keel storage kernel.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier.
///
/// Transaction IDs are assigned monotonically at transaction start, so their
/// order reflects *start* order. Commit order in the shared log may differ.
///
/// # Example
///
/// ```rust
/// use keel_common::types::TxnId;
///
/// let txn = TxnId::FIRST;
/// assert!(txn.is_valid());
/// assert!(txn.next() > txn);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction ID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// First valid transaction ID.
    pub const FIRST: Self = Self(1);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next transaction ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid transaction ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<TxnId> for u64 {
    #[inline]
    fn from(id: TxnId) -> Self {
        id.0
    }
}

/// Log page identifier.
///
/// Identifies one fixed-size page within a paged log stream. Pages are
/// numbered linearly from zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PageId(u64);

impl PageId {
    /// Invalid page ID constant, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// First page of a linear log stream.
    pub const FIRST: Self = Self(0);

    /// Creates a new `PageId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next page ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid page ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "PageId(INVALID)")
        } else {
            write!(f, "PageId({})", self.0)
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<PageId> for u64 {
    #[inline]
    fn from(id: PageId) -> Self {
        id.0
    }
}

/// Savepoint identifier.
///
/// An opaque index into a transaction's savepoint list. Only meaningful for
/// the transaction that created it, and only until that transaction ends.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SavepointId(u32);

impl SavepointId {
    /// Creates a new `SavepointId` from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SavepointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SavepointId({})", self.0)
    }
}

impl fmt::Display for SavepointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant class identifier.
///
/// Identifies the *kind* of a logged participant (for example, a B-tree
/// writer) so that recovery can dispatch to the right factory logic when
/// reconstructing it from its logged description.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ParticipantClassId(u64);

impl ParticipantClassId {
    /// Creates a new `ParticipantClassId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ParticipantClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantClassId({:#018x})", self.0)
    }
}

impl fmt::Display for ParticipantClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Logical action type code.
///
/// Action types tag the records a participant writes so its redo/undo logic
/// can dispatch on them. Codes at or above [`LogicalActionType::RESERVED_BASE`]
/// are reserved for the transaction log itself; everything below is
/// participant-defined and opaque to the log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LogicalActionType(u32);

impl LogicalActionType {
    /// First reserved action code; participant codes must be below this.
    pub const RESERVED_BASE: u32 = 0xFFFF_0000;

    /// Creates a new `LogicalActionType` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true if this code is reserved for the transaction log.
    #[inline]
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::RESERVED_BASE
    }
}

impl fmt::Debug for LogicalActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalActionType({:#010x})", self.0)
    }
}

impl fmt::Display for LogicalActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for LogicalActionType {
    #[inline]
    fn from(code: u32) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id() {
        let txn = TxnId::new(100);
        assert_eq!(txn.as_u64(), 100);
        assert!(txn.is_valid());
        assert!(!TxnId::INVALID.is_valid());
        assert_eq!(txn.next().as_u64(), 101);
    }

    #[test]
    fn test_page_id() {
        let page = PageId::new(42);
        assert_eq!(page.as_u64(), 42);
        assert!(page.is_valid());
        assert!(!PageId::INVALID.is_valid());
        assert_eq!(page.next().as_u64(), 43);
    }

    #[test]
    fn test_savepoint_id() {
        let svpt = SavepointId::new(3);
        assert_eq!(svpt.index(), 3);
    }

    #[test]
    fn test_action_type_reservation() {
        assert!(!LogicalActionType::new(1).is_reserved());
        assert!(!LogicalActionType::new(0xFFFE_FFFF).is_reserved());
        assert!(LogicalActionType::new(0xFFFF_0001).is_reserved());
    }

    #[test]
    fn test_ordering() {
        assert!(TxnId::new(1) < TxnId::new(2));
        assert!(PageId::new(1) < PageId::new(2));
    }
}
