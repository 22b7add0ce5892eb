//! System-wide constants for the Keel storage kernel.

// =============================================================================
// Log Page Constants
// =============================================================================

/// Default log page size in bytes (4 KB).
///
/// Matches the typical OS page size; one shared-log page is the unit of
/// durability for group commit.
pub const DEFAULT_LOG_PAGE_SIZE: usize = 4 * 1024;

/// Minimum log page size in bytes.
///
/// Small enough to let tests exercise page boundaries cheaply, large enough
/// to hold the page header plus at least one stored record.
pub const MIN_LOG_PAGE_SIZE: usize = 128;

/// Log page header size in bytes.
///
/// The header contains: checksum (4), instance uuid (16), page number (8),
/// data length (4) = 32 bytes.
pub const LOG_PAGE_HEADER_SIZE: usize = 32;

// =============================================================================
// Transaction Log Constants
// =============================================================================

/// Default threshold at which a transaction's private log spills from memory
/// to its own long-log segment file (64 KB).
pub const DEFAULT_SPILL_THRESHOLD: usize = 64 * 1024;

/// Default group-commit interval in milliseconds.
///
/// A committing thread waits up to this long for another thread's flush to
/// cover its commit record before flushing itself. Zero disables batching.
pub const DEFAULT_GROUP_COMMIT_INTERVAL_MS: u64 = 30;
