//! Transaction log configuration.

use std::path::PathBuf;
use std::time::Duration;

use keel_common::constants::{
    DEFAULT_GROUP_COMMIT_INTERVAL_MS, DEFAULT_LOG_PAGE_SIZE, DEFAULT_SPILL_THRESHOLD,
    LOG_PAGE_HEADER_SIZE, MIN_LOG_PAGE_SIZE,
};
use keel_common::types::TxnId;

/// Configuration for the transaction log.
#[derive(Debug, Clone)]
pub struct TxnLogConfig {
    /// Directory holding the shared log and per-transaction long logs.
    pub dir: PathBuf,

    /// Size of one log page in bytes.
    pub page_size: usize,

    /// Bytes a transaction's private log may hold in memory before it spills
    /// to a long-log segment file.
    pub spill_threshold: usize,

    /// How long a committing thread waits for another thread's flush to
    /// cover its commit record before flushing itself. Zero disables
    /// batching: every commit flushes immediately.
    pub group_commit_interval: Duration,
}

impl Default for TxnLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/txnlog"),
            page_size: DEFAULT_LOG_PAGE_SIZE,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            group_commit_interval: Duration::from_millis(DEFAULT_GROUP_COMMIT_INTERVAL_MS),
        }
    }
}

impl TxnLogConfig {
    /// Creates a new configuration rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Sets the log page size.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the private-log spill threshold.
    #[must_use]
    pub fn with_spill_threshold(mut self, threshold: usize) -> Self {
        self.spill_threshold = threshold;
        self
    }

    /// Sets the group-commit interval.
    #[must_use]
    pub fn with_group_commit_interval(mut self, interval: Duration) -> Self {
        self.group_commit_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size < MIN_LOG_PAGE_SIZE {
            return Err(format!(
                "page size must be at least {} bytes",
                MIN_LOG_PAGE_SIZE
            ));
        }
        if self.page_size <= LOG_PAGE_HEADER_SIZE {
            return Err("page size must exceed the page header size".to_string());
        }
        if self.spill_threshold == 0 {
            return Err("spill threshold must be positive".to_string());
        }
        Ok(())
    }

    /// Returns the path of the shared transaction log.
    pub fn shared_log_path(&self) -> PathBuf {
        self.dir.join("txn.log")
    }

    /// Returns the long-log segment path for a transaction.
    pub fn long_log_path(&self, txn_id: TxnId) -> PathBuf {
        self.dir.join(format!("txn{}.dat", txn_id))
    }

    /// Returns the payload capacity of one log page.
    pub fn page_capacity(&self) -> usize {
        self.page_size - LOG_PAGE_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TxnLogConfig::default();
        assert_eq!(config.page_size, DEFAULT_LOG_PAGE_SIZE);
        assert_eq!(config.spill_threshold, DEFAULT_SPILL_THRESHOLD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = TxnLogConfig::new("/tmp/txnlog")
            .with_page_size(512)
            .with_spill_threshold(1024)
            .with_group_commit_interval(Duration::from_millis(5));

        assert_eq!(config.dir, PathBuf::from("/tmp/txnlog"));
        assert_eq!(config.page_size, 512);
        assert_eq!(config.spill_threshold, 1024);
        assert_eq!(config.group_commit_interval, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = TxnLogConfig::default().with_page_size(16);
        assert!(config.validate().is_err());

        let config = TxnLogConfig::default().with_spill_threshold(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let config = TxnLogConfig::new("/data/log");
        assert_eq!(config.shared_log_path(), PathBuf::from("/data/log/txn.log"));
        assert_eq!(
            config.long_log_path(TxnId::new(17)),
            PathBuf::from("/data/log/txn17.dat")
        );
    }

    #[test]
    fn test_page_capacity() {
        let config = TxnLogConfig::default().with_page_size(4096);
        assert_eq!(config.page_capacity(), 4096 - LOG_PAGE_HEADER_SIZE);
    }
}
