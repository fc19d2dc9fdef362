//! Policy configuration and validation.
//!
//! All tunables for diversification, read sampling, key blocking and the
//! tracker cap live here. Thresholds are validated once at service
//! construction; the rest of the subsystem treats the config as trusted.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use shared_types::Timestamp;

/// Configuration for the storage-policy layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Number of synthetic sub-keys a diversified key fans out to.
    pub div_width: u8,
    /// Sub-keys actually written per put for SIZE diversification, and the
    /// sample size for non-exhaustive SIZE gets.
    pub frag_width: u8,
    /// Entry count above which a key escalates to SIZE diversification.
    pub max_entries_per_key: u64,
    /// Byte size above which a key escalates to SIZE diversification.
    pub max_bytes_per_key: u64,
    /// Estimated distinct reads per minute above which a key escalates to
    /// FREQUENCY diversification.
    pub max_reads_per_min: u32,
    /// Read-rate sampling window in seconds.
    pub read_window_secs: u64,
    /// Minimum diversification lifetime in seconds.
    pub min_lifetime_secs: u64,
    /// Upper bound of the uniform jitter added to the lifetime.
    pub lifetime_jitter_secs: u64,
    /// Hard cap on live tracked keys; past it new records start degraded.
    pub max_tracked_keys: usize,
    /// Approximate identity capacity of the anti-spam filter.
    pub spam_capacity: usize,
    /// Anti-spam filter rebuild interval in seconds.
    pub spam_window_secs: u64,
    /// Seconds after which an indirectly-learned key block lapses.
    pub indirect_block_timeout_secs: u64,
    /// While set and in the future, diversification is suspended: no new
    /// escalations, and put resolution returns only the original key.
    pub suspend_until: Option<Timestamp>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            div_width: 10,
            frag_width: 2,
            max_entries_per_key: 2048,
            max_bytes_per_key: 2 * 1024 * 1024,
            max_reads_per_min: 30,
            read_window_secs: 600,
            min_lifetime_secs: 12 * 60 * 60,
            lifetime_jitter_secs: 6 * 60 * 60,
            max_tracked_keys: 4096,
            spam_capacity: 4000,
            spam_window_secs: 30 * 60,
            indirect_block_timeout_secs: 24 * 60 * 60,
            suspend_until: None,
        }
    }
}

impl PolicyConfig {
    /// Validate threshold sanity.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.div_width < 2 {
            return Err(PolicyError::InvalidConfig(
                "div_width must be at least 2".to_string(),
            ));
        }
        if self.frag_width == 0 || self.frag_width > self.div_width {
            return Err(PolicyError::InvalidConfig(format!(
                "frag_width {} must be in 1..=div_width ({})",
                self.frag_width, self.div_width
            )));
        }
        if self.max_entries_per_key == 0 || self.max_bytes_per_key == 0 {
            return Err(PolicyError::InvalidConfig(
                "per-key size thresholds cannot be 0".to_string(),
            ));
        }
        if self.read_window_secs == 0 {
            return Err(PolicyError::InvalidConfig(
                "read_window_secs cannot be 0".to_string(),
            ));
        }
        if self.min_lifetime_secs == 0 {
            return Err(PolicyError::InvalidConfig(
                "min_lifetime_secs cannot be 0".to_string(),
            ));
        }
        if self.max_tracked_keys == 0 {
            return Err(PolicyError::InvalidConfig(
                "max_tracked_keys cannot be 0".to_string(),
            ));
        }
        if self.spam_capacity == 0 || self.spam_window_secs == 0 {
            return Err(PolicyError::InvalidConfig(
                "anti-spam parameters cannot be 0".to_string(),
            ));
        }
        if self.indirect_block_timeout_secs == 0 {
            return Err(PolicyError::InvalidConfig(
                "indirect_block_timeout_secs cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether diversification is suspended at `now`.
    pub fn is_suspended(&self, now: Timestamp) -> bool {
        matches!(self.suspend_until, Some(until) if now < until)
    }

    /// Builder-style override for the suspension window.
    pub fn with_suspend_until(mut self, until: Option<Timestamp>) -> Self {
        self.suspend_until = until;
        self
    }

    /// Builder-style override for the entry-count threshold.
    pub fn with_max_entries_per_key(mut self, max: u64) -> Self {
        self.max_entries_per_key = max;
        self
    }

    /// Builder-style override for the byte-size threshold.
    pub fn with_max_bytes_per_key(mut self, max: u64) -> Self {
        self.max_bytes_per_key = max;
        self
    }

    /// Builder-style override for the frequency threshold.
    pub fn with_max_reads_per_min(mut self, max: u32) -> Self {
        self.max_reads_per_min = max;
        self
    }

    /// Builder-style override for the live-key cap.
    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.max_tracked_keys = max;
        self
    }
}
