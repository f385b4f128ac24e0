//! Tunables for the sync engine

use std::time::Duration;

/// Configuration shared by every subchain of one chain.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of heights one scan invocation walks before yielding.
    pub scan_batch: i64,
    /// Per-chain block download batch size.
    pub download_batch: usize,
    /// The download cache holds up to this multiple of `download_batch`
    /// blocks in flight.
    pub cache_limit_multiplier: usize,
    /// How many blocks past the highest known dirty position a rescan must
    /// progress, with the dirty set empty, before it may stop. Tunable with
    /// no documented derivation; do not infer intent from the default.
    pub rescan_quiet_window: i64,
    /// Override for the number of concurrent exact-match passes. Defaults to
    /// `max(available_parallelism - 1, 1)`.
    pub processing_slots: Option<usize>,
    /// How many times to try the shared reorg lock before blocking on it.
    pub reorg_lock_retries: u32,
    /// Base sleep between reorg lock attempts; jitter of up to the same
    /// amount is added per attempt.
    pub reorg_lock_backoff: Duration,
    /// Scheduler tick driving cache top-up and scan dispatch.
    pub tick_interval: Duration,
}

impl SyncConfig {
    /// Upper bound on blocks concurrently downloading for one subchain.
    pub fn cache_limit(&self) -> usize {
        self.cache_limit_multiplier * self.download_batch
    }

    /// Number of concurrent exact-match passes.
    pub fn processing_slots(&self) -> usize {
        self.processing_slots.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|cores| cores.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scan_batch: 10_000,
            download_batch: 250,
            cache_limit_multiplier: 4,
            rescan_quiet_window: 144,
            processing_slots: None,
            reorg_lock_retries: 5,
            reorg_lock_backoff: Duration::from_millis(10),
            tick_interval: Duration::from_millis(30),
        }
    }
}
