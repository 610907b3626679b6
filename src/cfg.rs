use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherConfig {
    /// How many scheduled fetch requests may be pending at once. Also bounds the
    /// number of concurrent workers, since each accepted request spawns at most one.
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,
    /// Fraction of suitable peers used for a single request.
    #[serde(default = "default_peers_percentage_per_request")]
    pub peers_percentage_per_request: f64,
    /// Polling interval while waiting for enough connected peers.
    #[serde(default = "default_handshake_polling_interval")]
    pub handshake_polling_interval: Duration,
    /// How often stale peer locks are swept.
    #[serde(default = "default_peer_locks_polling_interval")]
    pub peer_locks_polling_interval: Duration,
    /// Maximum time before an unused peer lock is purged.
    #[serde(default = "default_peer_lock_max_age")]
    pub peer_lock_max_age: Duration,
    /// How many epochs the non-skipped slot search checks in full, before
    /// resorting to sampling a single random slot per epoch.
    #[serde(default = "default_non_skipped_slots_full_search_epochs")]
    pub non_skipped_slots_full_search_epochs: u64,
    /// How much a peer's remaining rate-limit capacity affects its aggregate
    /// score, i.e. 0.3 means capacity determines 30% of the score.
    #[serde(default = "default_peer_filter_capacity_weight")]
    pub peer_filter_capacity_weight: f64,
    /// Steady per-peer rate of the token bucket, in blocks per second.
    #[serde(default = "default_blocks_per_second")]
    pub blocks_per_second: u64,
    /// Multiplier on `blocks_per_second` that sets the burst ceiling.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: u64,
    /// Hard cap on blocks accepted from a single range reply.
    #[serde(default = "default_max_request_blocks")]
    pub max_request_blocks: u64,
    /// Maximum peers considered when querying the best finalized epoch.
    #[serde(default = "default_max_peers_to_sync")]
    pub max_peers_to_sync: usize,
    /// Minimum suitable peers required before requests are processed.
    #[serde(default = "default_minimum_sync_peers")]
    pub minimum_sync_peers: usize,
    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            max_pending_requests: default_max_pending_requests(),
            peers_percentage_per_request: default_peers_percentage_per_request(),
            handshake_polling_interval: default_handshake_polling_interval(),
            peer_locks_polling_interval: default_peer_locks_polling_interval(),
            peer_lock_max_age: default_peer_lock_max_age(),
            non_skipped_slots_full_search_epochs: default_non_skipped_slots_full_search_epochs(),
            peer_filter_capacity_weight: default_peer_filter_capacity_weight(),
            blocks_per_second: default_blocks_per_second(),
            burst_factor: default_burst_factor(),
            max_request_blocks: default_max_request_blocks(),
            max_peers_to_sync: default_max_peers_to_sync(),
            minimum_sync_peers: default_minimum_sync_peers(),
            slots_per_epoch: default_slots_per_epoch(),
        }
    }
}

fn default_max_pending_requests() -> usize {
    64
}

fn default_peers_percentage_per_request() -> f64 {
    0.75
}

fn default_handshake_polling_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_peer_locks_polling_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_peer_lock_max_age() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_non_skipped_slots_full_search_epochs() -> u64 {
    10
}

fn default_peer_filter_capacity_weight() -> f64 {
    0.2
}

fn default_blocks_per_second() -> u64 {
    64
}

fn default_burst_factor() -> u64 {
    2
}

fn default_max_request_blocks() -> u64 {
    1024
}

fn default_max_peers_to_sync() -> usize {
    15
}

fn default_minimum_sync_peers() -> usize {
    3
}

fn default_slots_per_epoch() -> u64 {
    32
}
