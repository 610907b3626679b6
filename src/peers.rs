use libp2p::PeerId;

use crate::message::{Epoch, Slot};

/// Rounding applied to aggregate peer scores, so that peers with nearly
/// identical scores compare as equal and keep their relative order.
pub const SCORE_ROUNDING_FACTOR: f64 = 10_000.0;

/// Read access to the local chain head.
pub trait ChainHead: Send + Sync {
    fn head_slot(&self) -> Slot;
}

/// View of the connected peer set, as maintained by the p2p layer.
pub trait PeerRegistry: Send + Sync {
    /// Returns the best finalized epoch claimed by a majority of connected
    /// peers and the peers at or above it, capped at `max_peers`. Only peers
    /// with a finalized epoch at or above `head_epoch` are considered.
    fn best_finalized(&self, max_peers: usize, head_epoch: Epoch) -> (Epoch, Vec<PeerId>);

    /// Behavioral scorer for peers serving block ranges.
    fn block_provider_scorer(&self) -> &dyn BlockProviderScorer;
}

/// Scores peers by how well they have served block ranges so far.
pub trait BlockProviderScorer: Send + Sync {
    fn score(&self, peer: &PeerId) -> f64;

    /// Sorts peers by score, descending. The sort must be stable so that
    /// equally-scored peers keep their order.
    fn sorted(&self, peers: Vec<PeerId>) -> Vec<PeerId>;

    /// Human-readable rendering of a peer's score, for log output.
    fn format_score(&self, peer: &PeerId) -> String;
}
