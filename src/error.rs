use crate::message::Slot;

/// Errors surfaced to the sync state machine through fetch responses.
///
/// Peer-local failures (malformed chunks, stream resets) drive fail-over
/// internally and only reach the caller when every candidate peer failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("no peers available, waiting for reconnect")]
    NoPeersAvailable,
    #[error("fetcher is shutting down, reinitialize")]
    ShuttingDown,
    #[error("slot {slot} is higher than the finalized slot {finalized_slot}")]
    SlotTooHigh { slot: Slot, finalized_slot: Slot },
    #[error("request cancelled")]
    Cancelled,
    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),
    #[error("invalid range for non-skipped slot")]
    InvalidRange,
}
