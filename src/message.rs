use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

pub type Slot = u64;
pub type Epoch = u64;

/// Protocol the transport negotiates for range requests.
pub const BLOCKS_BY_RANGE_PROTOCOL: &str = "/chain/blocks_by_range/1";

pub fn slot_to_epoch(slot: Slot, slots_per_epoch: u64) -> Epoch {
    slot / slots_per_epoch
}

pub fn epoch_start_slot(epoch: Epoch, slots_per_epoch: u64) -> Slot {
    epoch * slots_per_epoch
}

/// A signed block as received from the wire. The fetcher orders blocks by
/// slot and treats the body as opaque; validation happens downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub slot: Slot,
    pub payload: Vec<u8>,
}

/// Typed request for a range of blocks. With `step > 1` the peer is expected
/// to return one block per `step` slots; the fetcher does not enforce the
/// stride and only trusts the count bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
}

/// Parameters of a scheduled fetch. `cancel` scopes this request only; the
/// fetcher's own token scopes the whole sync session.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub cancel: CancellationToken,
    pub start: Slot,
    pub count: u64,
}

/// Outcome of one fetch request. Check `error` before using `blocks`; on
/// success the blocks preserve on-wire order.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub start: Slot,
    pub count: u64,
    pub blocks: Vec<SignedBlock>,
    pub error: Option<FetchError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_epoch_boundaries() {
        assert_eq!(slot_to_epoch(0, 32), 0);
        assert_eq!(slot_to_epoch(31, 32), 0);
        assert_eq!(slot_to_epoch(32, 32), 1);
        assert_eq!(slot_to_epoch(63, 32), 1);
        assert_eq!(epoch_start_slot(0, 32), 0);
        assert_eq!(epoch_start_slot(5, 32), 160);
    }
}
