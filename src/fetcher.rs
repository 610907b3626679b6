use std::{io, sync::Arc};

use itertools::Itertools;
use libp2p::PeerId;
use rand::Rng;
use tokio::{
    select,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cfg::FetcherConfig,
    error::FetchError,
    message::{
        epoch_start_slot, slot_to_epoch, BlocksByRangeRequest, FetchRequest, FetchResponse,
        SignedBlock, Slot, BLOCKS_BY_RANGE_PROTOCOL,
    },
    networking::{ChunkDecoder, RangeTransport},
    peer_locks::PeerLockTable,
    peers::{ChainHead, PeerRegistry, SCORE_ROUNDING_FACTOR},
    ratelimit::Collector,
};

// Fetching Algorithm
//
// Callers schedule slot-range requests onto a bounded queue and read the
// outcomes from a response stream.
// 1. The scheduler loop waits until enough suitable peers are connected,
//    then spawns one worker per accepted request.
// 2. A worker validates the request bounds against the best finalized epoch
//    reported by the peer registry.
// 3. Candidate peers are ranked by behavioral score blended with remaining
//    rate-limit capacity, and trimmed to a sample of the best ones.
// 4. The range is requested from peers in rank order; the first peer to
//    stream a clean reply wins. A request to one peer debits that peer's
//    token bucket up front and sleeps when the bucket is out of capacity.
// 5. If every sampled peer fails, the worker publishes an empty response so
//    the caller reschedules the range later.
//
// Responses are published in completion order; the caller's state machine
// reassembles ranges. Blocks within one response preserve on-wire order.

/// Fetches ranges of blocks from peers during initial sync.
pub struct BlockFetcher {
    inner: Arc<Inner>,
    request_sender: mpsc::Sender<FetchRequest>,
    request_receiver: Option<mpsc::Receiver<FetchRequest>>,
    response_sender: Option<mpsc::Sender<FetchResponse>>,
    response_receiver: Option<mpsc::Receiver<FetchResponse>>,
    loop_handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: FetcherConfig,
    chain: Arc<dyn ChainHead>,
    peers: Arc<dyn PeerRegistry>,
    transport: Arc<dyn RangeTransport>,
    decoder: Arc<dyn ChunkDecoder>,
    rate_limiter: Collector,
    peer_locks: PeerLockTable,
    cancel: CancellationToken,
}

impl BlockFetcher {
    pub fn new(
        config: FetcherConfig,
        chain: Arc<dyn ChainHead>,
        peers: Arc<dyn PeerRegistry>,
        transport: Arc<dyn RangeTransport>,
        decoder: Arc<dyn ChunkDecoder>,
    ) -> Self {
        // Allow bursting almost to the full burst capacity, less one batch.
        let burst = config.blocks_per_second * config.burst_factor;
        let rate_limiter = Collector::new(
            config.blocks_per_second as f64,
            (burst - config.blocks_per_second) as i64,
        );
        let (request_sender, request_receiver) = mpsc::channel(config.max_pending_requests);
        let (response_sender, response_receiver) = mpsc::channel(config.max_pending_requests);

        BlockFetcher {
            inner: Arc::new(Inner {
                config,
                chain,
                peers,
                transport,
                decoder,
                rate_limiter,
                peer_locks: PeerLockTable::default(),
                cancel: CancellationToken::new(),
            }),
            request_sender,
            request_receiver: Some(request_receiver),
            response_sender: Some(response_sender),
            response_receiver: Some(response_receiver),
            loop_handle: None,
        }
    }

    /// Boots the scheduler loop. A fetcher is started once; a stopped
    /// fetcher cannot be restarted.
    pub fn start(&mut self) -> Result<(), FetchError> {
        if self.inner.cancel.is_cancelled() {
            return Err(FetchError::ShuttingDown);
        }
        let (Some(requests), Some(responses)) =
            (self.request_receiver.take(), self.response_sender.take())
        else {
            return Err(FetchError::ShuttingDown);
        };
        let inner = self.inner.clone();
        self.loop_handle = Some(tokio::spawn(inner.run(requests, responses)));
        Ok(())
    }

    /// Cancels all in-flight work and waits for the scheduler to drain. No
    /// responses are published after this returns.
    pub async fn stop(&mut self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.loop_handle.take() {
            if let Err(err) = handle.await {
                error!(%err, "fetcher loop task failed");
            }
        }
    }

    /// Queues a fetch of `count` slots starting at `start`. The outcome is
    /// published on [BlockFetcher::responses], not returned here.
    pub async fn schedule_request(
        &self,
        cancel: CancellationToken,
        start: Slot,
        count: u64,
    ) -> Result<(), FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let request = FetchRequest {
            cancel,
            start,
            count,
        };
        select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(FetchError::ShuttingDown),
            sent = self.request_sender.send(request) => {
                sent.map_err(|_| FetchError::ShuttingDown)
            }
        }
    }

    /// The stream of fetch outcomes. Can be taken once.
    pub fn responses(&mut self) -> Option<ReceiverStream<FetchResponse>> {
        self.response_receiver.take().map(ReceiverStream::new)
    }

    /// Start slot of the best finalized epoch claimed by the connected
    /// majority of peers.
    pub fn best_finalized_slot(&self) -> Slot {
        let head_epoch = slot_to_epoch(
            self.inner.chain.head_slot(),
            self.inner.config.slots_per_epoch,
        );
        let (finalized_epoch, _) = self
            .inner
            .peers
            .best_finalized(self.inner.config.max_peers_to_sync, head_epoch);
        epoch_start_slot(finalized_epoch, self.inner.config.slots_per_epoch)
    }

    /// Looks for a slot after `slot` that a peer claims contains a block.
    pub async fn non_skipped_slot_after(
        &self,
        cancel: &CancellationToken,
        slot: Slot,
    ) -> Result<Slot, FetchError> {
        self.inner.non_skipped_slot_after(cancel, slot).await
    }

    /// Picks a random peer other than `excluded`, for callers retrying a
    /// failed request outside the normal fail-over path.
    pub fn select_fail_over_peer(
        &self,
        excluded: PeerId,
        peers: &[PeerId],
    ) -> Result<PeerId, FetchError> {
        let candidates: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|peer| *peer != excluded)
            .collect();
        if candidates.is_empty() {
            return Err(FetchError::NoPeersAvailable);
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index])
    }
}

impl Inner {
    /// Main scheduler loop: listens for incoming requests, runs them on
    /// workers, forwards outgoing responses.
    async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<FetchRequest>,
        responses: mpsc::Sender<FetchResponse>,
    ) {
        // Periodically remove stale peer locks.
        let sweeper = {
            let inner = self.clone();
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = sleep(inner.config.peer_locks_polling_interval) => {
                            inner.peer_locks.sweep(inner.config.peer_lock_max_age);
                        }
                    }
                }
            })
        };

        let mut workers = JoinSet::new();
        loop {
            // Make sure there are available peers before processing requests.
            if let Err(err) = self.wait_for_minimum_peers().await {
                if matches!(err, FetchError::ShuttingDown) {
                    break;
                }
                error!(%err, "failed to wait for peers");
            }

            select! {
                _ = self.cancel.cancelled() => {
                    debug!("context closed, exiting fetcher loop");
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let inner = self.clone();
                    let responses = responses.clone();
                    workers.spawn(async move {
                        let response = inner
                            .handle_request(&request.cancel, request.start, request.count)
                            .await;
                        select! {
                            _ = inner.cancel.cancelled() => {}
                            _ = responses.send(response) => {}
                        }
                    });
                }
            }
        }

        // Drain workers, then let the response channel close by dropping the
        // last sender.
        while workers.join_next().await.is_some() {}
        sweeper.abort();
    }

    /// Polls the registry until enough suitable peers are connected.
    async fn wait_for_minimum_peers(&self) -> Result<Vec<PeerId>, FetchError> {
        let required = self
            .config
            .max_peers_to_sync
            .min(self.config.minimum_sync_peers);
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::ShuttingDown);
            }
            let head_epoch = slot_to_epoch(self.chain.head_slot(), self.config.slots_per_epoch);
            let (_, peers) = self
                .peers
                .best_finalized(self.config.max_peers_to_sync, head_epoch);
            if peers.len() >= required {
                return Ok(peers);
            }
            info!(
                suitable = peers.len(),
                required, "waiting for enough suitable peers before syncing"
            );
            select! {
                _ = self.cancel.cancelled() => return Err(FetchError::ShuttingDown),
                _ = sleep(self.config.handshake_polling_interval) => {}
            }
        }
    }

    /// Validates a scheduled request and runs it against the current peer set.
    async fn handle_request(
        &self,
        cancel: &CancellationToken,
        start: Slot,
        count: u64,
    ) -> FetchResponse {
        let mut response = FetchResponse {
            start,
            count,
            blocks: Vec::new(),
            error: None,
        };

        if cancel.is_cancelled() {
            response.error = Some(FetchError::Cancelled);
            return response;
        }

        let head_epoch = slot_to_epoch(self.chain.head_slot(), self.config.slots_per_epoch);
        let (finalized_epoch, peers) = self
            .peers
            .best_finalized(self.config.max_peers_to_sync, head_epoch);
        if peers.is_empty() {
            response.error = Some(FetchError::NoPeersAvailable);
            return response;
        }

        // Short circuit requests that run past the highest finalized slot,
        // otherwise the caller can loop on them forever.
        let highest_finalized_slot =
            epoch_start_slot(finalized_epoch + 1, self.config.slots_per_epoch);
        if start > highest_finalized_slot {
            response.error = Some(FetchError::SlotTooHigh {
                slot: start,
                finalized_slot: highest_finalized_slot,
            });
            return response;
        }

        match self.fetch_blocks_from_peers(cancel, start, count, peers).await {
            Ok(blocks) => response.blocks = blocks,
            Err(err) => response.error = Some(err),
        }
        response
    }

    /// Fetches the range from the first responsive peer of the filtered set.
    async fn fetch_blocks_from_peers(
        &self,
        cancel: &CancellationToken,
        start: Slot,
        count: u64,
        peers: Vec<PeerId>,
    ) -> Result<Vec<SignedBlock>, FetchError> {
        let peers = self
            .filter_peers(peers, self.config.peers_percentage_per_request)
            .await;
        if peers.is_empty() {
            return Err(FetchError::NoPeersAvailable);
        }
        let request = BlocksByRangeRequest {
            start_slot: start,
            count,
            step: 1,
        };
        for peer in peers {
            match self.request_blocks(cancel, &request, peer).await {
                Ok(blocks) => return Ok(blocks),
                Err(err) => {
                    debug!(%peer, %err, "block range request failed, trying next peer");
                }
            }
        }
        // Every peer failed. Hand the caller an empty batch, it will
        // reschedule the range later.
        Ok(Vec::new())
    }

    /// Ranks candidate peers and trims the list to a sample of the best.
    /// Ordering peers by score and remaining capacity turns in-order peer
    /// processing into a weighted one: throttled peers sink to the back and
    /// cooler peers take over.
    async fn filter_peers(&self, peers: Vec<PeerId>, ratio: f64) -> Vec<PeerId> {
        if peers.is_empty() {
            return peers;
        }
        let scorer = self.peers.block_provider_scorer();

        // Non-responsive peers sink to the tail and fall off once the sample
        // is taken.
        let peers = scorer.sorted(peers);

        let limit = ((peers.len() as f64 * ratio).round() as usize)
            .max(self.config.minimum_sync_peers)
            .min(peers.len());

        let mut scored = Vec::with_capacity(limit);
        for peer in peers.into_iter().take(limit) {
            let score = self.aggregate_score(&peer).await;
            scored.push((peer, score));
        }
        scored
            .into_iter()
            .sorted_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(peer, _)| peer)
            .collect()
    }

    /// Blends a peer's behavioral score with its remaining rate-limit
    /// headroom, weighted by `peer_filter_capacity_weight`.
    async fn aggregate_score(&self, peer: &PeerId) -> f64 {
        let score = self.peers.block_provider_scorer().score(peer);
        let lock = self.peer_locks.acquire(*peer);
        let _guard = lock.lock().await;
        let remaining = self.rate_limiter.remaining(&peer.to_string()) as f64;
        if remaining < self.config.blocks_per_second as f64 {
            // No capacity left for a good peer; let a less performant peer
            // take a chance.
            return 0.0;
        }
        let capacity_score = remaining / self.rate_limiter.capacity() as f64;
        let weight = self.config.peer_filter_capacity_weight;
        let overall = score * (1.0 - weight) + capacity_score * weight;
        (overall * SCORE_ROUNDING_FACTOR).round() / SCORE_ROUNDING_FACTOR
    }

    /// Streams one range request to one peer and drains the chunked reply.
    /// The peer's token bucket is debited up front; nothing is refunded on
    /// failure.
    async fn request_blocks(
        &self,
        cancel: &CancellationToken,
        request: &BlocksByRangeRequest,
        peer: PeerId,
    ) -> Result<Vec<SignedBlock>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let lock = self.peer_locks.acquire(peer);
        let guard = lock.lock().await;
        let key = peer.to_string();
        debug!(
            %peer,
            start = request.start_slot,
            count = request.count,
            step = request.step,
            capacity = self.rate_limiter.remaining(&key),
            score = %self.peers.block_provider_scorer().format_score(&peer),
            "requesting blocks"
        );
        if self.rate_limiter.remaining(&key) < request.count as i64 {
            debug!(%peer, "slowing down for rate limit");
            select! {
                _ = self.cancel.cancelled() => return Err(FetchError::ShuttingDown),
                _ = sleep(self.rate_limiter.till_empty(&key)) => {
                    // Peer has gathered enough capacity to be polled again.
                }
            }
        }
        self.rate_limiter.add(&key, request.count as i64);
        drop(guard);

        let mut stream = self
            .transport
            .send(request, BLOCKS_BY_RANGE_PROTOCOL, peer)
            .await
            .map_err(|err| FetchError::PeerProtocol(err.to_string()))?;

        let capacity = request.count.min(self.config.max_request_blocks) as usize;
        let mut blocks = Vec::with_capacity(capacity);
        let mut result = Ok(());
        loop {
            // A dishonest peer could stream chunks forever; stop at the cap.
            if blocks.len() as u64 >= self.config.max_request_blocks {
                break;
            }
            match self
                .decoder
                .read_chunked_block(&mut *stream, blocks.is_empty())
                .await
            {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => break,
                Err(err) => {
                    result = Err(FetchError::PeerProtocol(err.to_string()));
                    break;
                }
            }
        }

        if let Err(err) = stream.full_close().await {
            if err.kind() != io::ErrorKind::ConnectionReset {
                error!(%err, protocol = stream.protocol(), "failed to close stream");
            }
        }
        result.map(|()| blocks)
    }

    /// Looks for a slot after `slot` that a peer claims contains a block.
    /// Past the initial window only one random slot per epoch is sampled, so
    /// the returned slot is not necessarily the first non-skipped one;
    /// callers must tolerate re-requesting when no progress is possible.
    async fn non_skipped_slot_after(
        &self,
        cancel: &CancellationToken,
        slot: Slot,
    ) -> Result<Slot, FetchError> {
        let slots_per_epoch = self.config.slots_per_epoch;
        let head_epoch = slot_to_epoch(self.chain.head_slot(), slots_per_epoch);
        let (finalized_epoch, peers) = self
            .peers
            .best_finalized(self.config.max_peers_to_sync, head_epoch);
        debug!(
            start = slot,
            head_epoch, finalized_epoch, "searching for non-skipped slot"
        );
        // No peer is ahead of our own head, nothing to search.
        if finalized_epoch <= head_epoch {
            return Err(FetchError::SlotTooHigh {
                slot,
                finalized_slot: epoch_start_slot(finalized_epoch, slots_per_epoch),
            });
        }
        let peers = self
            .filter_peers(peers, self.config.peers_percentage_per_request)
            .await;
        if peers.is_empty() {
            return Err(FetchError::NoPeersAvailable);
        }
        let mut next_peer = {
            let mut index = 0;
            move || {
                let peer = peers[index % peers.len()];
                index += 1;
                peer
            }
        };

        // Check the first several epochs in full, without resorting to
        // random sampling.
        let start = slot + 1;
        let end = start + self.config.non_skipped_slots_full_search_epochs * slots_per_epoch;
        let mut ind = start;
        while ind < end {
            let found = self
                .probe_range(cancel, slot, next_peer(), ind, slots_per_epoch, 1)
                .await?;
            if let Some(found) = found {
                return Ok(found);
            }
            ind += slots_per_epoch;
        }

        // Leap forward sampling a single random slot per epoch, to quickly
        // find a close enough epoch where a non-empty slot definitely exists.
        let slot = slot + self.config.non_skipped_slots_full_search_epochs * slots_per_epoch;
        let upper_limit = epoch_start_slot(finalized_epoch + 1, slots_per_epoch);
        let mut upper_bound = upper_limit;
        let mut ind = slot + 1;
        while ind < upper_bound {
            let offset = rand::thread_rng().gen_range(0..slots_per_epoch);
            let found = self
                .probe_range(
                    cancel,
                    slot,
                    next_peer(),
                    ind + offset,
                    slots_per_epoch / 2,
                    slots_per_epoch,
                )
                .await?;
            if let Some(found) = found {
                if found <= upper_bound {
                    upper_bound = found;
                    break;
                }
            }
            ind += slots_per_epoch * slots_per_epoch / 2;
        }

        // An epoch with a non-empty slot is located. Back off one epoch and
        // check every slot of the two nearby epochs.
        if upper_bound > slots_per_epoch {
            upper_bound -= slots_per_epoch;
        }
        upper_bound = epoch_start_slot(
            slot_to_epoch(upper_bound, slots_per_epoch),
            slots_per_epoch,
        );
        let next_slot = self
            .probe_range(
                cancel,
                slot,
                next_peer(),
                upper_bound,
                slots_per_epoch * 2,
                1,
            )
            .await?
            .unwrap_or(0);
        if next_slot < slot || upper_limit < next_slot {
            return Err(FetchError::InvalidRange);
        }
        Ok(next_slot)
    }

    /// Asks one peer for a strided range; returns the first returned slot
    /// past `reference`, if any.
    async fn probe_range(
        &self,
        cancel: &CancellationToken,
        reference: Slot,
        peer: PeerId,
        start: Slot,
        count: u64,
        step: u64,
    ) -> Result<Option<Slot>, FetchError> {
        let request = BlocksByRangeRequest {
            start_slot: start,
            count,
            step,
        };
        let blocks = self.request_blocks(cancel, &request, peer).await?;
        Ok(blocks
            .iter()
            .map(|block| block.slot)
            .find(|slot| *slot > reference))
    }
}
