//! The transport seam for range requests. The fetcher only ever sees the
//! traits below; the p2p layer supplies implementations backed by real
//! substreams, and tests substitute deterministic fakes.

use std::io;

use anyhow::Result;
use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{
    core::upgrade::{read_length_prefixed, write_length_prefixed},
    PeerId,
};

use crate::message::{BlocksByRangeRequest, SignedBlock};

/// Largest accepted chunk on a range stream.
const MAX_CHUNK_SIZE: usize = 1_000_000;

/// A stream opened for a single range request, yielding length-delimited
/// chunks until the remote side finishes.
#[async_trait]
pub trait RangeStream: Send {
    /// Protocol this stream was negotiated for.
    fn protocol(&self) -> &str;

    /// Next length-delimited frame. `Ok(None)` on a clean end of stream.
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Close both directions, waiting for the remote half to drain.
    async fn full_close(&mut self) -> io::Result<()>;
}

/// Opens streams to remote peers for typed range requests.
#[async_trait]
pub trait RangeTransport: Send + Sync {
    async fn send(
        &self,
        request: &BlocksByRangeRequest,
        topic: &str,
        peer: PeerId,
    ) -> Result<Box<dyn RangeStream>>;
}

/// Reads one block at a time off a range stream.
#[async_trait]
pub trait ChunkDecoder: Send + Sync {
    /// Returns `Ok(None)` on a clean end of stream. The first chunk of a
    /// reply may be framed differently by some protocols, hence the flag.
    async fn read_chunked_block(
        &self,
        stream: &mut dyn RangeStream,
        first_chunk: bool,
    ) -> Result<Option<SignedBlock>>;
}

/// Length-prefixed framing over any byte stream.
pub struct LengthPrefixedStream<S> {
    io: S,
    protocol: String,
}

impl<S> LengthPrefixedStream<S> {
    pub fn new(io: S, protocol: impl Into<String>) -> Self {
        LengthPrefixedStream {
            io,
            protocol: protocol.into(),
        }
    }
}

#[async_trait]
impl<S> RangeStream for LengthPrefixedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let frame = read_length_prefixed(&mut self.io, MAX_CHUNK_SIZE).await?;
        // A zero-length read means the remote closed its write half.
        if frame.is_empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    async fn full_close(&mut self) -> io::Result<()> {
        self.io.close().await
    }
}

/// Default decoder: JSON-encoded blocks in length-prefixed frames.
pub struct JsonChunkDecoder;

#[async_trait]
impl ChunkDecoder for JsonChunkDecoder {
    async fn read_chunked_block(
        &self,
        stream: &mut dyn RangeStream,
        _first_chunk: bool,
    ) -> Result<Option<SignedBlock>> {
        let Some(frame) = stream.read_frame().await? else {
            return Ok(None);
        };
        let block = serde_json::from_slice(&frame)?;
        Ok(Some(block))
    }
}

/// Writes one block as a length-prefixed chunk. The serving side of the
/// protocol; also used to stage replies in tests.
pub async fn write_chunked_block<W>(io: &mut W, block: &SignedBlock) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let data = serde_json::to_vec(block)?;
    write_length_prefixed(io, data).await?;
    Ok(())
}
