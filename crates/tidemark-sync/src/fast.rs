//! Fast sync: bulk cursor streaming over a named sub-channel
//!
//! Used when the receiver has no local history for a group. The receiver
//! asks the sender to stream every change after its watermark; records
//! travel as length-prefixed JSON frames (4-byte big-endian length) over a
//! dedicated byte channel, ending with an explicit zero-length sentinel
//! rather than per-record acks.
//!
//! The sender watches the channel's buffered-amount gauge and sleeps with
//! exponential backoff while the receiver lags, aborting the stream once
//! the next sleep would pass the configured ceiling. The receiver guards
//! against a lost sentinel with an idle read timeout.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use tidemark_core::config::EngineConfig;
use tidemark_core::error::{StorageError, TidemarkResult, TransportError};
use tidemark_core::model::{ChangeKey, ChangeRecord};
use tidemark_core::store::{ChangeStore, Store};
use tidemark_core::transport::ByteChannel;
use tidemark_engine::ChangeEngine;

pub(crate) async fn write_frame(
    channel: &Arc<dyn ByteChannel>,
    payload: &[u8],
) -> Result<(), TransportError> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    channel.send(Bytes::from(frame)).await
}

/// Incremental frame parser over a byte channel. Tolerates frames split
/// or coalesced across transport messages.
pub(crate) struct FrameReader {
    channel: Arc<dyn ByteChannel>,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new(channel: Arc<dyn ByteChannel>) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    /// Next frame payload, or `None` for the end-of-stream sentinel.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        while self.buffer.len() < 4 {
            let data = self.channel.recv().await?;
            self.buffer.extend_from_slice(&data);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buffer[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            self.buffer.drain(..4);
            return Ok(None);
        }
        while self.buffer.len() < 4 + len {
            let data = self.channel.recv().await?;
            self.buffer.extend_from_slice(&data);
        }
        let payload = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Ok(Some(payload))
    }
}

/// Sender side: page the group's changes in cursor order and stream them.
///
/// `since` is the receiver's watermark; records with `modified >= since`
/// are included (re-merging duplicates is harmless, skipping is not).
pub(crate) async fn stream_changes(
    store: &Arc<dyn Store>,
    channel: &Arc<dyn ByteChannel>,
    group: &str,
    since: Option<u64>,
    config: &EngineConfig,
) -> TidemarkResult<usize> {
    let mut cursor = since.map(|modified| ChangeKey {
        id: String::new(),
        modified,
    });
    let mut sent = 0usize;
    loop {
        let page = store
            .group_changes_after(group, cursor.as_ref(), config.fast_sync_page)
            .await?;
        let Some(last) = page.last() else { break };
        cursor = Some(ChangeKey {
            id: last.id.clone(),
            modified: last.modified,
        });
        for record in &page {
            wait_for_capacity(channel, config).await?;
            let payload = serde_json::to_vec(record)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            write_frame(channel, &payload).await?;
            sent += 1;
        }
    }
    write_frame(channel, &[]).await?;
    debug!(group, sent, "fast sync stream complete");
    Ok(sent)
}

/// Sleep with exponential backoff while the receiver lags behind the
/// buffer threshold; error out once the next sleep would pass the ceiling.
async fn wait_for_capacity(
    channel: &Arc<dyn ByteChannel>,
    config: &EngineConfig,
) -> Result<(), TransportError> {
    let mut backoff = config.backoff_start;
    while channel.buffered_amount() > config.buffer_threshold {
        if backoff > config.backoff_ceiling {
            return Err(TransportError::BackoffCeiling(
                config.backoff_ceiling.as_millis() as u64,
            ));
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    Ok(())
}

/// Receiver side: merge streamed records until the sentinel.
///
/// Individual merge failures are logged and skipped so one bad record
/// cannot wedge a bulk transfer; a silent stream longer than the RPC
/// timeout is treated as a lost sentinel.
pub(crate) async fn receive_changes(
    engine: &Arc<ChangeEngine>,
    channel: Arc<dyn ByteChannel>,
    config: &EngineConfig,
) -> TidemarkResult<usize> {
    let mut reader = FrameReader::new(channel);
    let mut merged = 0usize;
    loop {
        let frame = timeout(config.rpc_timeout, reader.read_frame())
            .await
            .map_err(|_| TransportError::Timeout("fast sync stream".to_string()))??;
        let Some(payload) = frame else { break };
        let record: ChangeRecord = serde_json::from_slice(&payload)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let id = record.id.clone();
        match engine.merge_incoming(record).await {
            Ok(_) => merged += 1,
            Err(e) => warn!(id = %id, error = %e, "skipping streamed change"),
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidemark_core::mock::{test_peer, MockConnection};
    use tidemark_core::transport::Connection;

    async fn channel_pair() -> (Arc<dyn ByteChannel>, Arc<dyn ByteChannel>) {
        let (a, b) = MockConnection::pair(
            test_peer("bob", "bob-dev", "bb"),
            test_peer("alice", "alice-dev", "aa"),
        );
        let chan_a = a.open_channel("stream").await.unwrap();
        let chan_b = b.accept_channel("stream").await.unwrap();
        (chan_a, chan_b)
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (tx, rx) = channel_pair().await;
        write_frame(&tx, b"hello").await.unwrap();
        write_frame(&tx, b"").await.unwrap();

        let mut reader = FrameReader::new(rx);
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frames_survive_fragmentation() {
        let (tx, rx) = channel_pair().await;
        // Two frames, delivered as four arbitrary slices.
        let mut wire = Vec::new();
        for payload in [&b"first"[..], &b"second-frame"[..]] {
            wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(payload);
        }
        for piece in wire.chunks(7) {
            tx.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }

        let mut reader = FrameReader::new(rx);
        assert_eq!(reader.read_frame().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(b"second-frame".to_vec())
        );
    }

    #[tokio::test]
    async fn test_backoff_aborts_at_ceiling() {
        let (tx, _rx) = channel_pair().await;
        let config = EngineConfig {
            buffer_threshold: 8,
            backoff_start: Duration::from_millis(1),
            backoff_ceiling: Duration::from_millis(4),
            ..EngineConfig::default()
        };
        // Nobody drains the peer side, so the gauge never falls.
        tx.send(Bytes::from(vec![0u8; 64])).await.unwrap();

        let err = wait_for_capacity(&tx, &config).await.unwrap_err();
        assert!(matches!(err, TransportError::BackoffCeiling(_)));
    }

    #[tokio::test]
    async fn test_receiver_times_out_on_lost_sentinel() {
        let (tx, rx) = channel_pair().await;
        let config = EngineConfig {
            rpc_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        write_frame(&tx, b"\x7b").await.unwrap();
        // A frame header claiming more bytes than ever arrive.
        tx.send(Bytes::copy_from_slice(&100u32.to_be_bytes()))
            .await
            .unwrap();

        let mut reader = FrameReader::new(rx);
        let _ = reader.read_frame().await.unwrap();
        let stalled = timeout(config.rpc_timeout, reader.read_frame()).await;
        assert!(stalled.is_err());
    }
}
