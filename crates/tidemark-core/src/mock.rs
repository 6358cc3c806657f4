//! Mock transport implementation for testing
//!
//! Provides an in-memory [`Connection`] pair for testing RPC and sync logic
//! without real network connections. Named sub-channels rendezvous through a
//! shared table, and each sub-channel endpoint tracks a buffered-amount
//! gauge so backpressure behavior is observable in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::transport::{ByteChannel, Connection, PeerInfo};

/// Which end of the wire a connection handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

/// Shared state between the two ends of a mock connection.
struct MockWire {
    channels: DashMap<String, (Arc<MockByteChannel>, Arc<MockByteChannel>)>,
    closed: AtomicBool,
}

impl MockWire {
    fn endpoint_for(&self, name: &str, side: Side) -> Arc<MockByteChannel> {
        let entry = self
            .channels
            .entry(name.to_string())
            .or_insert_with(MockByteChannel::pair);
        match side {
            Side::A => entry.0.clone(),
            Side::B => entry.1.clone(),
        }
    }
}

/// One end of an in-memory connection.
pub struct MockConnection {
    peer: PeerInfo,
    side: Side,
    wire: Arc<MockWire>,
    tx: mpsc::UnboundedSender<Bytes>,
    /// Sender into our own inbox, used to wake a pending recv on close.
    own_tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MockConnection {
    /// Create a connected pair. `a_sees` describes the peer as seen from the
    /// first handle, `b_sees` from the second.
    pub fn pair(a_sees: PeerInfo, b_sees: PeerInfo) -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let wire = Arc::new(MockWire {
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let a = Arc::new(Self {
            peer: a_sees,
            side: Side::A,
            wire: wire.clone(),
            tx: tx_ab.clone(),
            own_tx: tx_ba.clone(),
            rx: Mutex::new(rx_ba),
        });
        let b = Arc::new(Self {
            peer: b_sees,
            side: Side::B,
            wire,
            tx: tx_ba,
            own_tx: tx_ab,
            rx: Mutex::new(rx_ab),
        });
        (a, b)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.wire.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        let data = rx.recv().await.ok_or(TransportError::ConnectionClosed)?;
        // An empty message is the close sentinel; real frames are never empty.
        if data.is_empty() && self.wire.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(data)
    }

    async fn open_channel(&self, name: &str) -> Result<Arc<dyn ByteChannel>, TransportError> {
        if self.wire.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(self.wire.endpoint_for(name, self.side))
    }

    async fn accept_channel(&self, name: &str) -> Result<Arc<dyn ByteChannel>, TransportError> {
        self.open_channel(name).await
    }

    async fn close(&self) {
        self.wire.closed.store(true, Ordering::SeqCst);
        // Wake any pending recv on either end without touching the rx lock
        // (a pending recv holds it).
        let _ = self.tx.send(Bytes::new());
        let _ = self.own_tx.send(Bytes::new());
    }
}

/// One endpoint of an in-memory sub-channel.
pub struct MockByteChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Bytes we queued that the peer has not drained yet.
    out_buffered: Arc<AtomicUsize>,
    /// Bytes the peer queued that we have not drained yet.
    in_buffered: Arc<AtomicUsize>,
}

impl MockByteChannel {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let buf_ab = Arc::new(AtomicUsize::new(0));
        let buf_ba = Arc::new(AtomicUsize::new(0));

        let a = Arc::new(Self {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            out_buffered: buf_ab.clone(),
            in_buffered: buf_ba.clone(),
        });
        let b = Arc::new(Self {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            out_buffered: buf_ba,
            in_buffered: buf_ab,
        });
        (a, b)
    }
}

#[async_trait]
impl ByteChannel for MockByteChannel {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.out_buffered.fetch_add(data.len(), Ordering::SeqCst);
        self.tx
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        let data = rx.recv().await.ok_or(TransportError::ConnectionClosed)?;
        self.in_buffered.fetch_sub(data.len(), Ordering::SeqCst);
        Ok(data)
    }

    fn buffered_amount(&self) -> usize {
        self.out_buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut rx = self.rx.lock().await;
        rx.close();
    }
}

/// Peer info helper for tests.
pub fn test_peer(signer: &str, device: &str, public_key_hex: &str) -> PeerInfo {
    PeerInfo {
        signer: signer.to_string(),
        device: device.to_string(),
        public_key_hex: public_key_hex.to_string(),
        same_device: false,
    }
}
