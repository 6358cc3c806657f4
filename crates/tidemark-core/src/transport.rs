//! Transport trait seams
//!
//! Establishing physical connections (signaling, negotiation) is an external
//! collaborator's job. The engine sees an already-established point-to-point
//! [`Connection`]: ordered byte messages in both directions, plus the
//! ability to open auxiliary named [`ByteChannel`]s for bulk streaming, each
//! exposing a buffered-amount gauge for backpressure.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// What a connection declares about its peer before any verification.
///
/// `public_key_hex` is the peer's *claimed* key; the RPC layer proves
/// possession with a nonce challenge before trusting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's signer id.
    pub signer: String,
    /// The peer's device id (one signer may run many devices).
    pub device: String,
    /// Hex-encoded ed25519 verifying key the peer claims.
    pub public_key_hex: String,
    /// Whether this connection reaches another replica of the local device's
    /// own identity (same-device connections sync first).
    pub same_device: bool,
}

/// An established point-to-point connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The peer's declared identity.
    fn peer(&self) -> &PeerInfo;

    /// Send one message to the peer.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next inbound message. Returns `ConnectionClosed` once the
    /// peer is gone.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Open a named auxiliary channel for bulk streaming.
    async fn open_channel(&self, name: &str) -> Result<Arc<dyn ByteChannel>, TransportError>;

    /// Accept the peer's named auxiliary channel.
    async fn accept_channel(&self, name: &str) -> Result<Arc<dyn ByteChannel>, TransportError>;

    /// Tear the connection down. Subsequent sends and receives fail with
    /// `ConnectionClosed`.
    async fn close(&self);
}

/// A unidirectionally-buffered byte stream with a backpressure gauge.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Bytes queued locally but not yet drained by the peer.
    fn buffered_amount(&self) -> usize;

    async fn close(&self);
}
