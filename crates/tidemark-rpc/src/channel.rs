//! Authenticated RPC over a connection's control stream
//!
//! [`RpcChannel`] wraps a [`Connection`] with signed call/response
//! correlation, chunked transfer for oversized messages, per-call timeouts,
//! and an identity-proof handshake. A channel starts unverified: the only
//! inbound call it will serve is `prove_identity`. Once [`verify_peer`]
//! confirms the peer controls the key it declared, the peer's key is
//! registered with the keyring and the remaining methods open up, routed to
//! the injected [`RpcService`].
//!
//! [`verify_peer`]: RpcChannel::verify_peer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use tidemark_core::config::EngineConfig;
use tidemark_core::error::{ProtocolError, TidemarkResult, TransportError, VerificationError};
use tidemark_core::keyring::{parse_verifying_key, verify_with_key, Keyring};
use tidemark_core::transport::{Connection, PeerInfo};

use crate::message::{RpcMessage, RpcMethod};

/// Handler for the methods the channel does not serve itself.
///
/// `prove_identity` and `ping` terminate in the channel; everything else in
/// [`RpcMethod`] lands here with the verified peer attached.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle(
        &self,
        peer: &PeerInfo,
        method: RpcMethod,
        args: Value,
    ) -> TidemarkResult<Value>;
}

/// A service for channels that only originate calls.
pub struct NullService;

#[async_trait]
impl RpcService for NullService {
    async fn handle(
        &self,
        _peer: &PeerInfo,
        method: RpcMethod,
        _args: Value,
    ) -> TidemarkResult<Value> {
        Err(ProtocolError::NotCallable(method.name().to_string()).into())
    }
}

/// Most fragments one chunked message may carry, bounding what a single
/// inbound frame can make the reassembly table allocate.
const MAX_CHUNKS: usize = 1024;

/// Context prefix for identity-proof signatures, keeping the signed byte
/// space disjoint from change records and RPC envelopes.
const IDENTITY_PROOF_CONTEXT: &[u8] = b"tidemark-identity-proof:";

fn identity_proof_payload(nonce_hex: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(IDENTITY_PROOF_CONTEXT.len() + nonce_hex.len());
    payload.extend_from_slice(IDENTITY_PROOF_CONTEXT);
    payload.extend_from_slice(nonce_hex.as_bytes());
    payload
}

/// Reassembly buffer for one chunked message.
struct ChunkBuffer {
    total: usize,
    parts: Vec<Option<String>>,
    filled: usize,
}

pub struct RpcChannel {
    conn: Arc<dyn Connection>,
    keyring: Arc<Keyring>,
    service: Arc<dyn RpcService>,
    config: EngineConfig,
    /// The peer's claimed key, trusted only after the identity proof.
    peer_key: VerifyingKey,
    verified: AtomicBool,
    pending: DashMap<String, oneshot::Sender<Result<Value, TransportError>>>,
    chunks: DashMap<String, ChunkBuffer>,
}

impl RpcChannel {
    pub fn new(
        conn: Arc<dyn Connection>,
        keyring: Arc<Keyring>,
        service: Arc<dyn RpcService>,
        config: EngineConfig,
    ) -> TidemarkResult<Arc<Self>> {
        let peer_key = parse_verifying_key(&conn.peer().public_key_hex)?;
        Ok(Arc::new(Self {
            conn,
            keyring,
            service,
            config,
            peer_key,
            verified: AtomicBool::new(false),
            pending: DashMap::new(),
            chunks: DashMap::new(),
        }))
    }

    pub fn peer(&self) -> &PeerInfo {
        self.conn.peer()
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    /// Whether the peer has proven its identity to us.
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    /// Run the inbound pump until the connection closes. Pending calls are
    /// rejected when the pump exits.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            loop {
                match channel.conn.recv().await {
                    Ok(data) => {
                        if let Err(e) = channel.handle_frame(&data).await {
                            warn!(peer = %channel.peer().signer, error = %e, "dropping inbound frame");
                        }
                    }
                    Err(_) => break,
                }
            }
            channel.fail_pending();
        })
    }

    /// Challenge the peer to sign a fresh nonce with the key it declared.
    /// Success registers the key and flips the channel to verified.
    pub async fn verify_peer(&self) -> TidemarkResult<()> {
        let nonce: [u8; 32] = rand::random();
        let nonce_hex = hex::encode(nonce);
        let result = self
            .call(RpcMethod::ProveIdentity, json!({ "nonce": nonce_hex }))
            .await?;
        let signature = result
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                VerificationError::IdentityProofFailed("response carries no signature".to_string())
            })?;

        let peer = self.conn.peer();
        verify_with_key(
            &self.peer_key,
            &peer.signer,
            &identity_proof_payload(&nonce_hex),
            signature,
        )
        .map_err(
            |_| {
                VerificationError::IdentityProofFailed(format!(
                    "{} does not control the declared key",
                    peer.signer
                ))
            },
        )?;

        self.keyring.register(peer.signer.clone(), self.peer_key);
        self.verified.store(true, Ordering::SeqCst);
        debug!(peer = %peer.signer, device = %peer.device, "peer identity verified");
        Ok(())
    }

    /// Liveness probe.
    pub async fn ping(&self) -> TidemarkResult<()> {
        let result = self.call(RpcMethod::Ping, json!({})).await?;
        if result == json!("pong") {
            Ok(())
        } else {
            Err(ProtocolError::MalformedMessage("unexpected ping reply".to_string()).into())
        }
    }

    /// Issue one call and await its response under the configured timeout.
    pub async fn call(&self, method: RpcMethod, args: Value) -> TidemarkResult<Value> {
        let id = Uuid::new_v4().to_string();
        let mut msg = RpcMessage::Call {
            id: id.clone(),
            fn_name: method.name().to_string(),
            args,
            signer: self.keyring.local_signer().to_string(),
            signature: String::new(),
        };
        let signed = self.keyring.sign(&msg.signable_bytes()?);
        if let RpcMessage::Call { signature, .. } = &mut msg {
            *signature = signed;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(e) = self.send_message(&msg).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout(method.name().to_string()).into())
            }
        }
    }

    /// Tear down the channel. Every pending call resolves with
    /// `ConnectionClosed`; none is left waiting out its timeout.
    pub async fn close(&self) {
        self.conn.close().await;
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(TransportError::ConnectionClosed));
            }
        }
        self.chunks.clear();
    }

    async fn send_message(&self, msg: &RpcMessage) -> TidemarkResult<()> {
        let bytes = msg.to_bytes()?;
        if bytes.len() <= self.config.max_message_size {
            self.conn.send(Bytes::from(bytes)).await?;
            return Ok(());
        }

        let total = bytes.len().div_ceil(self.config.chunk_size);
        if total > MAX_CHUNKS {
            return Err(TransportError::SendFailed(format!(
                "message needs {} chunks, limit is {}",
                total, MAX_CHUNKS
            ))
            .into());
        }
        debug!(id = %msg.id(), total, "chunking oversized message");
        for (i, part) in bytes.chunks(self.config.chunk_size).enumerate() {
            let chunk = RpcMessage::Chunk {
                id: msg.id().to_string(),
                i_chunk: i,
                total_chunks: total,
                chunk: BASE64.encode(part),
            };
            self.conn.send(Bytes::from(chunk.to_bytes()?)).await?;
        }
        Ok(())
    }

    async fn handle_frame(&self, data: &[u8]) -> TidemarkResult<()> {
        match RpcMessage::from_bytes(data)? {
            RpcMessage::Chunk {
                id,
                i_chunk,
                total_chunks,
                chunk,
            } => {
                if let Some(whole) = self.absorb_chunk(id, i_chunk, total_chunks, chunk)? {
                    match RpcMessage::from_bytes(&whole)? {
                        RpcMessage::Chunk { .. } => Err(ProtocolError::MalformedMessage(
                            "chunk payload is itself a chunk".to_string(),
                        )
                        .into()),
                        msg => self.dispatch(msg).await,
                    }
                } else {
                    Ok(())
                }
            }
            msg => self.dispatch(msg).await,
        }
    }

    /// Buffer one fragment; returns the reassembled bytes once every slot
    /// is filled. Fragments may arrive in any order.
    fn absorb_chunk(
        &self,
        id: String,
        i_chunk: usize,
        total_chunks: usize,
        chunk: String,
    ) -> TidemarkResult<Option<Vec<u8>>> {
        // The count is an unsigned wire field; bound it before allocating.
        if total_chunks == 0 || total_chunks > MAX_CHUNKS || i_chunk >= total_chunks {
            return Err(ProtocolError::MalformedMessage(format!(
                "chunk {}/{} out of range",
                i_chunk, total_chunks
            ))
            .into());
        }
        let mut entry = self.chunks.entry(id.clone()).or_insert_with(|| ChunkBuffer {
            total: total_chunks,
            parts: vec![None; total_chunks],
            filled: 0,
        });
        if entry.total != total_chunks {
            return Err(ProtocolError::MalformedMessage(format!(
                "inconsistent chunk count for message {}",
                id
            ))
            .into());
        }
        if entry.parts[i_chunk].is_none() {
            entry.parts[i_chunk] = Some(chunk);
            entry.filled += 1;
        }
        if entry.filled < entry.total {
            return Ok(None);
        }
        drop(entry);

        let Some((_, buffer)) = self.chunks.remove(&id) else {
            return Ok(None);
        };
        let mut whole = Vec::new();
        for part in buffer.parts.into_iter().flatten() {
            let decoded = BASE64
                .decode(part)
                .map_err(|e| ProtocolError::MalformedMessage(format!("bad chunk base64: {}", e)))?;
            whole.extend_from_slice(&decoded);
        }
        Ok(Some(whole))
    }

    async fn dispatch(&self, msg: RpcMessage) -> TidemarkResult<()> {
        let signable = msg.signable_bytes()?;
        match msg {
            RpcMessage::Call {
                id,
                fn_name,
                args,
                signer,
                signature,
            } => {
                if let Err(e) = self.check_envelope(&signer, &signable, &signature) {
                    return self.respond(&id, Err(e)).await;
                }
                let outcome = self.execute(&fn_name, args).await;
                self.respond(&id, outcome).await
            }
            RpcMessage::Response {
                id,
                result,
                error,
                signer,
                signature,
            } => {
                self.check_envelope(&signer, &signable, &signature)?;
                let Some((_, tx)) = self.pending.remove(&id) else {
                    debug!(id = %id, "response for unknown or timed-out call");
                    return Ok(());
                };
                let outcome = match error {
                    Some(message) => Err(TransportError::Remote(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
                Ok(())
            }
            RpcMessage::Chunk { .. } => Err(ProtocolError::MalformedMessage(
                "unexpected chunk in dispatch".to_string(),
            )
            .into()),
        }
    }

    /// Inbound envelopes must name the connection's peer and verify against
    /// its declared key, whether or not the handshake has completed.
    fn check_envelope(
        &self,
        signer: &str,
        signable: &[u8],
        signature: &str,
    ) -> TidemarkResult<()> {
        let peer = self.conn.peer();
        if signer != peer.signer {
            return Err(VerificationError::UnknownSigner(signer.to_string()).into());
        }
        verify_with_key(&self.peer_key, signer, signable, signature)?;
        Ok(())
    }

    async fn execute(&self, fn_name: &str, args: Value) -> TidemarkResult<Value> {
        let Some(method) = RpcMethod::parse(fn_name) else {
            warn!(peer = %self.peer().signer, fn_name, "rejecting unknown rpc function");
            return Err(ProtocolError::NotCallable(fn_name.to_string()).into());
        };
        match method {
            RpcMethod::ProveIdentity => {
                let nonce = args.get("nonce").and_then(Value::as_str).ok_or_else(|| {
                    ProtocolError::MalformedMessage("identity proof without nonce".to_string())
                })?;
                // Only a fresh hex challenge is ever signed, and only under
                // the identity-proof context prefix.
                if nonce.len() != 64 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(ProtocolError::MalformedMessage(
                        "identity proof nonce must be 32 hex-encoded bytes".to_string(),
                    )
                    .into());
                }
                Ok(json!({ "signature": self.keyring.sign(&identity_proof_payload(nonce)) }))
            }
            _ if !self.is_verified() => Err(VerificationError::Unverified.into()),
            RpcMethod::Ping => Ok(json!("pong")),
            _ => self.service.handle(self.conn.peer(), method, args).await,
        }
    }

    async fn respond(&self, id: &str, outcome: TidemarkResult<Value>) -> TidemarkResult<()> {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let mut msg = RpcMessage::Response {
            id: id.to_string(),
            result,
            error,
            signer: self.keyring.local_signer().to_string(),
            signature: String::new(),
        };
        let signed = self.keyring.sign(&msg.signable_bytes()?);
        if let RpcMessage::Response { signature, .. } = &mut msg {
            *signature = signed;
        }
        self.send_message(&msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidemark_core::error::TidemarkError;
    use tidemark_core::keyring::LocalIdentity;
    use tidemark_core::mock::MockConnection;
    use tidemark_core::transport::PeerInfo;

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn handle(
            &self,
            _peer: &PeerInfo,
            method: RpcMethod,
            args: Value,
        ) -> TidemarkResult<Value> {
            match method {
                RpcMethod::PrefixHashes => Ok(args),
                other => Err(ProtocolError::NotCallable(other.name().to_string()).into()),
            }
        }
    }

    struct SlowService;

    #[async_trait]
    impl RpcService for SlowService {
        async fn handle(
            &self,
            _peer: &PeerInfo,
            _method: RpcMethod,
            args: Value,
        ) -> TidemarkResult<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(args)
        }
    }

    fn peer_info(identity: &LocalIdentity, device: &str) -> PeerInfo {
        PeerInfo {
            signer: identity.signer().to_string(),
            device: device.to_string(),
            public_key_hex: identity.public_key_hex(),
            same_device: false,
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            rpc_timeout: Duration::from_millis(500),
            max_message_size: 256,
            chunk_size: 64,
            ..EngineConfig::default()
        }
    }

    /// Two pumping channels over a mock connection, identities registered
    /// nowhere yet: verification must happen through the handshake.
    fn channel_pair(
        service_b: Arc<dyn RpcService>,
        config: EngineConfig,
    ) -> (Arc<RpcChannel>, Arc<RpcChannel>) {
        let alice = Keyring::new(LocalIdentity::generate("alice"));
        let bob = Keyring::new(LocalIdentity::generate("bob"));
        let (conn_a, conn_b) = MockConnection::pair(
            peer_info(bob.local(), "bob-dev"),
            peer_info(alice.local(), "alice-dev"),
        );

        let a = RpcChannel::new(conn_a, Arc::new(alice), Arc::new(NullService), config.clone())
            .unwrap();
        let b = RpcChannel::new(conn_b, Arc::new(bob), service_b, config).unwrap();
        a.start();
        b.start();
        (a, b)
    }

    async fn verified_pair(
        service_b: Arc<dyn RpcService>,
        config: EngineConfig,
    ) -> (Arc<RpcChannel>, Arc<RpcChannel>) {
        let (a, b) = channel_pair(service_b, config);
        a.verify_peer().await.unwrap();
        b.verify_peer().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_handshake_then_ping() {
        let (a, b) = channel_pair(Arc::new(NullService), small_config());
        assert!(!a.is_verified());

        a.verify_peer().await.unwrap();
        b.verify_peer().await.unwrap();
        assert!(a.is_verified());
        assert!(b.is_verified());

        a.ping().await.unwrap();
        b.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_proof_refuses_structured_nonce() {
        use tidemark_core::model::{ChangeEntry, ChangeRecord};

        let (a, _b) = channel_pair(Arc::new(NullService), small_config());
        // A forged record's canonical bytes offered as the "nonce": were
        // the peer to sign them, the signature would validate the record.
        let forged = ChangeRecord {
            id: "f-1".to_string(),
            group: "g1".to_string(),
            subject: "g1".to_string(),
            modified: 1000,
            changes: vec![ChangeEntry::set("", json!({ "owner": "bob" }))],
            subject_deleted: false,
            signer: "bob".to_string(),
            signature: String::new(),
        };
        let nonce = String::from_utf8(forged.signable_bytes().unwrap()).unwrap();

        let err = a
            .call(RpcMethod::ProveIdentity, json!({ "nonce": nonce }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[tokio::test]
    async fn test_identity_proof_signature_is_context_bound() {
        let (a, _b) = channel_pair(Arc::new(NullService), small_config());
        let nonce = hex::encode([7u8; 32]);
        let result = a
            .call(RpcMethod::ProveIdentity, json!({ "nonce": nonce }))
            .await
            .unwrap();
        let signature = result["signature"].as_str().unwrap();

        let peer_key = parse_verifying_key(&a.peer().public_key_hex).unwrap();
        // The proof verifies only under the context prefix; the raw nonce
        // bytes carry no valid signature.
        verify_with_key(&peer_key, "bob", &identity_proof_payload(&nonce), signature).unwrap();
        assert!(verify_with_key(&peer_key, "bob", nonce.as_bytes(), signature).is_err());
    }

    #[tokio::test]
    async fn test_calls_rejected_before_verification() {
        let (a, _b) = channel_pair(Arc::new(EchoService), small_config());
        let err = a.call(RpcMethod::Ping, json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not verified"));
    }

    #[tokio::test]
    async fn test_service_dispatch_roundtrip() {
        let (a, _b) = verified_pair(Arc::new(EchoService), small_config()).await;
        let args = json!({ "group": "g1", "prefix": "B" });
        let result = a.call(RpcMethod::PrefixHashes, args.clone()).await.unwrap();
        assert_eq!(result, args);
    }

    #[tokio::test]
    async fn test_unknown_function_rejected() {
        let (a, _b) = verified_pair(Arc::new(EchoService), small_config()).await;
        // BlockEntries is in the allow-list but unhandled by EchoService.
        let err = a.call(RpcMethod::BlockEntries, json!({})).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("not a remotely callable function"));
    }

    #[tokio::test]
    async fn test_raw_unknown_name_rejected() {
        let (a, b) = verified_pair(Arc::new(EchoService), small_config()).await;
        // Bypass the typed API to exercise the allow-list boundary itself.
        let mut msg = RpcMessage::Call {
            id: "raw-1".to_string(),
            fn_name: "install_backdoor".to_string(),
            args: json!({}),
            signer: "bob".to_string(),
            signature: String::new(),
        };
        let signed = b.keyring.sign(&msg.signable_bytes().unwrap());
        if let RpcMessage::Call { signature, .. } = &mut msg {
            *signature = signed;
        }
        let (tx, rx) = oneshot::channel();
        a.pending.insert("raw-1".to_string(), tx);
        b.send_message(&msg).await.unwrap();

        let outcome = rx.await.unwrap();
        let err = outcome.unwrap_err();
        assert!(err
            .to_string()
            .contains("install_backdoor is not a remotely callable function"));
    }

    #[tokio::test]
    async fn test_tampered_call_rejected() {
        let (a, b) = verified_pair(Arc::new(EchoService), small_config()).await;
        let mut msg = RpcMessage::Call {
            id: "t-1".to_string(),
            fn_name: "prefix_hashes".to_string(),
            args: json!({ "group": "g1" }),
            signer: "bob".to_string(),
            signature: String::new(),
        };
        let signed = b.keyring.sign(&msg.signable_bytes().unwrap());
        if let RpcMessage::Call {
            signature, args, ..
        } = &mut msg
        {
            *signature = signed;
            // Tamper after signing.
            *args = json!({ "group": "g2" });
        }
        let (tx, rx) = oneshot::channel();
        a.pending.insert("t-1".to_string(), tx);
        b.send_message(&msg).await.unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().to_lowercase().contains("verification failed"));
    }

    #[tokio::test]
    async fn test_oversized_call_chunks_transparently() {
        let (a, _b) = verified_pair(Arc::new(EchoService), small_config()).await;
        // Far beyond max_message_size in both directions.
        let big = json!({ "blob": "x".repeat(4096) });
        let result = a.call(RpcMethod::PrefixHashes, big.clone()).await.unwrap();
        assert_eq!(result, big);
    }

    #[tokio::test]
    async fn test_chunks_reassemble_out_of_order() {
        let (a, b) = verified_pair(Arc::new(EchoService), small_config()).await;
        let mut msg = RpcMessage::Call {
            id: "o-1".to_string(),
            fn_name: "prefix_hashes".to_string(),
            args: json!({ "blob": "y".repeat(600) }),
            signer: "bob".to_string(),
            signature: String::new(),
        };
        let signed = b.keyring.sign(&msg.signable_bytes().unwrap());
        if let RpcMessage::Call { signature, .. } = &mut msg {
            *signature = signed;
        }

        let bytes = msg.to_bytes().unwrap();
        let parts: Vec<&[u8]> = bytes.chunks(100).collect();
        let total = parts.len();
        assert!(total > 2);
        let (tx, rx) = oneshot::channel();
        a.pending.insert("o-1".to_string(), tx);
        // Deliver fragments in reverse.
        for (i, part) in parts.iter().enumerate().rev() {
            let chunk = RpcMessage::Chunk {
                id: "o-1".to_string(),
                i_chunk: i,
                total_chunks: total,
                chunk: BASE64.encode(part),
            };
            b.connection()
                .send(Bytes::from(chunk.to_bytes().unwrap()))
                .await
                .unwrap();
        }

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, msg_args(&msg));
    }

    fn msg_args(msg: &RpcMessage) -> Value {
        match msg {
            RpcMessage::Call { args, .. } => args.clone(),
            _ => Value::Null,
        }
    }

    #[tokio::test]
    async fn test_chunk_count_is_bounded() {
        let (a, _b) = channel_pair(Arc::new(NullService), small_config());
        let err = a
            .absorb_chunk("big".to_string(), 0, 1_000_000_000, "aa".to_string())
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(a.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_close_drops_partial_reassembly() {
        let (a, _b) = channel_pair(Arc::new(NullService), small_config());
        let absorbed = a
            .absorb_chunk("p-1".to_string(), 0, 2, BASE64.encode(b"half"))
            .unwrap();
        assert!(absorbed.is_none());
        assert_eq!(a.chunks.len(), 1);

        a.close().await;
        assert!(a.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let (a, _b) = verified_pair(Arc::new(SlowService), small_config()).await;
        let err = a.call(RpcMethod::FetchChange, json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Transport(TransportError::Timeout(_))
        ));
        assert!(a.pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_calls() {
        let (a, b) = verified_pair(Arc::new(SlowService), small_config()).await;
        let caller = a.clone();
        let call = tokio::spawn(async move {
            caller.call(RpcMethod::FetchChange, json!({})).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Transport(TransportError::ConnectionClosed)
        ));
        drop(b);
    }
}
