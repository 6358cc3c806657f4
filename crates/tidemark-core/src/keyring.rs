//! Signing identities and the known-key registry
//!
//! The [`Keyring`] owns the local signing identity and a registry of known
//! peer verifying keys. All signature and hashing primitives used by the
//! engine go through it, so tests can swap identities freely and nothing
//! reaches for ambient global state.

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::VerificationError;

/// A 32-byte blake3 digest.
pub type Digest = [u8; 32];

/// The local device's signing identity.
#[derive(Debug)]
pub struct LocalIdentity {
    signer: String,
    key: SigningKey,
}

impl LocalIdentity {
    /// Generate a fresh identity with the given signer id.
    pub fn generate(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild an identity from a 32-byte secret.
    pub fn from_secret(signer: impl Into<String>, secret: &[u8; 32]) -> Self {
        Self {
            signer: signer.into(),
            key: SigningKey::from_bytes(secret),
        }
    }

    /// This identity's signer id.
    pub fn signer(&self) -> &str {
        &self.signer
    }

    /// The matching verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex form of the verifying key, as declared to peers.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    /// Sign a payload, returning the hex-encoded signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.key.sign(payload).to_bytes())
    }
}

/// Registry of known signer keys plus the local identity.
#[derive(Debug)]
pub struct Keyring {
    local: LocalIdentity,
    known: DashMap<String, VerifyingKey>,
}

impl Keyring {
    /// Create a keyring around a local identity. The local verifying key is
    /// registered so locally signed records verify like any other.
    pub fn new(local: LocalIdentity) -> Self {
        let known = DashMap::new();
        known.insert(local.signer.clone(), local.verifying_key());
        Self { local, known }
    }

    /// The local identity.
    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// The local signer id.
    pub fn local_signer(&self) -> &str {
        self.local.signer()
    }

    /// Register a peer's verifying key.
    pub fn register(&self, signer: impl Into<String>, key: VerifyingKey) {
        self.known.insert(signer.into(), key);
    }

    /// Register a peer's verifying key from its hex form.
    pub fn register_hex(
        &self,
        signer: impl Into<String>,
        key_hex: &str,
    ) -> Result<(), VerificationError> {
        let key = parse_verifying_key(key_hex)?;
        self.known.insert(signer.into(), key);
        Ok(())
    }

    /// Whether a signer's key is known.
    pub fn knows(&self, signer: &str) -> bool {
        self.known.contains_key(signer)
    }

    /// Sign a payload with the local identity (hex signature).
    pub fn sign(&self, payload: &[u8]) -> String {
        self.local.sign(payload)
    }

    /// Verify a hex signature over a payload against a known signer's key.
    ///
    /// An unknown signer is a distinct, retriable failure: the key may
    /// simply not have been exchanged yet.
    pub fn verify(
        &self,
        signer: &str,
        payload: &[u8],
        signature_hex: &str,
    ) -> Result<(), VerificationError> {
        let key = self
            .known
            .get(signer)
            .ok_or_else(|| VerificationError::UnknownSigner(signer.to_string()))?;
        verify_with_key(&key, signer, payload, signature_hex)
    }

    /// Compute the blake3 digest of a payload.
    pub fn digest(&self, payload: &[u8]) -> Digest {
        *blake3::hash(payload).as_bytes()
    }
}

/// Parse a hex-encoded ed25519 verifying key.
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey, VerificationError> {
    let bytes = hex::decode(key_hex)
        .map_err(|e| VerificationError::InvalidKey(format!("bad hex: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VerificationError::InvalidKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| VerificationError::InvalidKey(e.to_string()))
}

/// Verify a hex signature against an explicit key.
pub fn verify_with_key(
    key: &VerifyingKey,
    signer: &str,
    payload: &[u8],
    signature_hex: &str,
) -> Result<(), VerificationError> {
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|_| VerificationError::BadSignature(signer.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| VerificationError::BadSignature(signer.to_string()))?;
    key.verify(payload, &signature)
        .map_err(|_| VerificationError::BadSignature(signer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let ring = Keyring::new(LocalIdentity::generate("alice"));
        let sig = ring.sign(b"hello");
        ring.verify("alice", b"hello", &sig).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let ring = Keyring::new(LocalIdentity::generate("alice"));
        let sig = ring.sign(b"hello");
        let err = ring.verify("alice", b"goodbye", &sig).unwrap_err();
        assert!(matches!(err, VerificationError::BadSignature(_)));
    }

    #[test]
    fn test_unknown_signer_is_distinct() {
        let ring = Keyring::new(LocalIdentity::generate("alice"));
        let sig = ring.sign(b"hello");
        let err = ring.verify("bob", b"hello", &sig).unwrap_err();
        assert!(matches!(err, VerificationError::UnknownSigner(_)));
    }

    #[test]
    fn test_register_peer_key() {
        let alice = Keyring::new(LocalIdentity::generate("alice"));
        let bob = LocalIdentity::generate("bob");

        let sig = bob.sign(b"from bob");
        assert!(alice.verify("bob", b"from bob", &sig).is_err());

        alice.register_hex("bob", &bob.public_key_hex()).unwrap();
        alice.verify("bob", b"from bob", &sig).unwrap();
    }

    #[test]
    fn test_parse_verifying_key_rejects_garbage() {
        assert!(parse_verifying_key("not hex").is_err());
        assert!(parse_verifying_key("abcd").is_err());
    }

    #[test]
    fn test_digest_is_stable() {
        let ring = Keyring::new(LocalIdentity::generate("alice"));
        assert_eq!(ring.digest(b"x"), ring.digest(b"x"));
        assert_ne!(ring.digest(b"x"), ring.digest(b"y"));
    }
}
