//! Wire messages for the RPC protocol
//!
//! Three envelope kinds travel over a connection's control stream:
//! [`RpcMessage::Call`], [`RpcMessage::Response`], and [`RpcMessage::Chunk`]
//! fragments carrying an oversized call or response in base64 pieces. Calls
//! and responses are signed over their canonical JSON form minus the
//! `signature` field; chunks are not signed, the reassembled message is.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tidemark_core::error::StorageError;
use tidemark_core::model::canonical_bytes;

/// One message on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcMessage {
    Call {
        id: String,
        fn_name: String,
        args: Value,
        signer: String,
        #[serde(default)]
        signature: String,
    },
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        signer: String,
        #[serde(default)]
        signature: String,
    },
    Chunk {
        /// Id of the message being carried.
        id: String,
        i_chunk: usize,
        total_chunks: usize,
        /// Base64 fragment of the serialized message.
        chunk: String,
    },
}

impl RpcMessage {
    /// The correlation id shared by a message and its fragments.
    pub fn id(&self) -> &str {
        match self {
            Self::Call { id, .. } | Self::Response { id, .. } | Self::Chunk { id, .. } => id,
        }
    }

    /// Canonical bytes covered by the envelope signature. Chunks carry no
    /// signature of their own.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        canonical_bytes(&value)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// The closed set of remotely callable functions.
///
/// Dispatch goes through this enum, never through arbitrary name lookup;
/// a name outside the set is rejected before any other processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    ProveIdentity,
    Ping,
    PrefixHashes,
    BlockEntries,
    FetchChange,
    FastSync,
}

impl RpcMethod {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "prove_identity" => Some(Self::ProveIdentity),
            "ping" => Some(Self::Ping),
            "prefix_hashes" => Some(Self::PrefixHashes),
            "block_entries" => Some(Self::BlockEntries),
            "fetch_change" => Some(Self::FetchChange),
            "fast_sync" => Some(Self::FastSync),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProveIdentity => "prove_identity",
            Self::Ping => "ping",
            Self::PrefixHashes => "prefix_hashes",
            Self::BlockEntries => "block_entries",
            Self::FetchChange => "fetch_change",
            Self::FastSync => "fast_sync",
        }
    }
}
