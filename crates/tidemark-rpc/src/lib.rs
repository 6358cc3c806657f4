//! # Tidemark RPC
//!
//! Authenticated call/response protocol between two sync peers, layered on
//! the transport seam from `tidemark-core`.
//!
//! ## Key Pieces
//!
//! - [`RpcMessage`]: signed call/response envelopes plus chunk fragments
//! - [`RpcMethod`]: the closed allow-list of remotely callable functions
//! - [`RpcChannel`]: correlation, chunking, timeouts, and the
//!   identity-proof handshake
//! - [`RpcService`]: the seam the sync layer plugs its handlers into

pub mod channel;
pub mod message;

pub use channel::{NullService, RpcChannel, RpcService};
pub use message::{RpcMessage, RpcMethod};
