//! # Tidemark Core
//!
//! Core types, errors, and trait seams for the Tidemark sync engine.
//!
//! Tidemark keeps replicas of shared, access-controlled objects eventually
//! consistent over intermittent point-to-point links. This crate holds the
//! pieces every other layer builds on:
//!
//! ## Key Types
//!
//! - [`VersionedObject`]: a replicated object with arbitrary JSON payload
//! - [`ChangeRecord`]: a signed, immutable description of one mutation
//! - [`AccessLevel`]: per-group permission tiers (read/write/admin)
//! - [`EngineConfig`]: timeouts, sizes, and backoff tunables
//!
//! ## Trait Seams
//!
//! - [`ObjectStore`] / [`ChangeStore`]: the persistence collaborator
//! - [`Connection`] / [`ByteChannel`]: the transport collaborator
//! - [`Keyring`]: signing, verification, and hashing
//!
//! In-memory implementations ([`MemoryStore`], [`MockConnection`]) back the
//! test suites of the higher layers.

pub mod config;
pub mod error;
pub mod keyring;
pub mod mock;
pub mod model;
pub mod store;
pub mod transport;

// Re-export main types
pub use config::*;
pub use error::*;
pub use keyring::*;
pub use mock::*;
pub use model::*;
pub use store::*;
pub use transport::*;
