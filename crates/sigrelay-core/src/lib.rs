//! sigrelay Core - Shared types for the signaling relay
//!
//! This crate provides the domain types shared between the wire
//! protocol (sigrelay-protocol) and the daemon (sigrelayd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod generator;
pub mod id;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use generator::{
    ChannelIdGenerator, CHANNEL_CODE_ALPHABET, CHANNEL_CODE_LENGTH, MAX_GENERATE_ATTEMPTS,
};
pub use id::{ChannelCode, ConnectionId};
