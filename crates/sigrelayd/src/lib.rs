//! sigrelay Daemon - Channel registry and WebSocket relay
//!
//! This crate provides the core infrastructure for the relay daemon:
//! - `registry` - Channel registry actor tracking membership
//! - `server` - WebSocket server, per-connection handlers and routing
//! - `peer` - Handle on one connected client's outbound queue
//! - `config` - Layered daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      sigrelayd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   RelayServer   │────▶│     RegistryActor           │   │
//! │  │  (WebSocket)    │     │  (channel state owner)      │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ recipients        │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│◀────│   ConnectionHandle queues   │   │
//! │  │  (per client)   │     │   (fan-out of `send`)       │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod peer;
pub mod registry;
pub mod server;
