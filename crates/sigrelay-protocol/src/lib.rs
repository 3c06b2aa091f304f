//! sigrelay Protocol - Wire protocol for signaling clients
//!
//! This crate provides the JSON message types exchanged over a relay
//! connection and the decoding of one inbound frame into a `Request`.

pub mod message;
pub mod parse;

pub use message::{error_code, Command, Request, ServerMessage};
pub use parse::{parse_request, parse_request_bytes, ProtocolError};
