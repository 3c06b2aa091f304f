//! Decoding of inbound frames.
//!
//! A frame is one JSON object. Anything that fails to decode, or that
//! names a command outside the fixed set, is a `ProtocolError` and ends
//! the offending connection.

use thiserror::Error;

use crate::message::{Command, Request};

/// Errors raised while decoding or validating a client request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON request object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `cmd` field names no known command.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// A channel-scoped command arrived without a channel code.
    #[error("missing channel for {0}")]
    MissingChannel(String),
}

impl ProtocolError {
    /// Creates a malformed-message error from any error type.
    pub fn malformed<E: std::fmt::Display>(err: E) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Decodes a text frame.
pub fn parse_request(text: &str) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_str(text).map_err(ProtocolError::malformed)?;
    validate(request)
}

/// Decodes a binary frame holding UTF-8 JSON.
pub fn parse_request_bytes(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_slice(bytes).map_err(ProtocolError::malformed)?;
    validate(request)
}

fn validate(request: Request) -> Result<Request, ProtocolError> {
    match request.command() {
        Command::Unknown(cmd) => Err(ProtocolError::UnknownCommand(cmd)),
        cmd @ (Command::ConnectChannel | Command::Send) if request.channel.is_empty() => {
            Err(ProtocolError::MissingChannel(cmd.as_str().to_string()))
        }
        _ => Ok(request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::ChannelCode;

    #[test]
    fn test_parse_minimal_request() {
        let req = parse_request(r#"{"cmd":"requestChannelId"}"#).unwrap();
        assert_eq!(req.command(), Command::RequestChannelId);
        assert!(req.channel.is_empty());
        assert!(req.data.is_empty());
    }

    #[test]
    fn test_parse_send_request() {
        let req = parse_request(r#"{"cmd":"send","channel":"WXYZ","data":"hello"}"#).unwrap();
        assert_eq!(req, Request::send("WXYZ", "hello"));
    }

    #[test]
    fn test_parse_empty_object_is_empty_command() {
        let req = parse_request("{}").unwrap();
        assert_eq!(req.command(), Command::Empty);
    }

    #[test]
    fn test_extra_fields_ignored() {
        let req = parse_request(r#"{"cmd":"connectChannel","channel":"ABCD","extra":1}"#).unwrap();
        assert_eq!(req.channel, ChannelCode::new("ABCD"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let err = parse_request(r#"{"cmd":"bogus"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("bogus".to_string()));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            parse_request("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(parse_request(""), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse_request(r#"{"cmd":"send","channel":"AB","data":5}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_channel_required_for_scoped_commands() {
        let err = parse_request(r#"{"cmd":"connectChannel"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingChannel("connectChannel".to_string()));

        let err = parse_request(r#"{"cmd":"send","data":"x"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingChannel("send".to_string()));
    }

    #[test]
    fn test_parse_binary_frame() {
        let req = parse_request_bytes(br#"{"cmd":"send","channel":"ABCD","data":"d"}"#).unwrap();
        assert_eq!(req.command(), Command::Send);

        assert!(parse_request_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtocolError::UnknownCommand("bogus".to_string()).to_string(),
            "unknown command: \"bogus\""
        );
        assert_eq!(
            ProtocolError::MissingChannel("send".to_string()).to_string(),
            "missing channel for send"
        );
    }
}
