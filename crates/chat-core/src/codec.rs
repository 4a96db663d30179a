use serde::Deserialize;

use crate::{
    error::{ChatError, ChatErrorCode},
    types::ChatEvent,
};

/// Decoded socket text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Regular chat event.
    Event(ChatEvent),
    /// Error envelope sent by the server.
    Error(ChatError),
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ServerError>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default, rename = "StatusCode")]
    status_code: Option<u16>,
}

/// Decode one text frame into an event or a server error.
pub fn decode_frame(text: &str) -> Result<DecodedFrame, ChatError> {
    if text.trim().is_empty() {
        return Err(ChatError::network(
            ChatErrorCode::NoErrorBody,
            "received an empty socket frame",
        ));
    }

    if let Ok(ErrorEnvelope { error: Some(error) }) = serde_json::from_str::<ErrorEnvelope>(text) {
        let mut decoded = ChatError::network(ChatErrorCode::from_code(error.code), error.message);
        decoded.status_code = error.status_code;
        return Ok(DecodedFrame::Error(decoded));
    }

    serde_json::from_str::<ChatEvent>(text)
        .map(DecodedFrame::Event)
        .map_err(|err| {
            ChatError::network(
                ChatErrorCode::UnableToParseSocketEvent,
                format!("cannot decode socket event: {err}"),
            )
        })
}

/// Encode an event for sending over the socket.
pub fn encode_event(event: &ChatEvent) -> Result<String, ChatError> {
    serde_json::to_string(event).map_err(|err| {
        ChatError::network(
            ChatErrorCode::ParserError,
            format!("cannot encode socket event: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorKind;

    #[test]
    fn decodes_server_error_envelope() {
        let frame = r#"{"error":{"code":40,"message":"token expired","StatusCode":401}}"#;
        let decoded = decode_frame(frame).expect("frame should decode");
        match decoded {
            DecodedFrame::Error(err) => {
                assert_eq!(err.code, ChatErrorCode::TokenExpired);
                assert_eq!(err.kind, ChatErrorKind::Network);
                assert_eq!(err.status_code, Some(401));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_connection_acknowledgement() {
        let frame = r#"{"type":"connection.ok","connection_id":"c-1","me":{"id":"alice"},"created_at":5}"#;
        match decode_frame(frame).expect("frame should decode") {
            DecodedFrame::Event(ChatEvent::Connected(event)) => {
                assert_eq!(event.connection_id, "c-1");
                assert_eq!(event.me.id, "alice");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_map_to_parse_codes() {
        let err = decode_frame("{not json").expect_err("garbage must fail");
        assert_eq!(err.code, ChatErrorCode::UnableToParseSocketEvent);

        let err = decode_frame("  ").expect_err("empty must fail");
        assert_eq!(err.code, ChatErrorCode::NoErrorBody);
    }

    #[test]
    fn encoded_events_keep_their_type_tag() {
        let event = ChatEvent::ChannelVisible {
            cid: "messaging:general".into(),
            created_at: 3,
        };
        let text = encode_event(&event).expect("event should encode");
        assert!(text.contains(r#""type":"channel.visible""#));
    }
}
