//! Control channel commands (client → server).
//!
//! Clients send one JSON object per text message, discriminated by `type`:
//!
//! | type            | fields                              |
//! |-----------------|-------------------------------------|
//! | `request_frame` | `frame`                             |
//! | `stream`        | `start?`, `end?`, `stride?`, `fps?` |
//! | `stop`          | none                                |
//!
//! Parsing happens once, here. Anything that does not parse into a
//! [`ClientCommand`] becomes [`ParsedCommand::Ignored`]; the server never
//! answers it.

use serde::{Deserialize, Serialize};

/// A well-formed control command.
///
/// Numeric fields are signed so that negative values survive parsing and are
/// rejected by validation with a precise reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Send the single frame at `frame`.
    RequestFrame { frame: i64 },

    /// Begin (or replace) paced playback over `[start, end)` every `stride`
    /// frames at `fps` frames per second.
    Stream {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stride: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
    },

    /// Halt playback.
    Stop,
}

impl ClientCommand {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RequestFrame { .. } => "request_frame",
            Self::Stream { .. } => "stream",
            Self::Stop => "stop",
        }
    }

    /// Serialize to the JSON text a client would send.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outcome of parsing one inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
    Command(ClientCommand),
    /// Unparseable text, unknown `type`, or a missing required field.
    Ignored { reason: String },
}

/// Parse one inbound text message.
pub fn parse_command(text: &str) -> ParsedCommand {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => ParsedCommand::Command(command),
        Err(e) => ParsedCommand::Ignored {
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str) -> ClientCommand {
        match parse_command(text) {
            ParsedCommand::Command(c) => c,
            ParsedCommand::Ignored { reason } => panic!("{text} ignored: {reason}"),
        }
    }

    fn is_ignored(text: &str) -> bool {
        matches!(parse_command(text), ParsedCommand::Ignored { .. })
    }

    #[test]
    fn test_request_frame() {
        assert_eq!(
            parsed(r#"{"type":"request_frame","frame":12}"#),
            ClientCommand::RequestFrame { frame: 12 }
        );
    }

    #[test]
    fn test_stream_all_fields() {
        assert_eq!(
            parsed(r#"{"type":"stream","start":10,"end":20,"stride":2,"fps":10}"#),
            ClientCommand::Stream {
                start: Some(10),
                end: Some(20),
                stride: Some(2),
                fps: Some(10.0),
            }
        );
    }

    #[test]
    fn test_stream_defaults_are_none() {
        assert_eq!(
            parsed(r#"{"type":"stream"}"#),
            ClientCommand::Stream {
                start: None,
                end: None,
                stride: None,
                fps: None,
            }
        );
        assert_eq!(
            parsed(r#"{"type":"stream","end":null,"fps":12.5}"#),
            ClientCommand::Stream {
                start: None,
                end: None,
                stride: None,
                fps: Some(12.5),
            }
        );
    }

    #[test]
    fn test_stop_ignores_extra_fields() {
        assert_eq!(parsed(r#"{"type":"stop"}"#), ClientCommand::Stop);
        assert_eq!(parsed(r#"{"type":"stop","now":true}"#), ClientCommand::Stop);
    }

    #[test]
    fn test_negative_values_survive_parsing() {
        assert_eq!(
            parsed(r#"{"type":"stream","stride":-1,"fps":0}"#),
            ClientCommand::Stream {
                start: None,
                end: None,
                stride: Some(-1),
                fps: Some(0.0),
            }
        );
    }

    #[test]
    fn test_malformed_input_ignored() {
        assert!(is_ignored(""));
        assert!(is_ignored("not json"));
        assert!(is_ignored("[1,2,3]"));
        assert!(is_ignored(r#"{"frame":3}"#));
        assert!(is_ignored(r#"{"type":"rewind"}"#));
        assert!(is_ignored(r#"{"type":"request_frame"}"#));
        assert!(is_ignored(r#"{"type":"request_frame","frame":"3"}"#));
        assert!(is_ignored(r#"{"type":"stream","fps":"fast"}"#));
    }

    #[test]
    fn test_to_json_parses_back() {
        let commands = [
            ClientCommand::RequestFrame { frame: 3 },
            ClientCommand::Stream {
                start: Some(1),
                end: None,
                stride: Some(3),
                fps: None,
            },
            ClientCommand::Stop,
        ];
        for command in commands {
            assert_eq!(parsed(&command.to_json()), command);
        }
        assert_eq!(ClientCommand::Stop.to_json(), r#"{"type":"stop"}"#);
    }
}
