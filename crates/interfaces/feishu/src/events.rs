//! Decoding of Feishu v2 event callback bodies.
use chrono::{DateTime, TimeZone, Utc};
use diarist_engine::RawMessage;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const MESSAGE_RECEIVED: &str = "im.message.receive_v1";
pub const FILE_DELETED: &str = "drive.file.deleted_completely_v1";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid event body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encrypted event bodies must be decrypted before decoding")]
    Encrypted,
    #[error("event is missing `{0}`")]
    Missing(&'static str),
}

/// An inbound chat message addressed to the bot.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub event_id: String,
    pub message_id: String,
    pub open_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub content: Value,
}

impl InboundMessage {
    /// Text body with `@_user_N` mention placeholders removed.
    pub fn text(&self) -> Option<String> {
        if self.message_type != "text" {
            return None;
        }
        let text = self.content.get("text")?.as_str()?;
        let cleaned = text
            .split_whitespace()
            .filter(|word| !word.starts_with("@_user_"))
            .collect::<Vec<_>>()
            .join(" ");
        Some(cleaned)
    }

    pub fn to_raw(&self) -> RawMessage {
        let mut content = self.content.clone();
        if let Some(text) = self.text() {
            content["text"] = Value::String(text);
        }
        RawMessage {
            user_id: self.open_id.clone(),
            timestamp: self.timestamp,
            message_type: self.message_type.clone(),
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeishuEvent {
    /// URL verification handshake; echo the challenge back.
    Challenge(String),
    Message(InboundMessage),
    DocumentDeleted { event_id: String, file_token: String },
    Ignored { event_type: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    challenge: Option<String>,
    encrypt: Option<String>,
    header: Option<Header>,
    #[serde(default)]
    event: Value,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    event_type: String,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    sender: Sender,
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Sender {
    sender_id: SenderId,
}

#[derive(Debug, Deserialize)]
struct SenderId {
    #[serde(default)]
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: String,
    #[serde(default)]
    create_time: String,
    message_type: String,
    #[serde(default)]
    content: String,
}

pub fn decode_event(body: &str) -> Result<FeishuEvent, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.encrypt.is_some() {
        return Err(EnvelopeError::Encrypted);
    }
    if let Some(challenge) = envelope.challenge {
        return Ok(FeishuEvent::Challenge(challenge));
    }
    let header = envelope.header.ok_or(EnvelopeError::Missing("header"))?;

    match header.event_type.as_str() {
        MESSAGE_RECEIVED => {
            let event: MessageEvent = serde_json::from_value(envelope.event)?;
            let message = event.message;
            // Message content arrives as a JSON string; non-JSON content is kept as text.
            let content: Value = serde_json::from_str(&message.content)
                .unwrap_or_else(|_| serde_json::json!({ "text": message.content }));
            Ok(FeishuEvent::Message(InboundMessage {
                event_id: header.event_id,
                message_id: message.message_id,
                open_id: event.sender.sender_id.open_id,
                timestamp: parse_millis(&message.create_time).unwrap_or_else(Utc::now),
                message_type: message.message_type,
                content,
            }))
        }
        FILE_DELETED => {
            let file_token = envelope
                .event
                .get("file_token")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .ok_or(EnvelopeError::Missing("event.file_token"))?;
            Ok(FeishuEvent::DocumentDeleted {
                event_id: header.event_id,
                file_token: file_token.to_string(),
            })
        }
        other => Ok(FeishuEvent::Ignored {
            event_type: other.to_string(),
        }),
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_body(message_type: &str, content: Value) -> String {
        json!({
            "schema": "2.0",
            "header": {
                "event_id": "evt_1",
                "event_type": MESSAGE_RECEIVED,
                "create_time": "1741914000000",
            },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_a" }, "sender_type": "user" },
                "message": {
                    "message_id": "om_1",
                    "create_time": "1741914000000",
                    "chat_type": "p2p",
                    "message_type": message_type,
                    "content": content.to_string(),
                }
            }
        })
        .to_string()
    }

    #[test]
    fn decodes_challenge() {
        let event = decode_event(r#"{"challenge":"abc","token":"t","type":"url_verification"}"#).unwrap();
        assert_eq!(event, FeishuEvent::Challenge("abc".into()));
    }

    #[test]
    fn decodes_text_message() {
        let body = message_body("text", json!({ "text": "@_user_1 今天很开心" }));
        let FeishuEvent::Message(message) = decode_event(&body).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(message.event_id, "evt_1");
        assert_eq!(message.open_id, "ou_a");
        assert_eq!(message.timestamp.timestamp_millis(), 1_741_914_000_000);
        assert_eq!(message.text().as_deref(), Some("今天很开心"));

        let raw = message.to_raw();
        assert_eq!(raw.user_id, "ou_a");
        assert_eq!(raw.content["text"], "今天很开心");
    }

    #[test]
    fn decodes_image_message() {
        let body = message_body("image", json!({ "image_key": "img_v2_1" }));
        let FeishuEvent::Message(message) = decode_event(&body).unwrap() else {
            panic!("expected a message");
        };
        assert!(message.text().is_none());
        assert_eq!(message.to_raw().content["image_key"], "img_v2_1");
    }

    #[test]
    fn decodes_file_deletion() {
        let body = json!({
            "schema": "2.0",
            "header": { "event_id": "evt_9", "event_type": FILE_DELETED },
            "event": { "file_token": "doxcnAbc", "file_type": "docx" }
        })
        .to_string();
        assert_eq!(
            decode_event(&body).unwrap(),
            FeishuEvent::DocumentDeleted {
                event_id: "evt_9".into(),
                file_token: "doxcnAbc".into()
            }
        );
    }

    #[test]
    fn other_events_are_ignored_and_bad_bodies_fail() {
        let body = json!({
            "header": { "event_id": "evt_2", "event_type": "im.chat.member.bot.added_v1" },
            "event": {}
        })
        .to_string();
        assert!(matches!(decode_event(&body).unwrap(), FeishuEvent::Ignored { .. }));

        assert!(matches!(
            decode_event(r#"{"encrypt":"xyz"}"#),
            Err(EnvelopeError::Encrypted)
        ));
        assert!(matches!(decode_event("not json"), Err(EnvelopeError::Json(_))));
        assert!(matches!(
            decode_event(r#"{"event":{}}"#),
            Err(EnvelopeError::Missing("header"))
        ));
    }
}
