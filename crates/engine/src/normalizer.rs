use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use diarist_store::{DiaryEvent, EventKind};
use serde::{Deserialize, Serialize};

use crate::error::NormalizeError;

/// A decoded inbound chat message before normalization.  `content` is the
/// platform's message body, already parsed from its JSON string form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub content: serde_json::Value,
}

/// Maps platform messages onto [`DiaryEvent`]s and stamps each with an
/// arrival sequence number.
#[derive(Debug)]
pub struct Normalizer {
    next_seq: AtomicU64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    /// Seeds the sequence from the wall clock so it keeps increasing across
    /// restarts.
    pub fn new() -> Self {
        let seed = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        Self::starting_at(seed)
    }

    pub fn starting_at(seq: u64) -> Self {
        Self {
            next_seq: AtomicU64::new(seq),
        }
    }

    pub fn normalize(&self, raw: &RawMessage) -> Result<DiaryEvent, NormalizeError> {
        let user_id = raw.user_id.trim();
        if user_id.is_empty() {
            return Err(NormalizeError::MalformedPayload(
                "message has no sender".to_string(),
            ));
        }

        let (kind, payload, caption) = match raw.message_type.as_str() {
            "text" => {
                let text = non_empty_field(&raw.content, "text")
                    .ok_or_else(|| malformed("text message has no text"))?;
                (EventKind::Text, text, None)
            }
            "audio" | "voice" | "voice_transcript" => {
                let transcript = non_empty_field(&raw.content, "transcript")
                    .ok_or_else(|| malformed("voice message has no transcript"))?;
                (EventKind::VoiceTranscript, transcript, None)
            }
            "image" => {
                let image_key = non_empty_field(&raw.content, "image_key")
                    .ok_or_else(|| malformed("image message has no image reference"))?;
                let caption = non_empty_field(&raw.content, "file_name")
                    .or_else(|| non_empty_field(&raw.content, "caption"));
                (EventKind::ImageRef, image_key, caption)
            }
            other => return Err(NormalizeError::UnsupportedKind(other.to_string())),
        };

        Ok(DiaryEvent {
            user_id: user_id.to_string(),
            timestamp: raw.timestamp,
            kind,
            payload,
            caption,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        })
    }
}

fn malformed(reason: &str) -> NormalizeError {
    NormalizeError::MalformedPayload(reason.to_string())
}

fn non_empty_field(content: &serde_json::Value, field: &str) -> Option<String> {
    content
        .get(field)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(message_type: &str, content: serde_json::Value) -> RawMessage {
        RawMessage {
            user_id: "ou_a".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 14, 1, 0, 0).unwrap(),
            message_type: message_type.to_string(),
            content,
        }
    }

    // ── Supported kinds ────────────────────────────────────────────────────

    #[test]
    fn text_message_is_trimmed() {
        let normalizer = Normalizer::starting_at(10);
        let event = normalizer
            .normalize(&raw("text", json!({"text": "  今天很开心 "})))
            .unwrap();
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.payload, "今天很开心");
        assert_eq!(event.seq, 10);
    }

    #[test]
    fn voice_requires_transcript() {
        let normalizer = Normalizer::starting_at(0);
        let event = normalizer
            .normalize(&raw("audio", json!({"file_key": "f1", "transcript": "晚上吃了火锅"})))
            .unwrap();
        assert_eq!(event.kind, EventKind::VoiceTranscript);
        assert_eq!(event.payload, "晚上吃了火锅");

        let err = normalizer
            .normalize(&raw("audio", json!({"file_key": "f1"})))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedPayload(_)));
    }

    #[test]
    fn image_keeps_reference_and_caption() {
        let normalizer = Normalizer::starting_at(0);
        let event = normalizer
            .normalize(&raw(
                "image",
                json!({"image_key": "img_v2_abc", "file_name": "sunset.jpg"}),
            ))
            .unwrap();
        assert_eq!(event.kind, EventKind::ImageRef);
        assert_eq!(event.payload, "img_v2_abc");
        assert_eq!(event.caption.as_deref(), Some("sunset.jpg"));
    }

    // ── Rejections ─────────────────────────────────────────────────────────

    #[test]
    fn unknown_kind_is_unsupported() {
        let normalizer = Normalizer::starting_at(0);
        let err = normalizer
            .normalize(&raw("sticker", json!({"file_key": "x"})))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedKind(kind) if kind == "sticker"));
    }

    #[test]
    fn blank_text_or_sender_is_malformed() {
        let normalizer = Normalizer::starting_at(0);
        assert!(matches!(
            normalizer.normalize(&raw("text", json!({"text": "   "}))),
            Err(NormalizeError::MalformedPayload(_))
        ));

        let mut anonymous = raw("text", json!({"text": "hi"}));
        anonymous.user_id = " ".to_string();
        assert!(matches!(
            normalizer.normalize(&anonymous),
            Err(NormalizeError::MalformedPayload(_))
        ));
    }

    // ── Sequencing ─────────────────────────────────────────────────────────

    #[test]
    fn renormalizing_differs_only_in_seq() {
        let normalizer = Normalizer::new();
        let message = raw("text", json!({"text": "same"}));
        let first = normalizer.normalize(&message).unwrap();
        let second = normalizer.normalize(&message).unwrap();
        assert!(second.seq > first.seq);
        assert_eq!(DiaryEvent { seq: first.seq, ..second }, first);
    }
}
