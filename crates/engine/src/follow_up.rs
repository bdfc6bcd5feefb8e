//! Conversational replies to diary entries.
//!
//! One model call per ingested entry, independent of the summarizer: no
//! retries, a short timeout, and any failure falls back to the plain
//! acknowledgement.
use std::sync::Arc;
use std::time::Duration;

use diarist_llm::ChatModel;
use diarist_store::{DiaryEvent, EventKind};
use tracing::debug;

use crate::tz::TimezoneResolver;

/// Entries of the current session shown to the model.
pub const FOLLOW_UP_CONTEXT: usize = 10;

const MAX_REPLY_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a warm diary companion chatting with someone about their day. \
Reply in the same language they write in, as plain text without emoji or markdown. \
If they ask a simple question such as the date, answer it directly. \
If they ask for news or live information, say you cannot look that up. \
When they share something from their day, ask one short question about a detail. \
When they sound finished, suggest sending /diary to write today's diary. \
Keep the reply under 30 words.";

pub struct FollowUpWriter {
    model: Arc<dyn ChatModel>,
    call_timeout: Duration,
    tz: TimezoneResolver,
}

impl FollowUpWriter {
    pub fn new(model: Arc<dyn ChatModel>, call_timeout: Duration, tz: TimezoneResolver) -> Self {
        Self {
            model,
            call_timeout,
            tz,
        }
    }

    /// A follow-up for the newest of `recent`, or `None` when the model
    /// fails, times out, or says nothing.
    pub async fn follow_up(&self, user_id: &str, recent: &[DiaryEvent]) -> Option<String> {
        if recent.is_empty() {
            return None;
        }
        let prompt = self.render_prompt(user_id, recent);
        let reply = match tokio::time::timeout(
            self.call_timeout,
            self.model.complete(SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                debug!(user_id = %user_id, error = %err, "follow-up skipped");
                return None;
            }
            Err(_) => {
                debug!(user_id = %user_id, "follow-up timed out");
                return None;
            }
        };

        let reply = reply.trim();
        if reply.is_empty() {
            return None;
        }
        Some(reply.chars().take(MAX_REPLY_CHARS).collect())
    }

    fn render_prompt(&self, user_id: &str, recent: &[DiaryEvent]) -> String {
        let tz = self.tz.tz_for(user_id);
        let mut lines = vec!["Today so far:".to_string()];
        for event in recent {
            let clock = event.timestamp.with_timezone(&tz).format("%H:%M");
            let body = match event.kind {
                EventKind::Text | EventKind::VoiceTranscript => event.payload.as_str(),
                EventKind::ImageRef => event.caption.as_deref().unwrap_or("(a photo)"),
            };
            lines.push(format!("[{clock}] {body}"));
        }
        lines.push("Reply to their latest message.".to_string());
        lines.join("\n")
    }
}
