use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use diarist_llm::{ChatModel, LlmError, extract_json_output};
use diarist_store::{DiaryEvent, EventKind};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SummarizeError;
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::tz::TimezoneResolver;

const SYSTEM_PROMPT: &str = "You turn a person's chat messages from one day into a short personal diary entry. \
Write in the same language the person used, in the first person, warm and concise. \
Reply with a single JSON object and nothing else: \
{\"title\": string, \"overview\": string, \"details\": [string], \"mood\": string, \"tomorrow\": string}. \
`details` lists what happened in order; `mood` reflects how the day felt; `tomorrow` is a short \
forward-looking note. Use an empty string or list for anything the messages do not support.";

/// Diary prose produced from one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredDiaryText {
    pub title: String,
    pub overview: String,
    pub details: Vec<String>,
    pub mood: String,
    pub tomorrow: String,
}

impl StructuredDiaryText {
    /// Markdown document body; empty sections are omitted.
    pub fn render_markdown(&self) -> String {
        let mut out = format!("# {}\n", self.title);
        let mut section = |heading: &str, body: String| {
            if !body.trim().is_empty() {
                out.push_str(&format!("\n## {heading}\n{}\n", body.trim_end()));
            }
        };
        section("Overview", self.overview.clone());
        section(
            "Details",
            self.details
                .iter()
                .map(|item| format!("- {item}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        section("Mood & Reflections", self.mood.clone());
        section("Looking Ahead", self.tomorrow.clone());
        out
    }
}

#[derive(Debug, Default, Deserialize)]
struct DiaryDraft {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    details: serde_json::Value,
    #[serde(default)]
    mood: Option<String>,
    #[serde(default)]
    tomorrow: Option<String>,
}

/// Calls the language model once per aggregation, retrying only transient
/// failures within the policy's attempt cap.
pub struct Summarizer {
    model: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    call_timeout: Duration,
    tz: TimezoneResolver,
    title_prefix: String,
}

impl Summarizer {
    pub fn new(
        model: Arc<dyn ChatModel>,
        policy: RetryPolicy,
        call_timeout: Duration,
        tz: TimezoneResolver,
        title_prefix: impl Into<String>,
    ) -> Self {
        Self {
            model,
            policy,
            call_timeout,
            tz,
            title_prefix: title_prefix.into(),
        }
    }

    pub async fn summarize(
        &self,
        user_id: &str,
        date: NaiveDate,
        events: &[DiaryEvent],
    ) -> Result<StructuredDiaryText, SummarizeError> {
        if events.is_empty() {
            return Err(SummarizeError::Rejected {
                reason: "no events to summarize".to_string(),
            });
        }

        let prompt = self.render_prompt(user_id, date, events);
        let default_title = format!("{} - {}", self.title_prefix, date.format("%Y-%m-%d"));
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = match tokio::time::timeout(
                self.call_timeout,
                self.model.complete(SYSTEM_PROMPT, &prompt),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Transient(format!(
                    "model call exceeded {:?}",
                    self.call_timeout
                ))),
            };

            let err = match result {
                Ok(reply) => {
                    debug!(user_id = %user_id, date = %date, attempts, "summary received");
                    return parse_reply(&reply, &default_title).ok_or_else(|| {
                        SummarizeError::Rejected {
                            reason: "model returned an empty reply".to_string(),
                        }
                    });
                }
                Err(err) => err,
            };

            let class = if err.is_transient() {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            };
            match self.policy.decide(attempts, class) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        user_id = %user_id,
                        date = %date,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "summarizer call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(user_id = %user_id, date = %date, attempts, error = %err, "summarizer gave up");
                    let reason = err.to_string();
                    return Err(match class {
                        FailureClass::Transient => SummarizeError::Exhausted { attempts, reason },
                        FailureClass::Permanent => SummarizeError::Rejected { reason },
                    });
                }
            }
        }
    }

    /// One line per event, in the order given, timestamps in the user's zone.
    pub fn render_prompt(&self, user_id: &str, date: NaiveDate, events: &[DiaryEvent]) -> String {
        let tz = self.tz.tz_for(user_id);
        let mut lines = vec![format!(
            "Messages from {} ({} entries):",
            date.format("%Y-%m-%d"),
            events.len()
        )];
        for event in events {
            let clock = event.timestamp.with_timezone(&tz).format("%H:%M");
            let body = match event.kind {
                EventKind::Text | EventKind::VoiceTranscript => event.payload.clone(),
                EventKind::ImageRef => event
                    .caption
                    .clone()
                    .unwrap_or_else(|| format!("photo {}", event.payload)),
            };
            lines.push(format!("[{clock}] {}: {body}", event.kind.label()));
        }
        lines.join("\n")
    }
}

/// Turn a model reply into diary text.  Prose without JSON becomes the
/// details section; a blank reply yields `None`.
fn parse_reply(reply: &str, default_title: &str) -> Option<StructuredDiaryText> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return None;
    }

    let draft = extract_json_output::<DiaryDraft>(trimmed).unwrap_or_else(|| DiaryDraft {
        details: serde_json::Value::String(trimmed.to_string()),
        ..DiaryDraft::default()
    });

    let clean = |value: Option<String>| value.map(|v| v.trim().to_string()).unwrap_or_default();
    let details: Vec<String> = match draft.details {
        serde_json::Value::String(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let mut text = StructuredDiaryText {
        title: clean(draft.title),
        overview: clean(draft.overview),
        details,
        mood: clean(draft.mood),
        tomorrow: clean(draft.tomorrow),
    };
    if text.overview.is_empty()
        && text.details.is_empty()
        && text.mood.is_empty()
        && text.tomorrow.is_empty()
    {
        return None;
    }
    if text.title.is_empty() {
        text.title = default_title.to_string();
    }
    Some(text)
}

// ── Tests ────────────────────────────────────────────────────────────────────
