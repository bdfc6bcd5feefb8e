use std::sync::Arc;

use chrono::{DateTime, Utc};
use diarist_engine::{DiaryService, NotifyOutcome, Reply};
use tracing::{debug, info, warn};

use crate::dedupe::EventDeduper;
use crate::events::{FeishuEvent, InboundMessage};
use crate::input::{Input, parse_input};

/// What the transport should do after an event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Answer the verification request with this challenge.
    Challenge(String),
    Reply { open_id: String, reply: Reply },
    Silent,
}

/// Routes decoded Feishu events into the diary service.
pub struct EventHandler {
    service: Arc<DiaryService>,
    dedupe: EventDeduper,
}

impl EventHandler {
    pub fn new(service: Arc<DiaryService>, dedupe: EventDeduper) -> Self {
        Self { service, dedupe }
    }

    pub fn service(&self) -> &Arc<DiaryService> {
        &self.service
    }

    pub async fn handle(&self, event: FeishuEvent, now: DateTime<Utc>) -> HandleOutcome {
        match event {
            FeishuEvent::Challenge(challenge) => HandleOutcome::Challenge(challenge),
            FeishuEvent::Ignored { event_type } => {
                debug!(event_type = %event_type, "ignoring feishu event");
                HandleOutcome::Silent
            }
            FeishuEvent::DocumentDeleted {
                event_id,
                file_token,
            } => {
                if !self.dedupe.first_seen(&event_id) {
                    debug!(event_id = %event_id, "duplicate deletion event");
                    return HandleOutcome::Silent;
                }
                match self.service.notify_remote_deletion(&file_token, now).await {
                    Ok(NotifyOutcome::Reconciled) => {
                        info!(document_id = %file_token, "remote deletion reconciled");
                    }
                    Ok(NotifyOutcome::Ignored) => {
                        debug!(document_id = %file_token, "remote deletion for untracked document");
                    }
                    Err(err) => {
                        warn!(document_id = %file_token, error = %err, "remote deletion not applied");
                    }
                }
                HandleOutcome::Silent
            }
            FeishuEvent::Message(message) => {
                if !self.dedupe.first_seen(&message.event_id) {
                    debug!(event_id = %message.event_id, "duplicate message event");
                    return HandleOutcome::Silent;
                }
                self.handle_message(message, now).await
            }
        }
    }

    async fn handle_message(&self, message: InboundMessage, now: DateTime<Utc>) -> HandleOutcome {
        let input = match message.text() {
            Some(text) => parse_input(&text),
            None => Input::Entry,
        };

        let reply = match input {
            Input::Command(command) => {
                debug!(user_id = %message.open_id, command = ?command, "running command");
                Some(self.service.execute(&message.open_id, now, command).await)
            }
            Input::Invalid(reply) => Some(reply),
            Input::Entry => self.service.ingest_and_reply(&message.to_raw()).await,
        };

        match reply {
            Some(reply) => HandleOutcome::Reply {
                open_id: message.open_id,
                reply,
            },
            None => HandleOutcome::Silent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use diarist_config::AppConfig;
    use diarist_engine::{BoundedStore, DocumentApi, RemoteDocument, RemoteError, ReplyStatus};
    use diarist_llm::{ChatModel, LlmError};
    use diarist_store::MetadataStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedModel;

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, LlmError> {
            Ok(r#"{"title":"开心的一天","overview":"今天很开心","details":["晚上吃了火锅"],"mood":"","tomorrow":""}"#.to_string())
        }
    }

    #[derive(Default)]
    struct MemoryDocs {
        created: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DocumentApi for MemoryDocs {
        async fn create_document(&self, title: &str, _markdown: &str) -> Result<RemoteDocument, RemoteError> {
            let mut created = self.created.lock().unwrap();
            created.push(title.to_string());
            let document_id = format!("doxcn{}", created.len());
            Ok(RemoteDocument {
                url: format!("https://www.feishu.cn/docx/{document_id}"),
                document_id,
            })
        }

        async fn replace_content(&self, _: &str, _: &str, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn grant_owner_access(&self, _: &str, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn delete_document(&self, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn handler() -> EventHandler {
        let mut config = AppConfig::default();
        config.diary.follow_up_questions = false;
        let service = DiaryService::new(
            BoundedStore::new(MetadataStore::in_memory().unwrap(), Duration::from_secs(2)),
            Arc::new(FixedModel),
            Arc::new(MemoryDocs::default()),
            &config,
        );
        EventHandler::new(Arc::new(service), EventDeduper::new(64, Duration::from_secs(300)))
    }

    fn now() -> DateTime<Utc> {
        // 2025-03-14 21:00 in Shanghai.
        Utc.with_ymd_and_hms(2025, 3, 14, 13, 0, 0).unwrap()
    }

    fn text(event_id: &str, body: &str) -> FeishuEvent {
        FeishuEvent::Message(InboundMessage {
            event_id: event_id.to_string(),
            message_id: format!("om_{event_id}"),
            open_id: "ou_a".to_string(),
            timestamp: now(),
            message_type: "text".to_string(),
            content: json!({ "text": body }),
        })
    }

    fn reply_of(outcome: HandleOutcome) -> Reply {
        match outcome {
            HandleOutcome::Reply { reply, .. } => reply,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn entries_are_acknowledged_and_redeliveries_dropped() {
        let handler = handler();
        let reply = reply_of(handler.handle(text("evt_1", "今天很开心"), now()).await);
        assert!(reply.text.contains("1 entry"));
        assert_eq!(handler.handle(text("evt_1", "今天很开心"), now()).await, HandleOutcome::Silent);

        let reply = reply_of(handler.handle(text("evt_2", "晚上吃了火锅"), now()).await);
        assert!(reply.text.contains("2 entries"));
    }

    #[tokio::test]
    async fn end_of_day_phrase_writes_the_diary() {
        let handler = handler();
        handler.handle(text("evt_1", "今天很开心"), now()).await;
        let reply = reply_of(handler.handle(text("evt_2", "整理日记"), now()).await);
        assert_eq!(reply.status, ReplyStatus::Done);
        assert!(reply.text.contains("https://www.feishu.cn/docx/doxcn1"));

        let listing = reply_of(handler.handle(text("evt_3", "/list"), now()).await);
        assert!(listing.text.contains("/delete doxcn1"));
    }

    #[tokio::test]
    async fn remote_deletion_event_untracks_document() {
        let handler = handler();
        handler.handle(text("evt_1", "今天很开心"), now()).await;
        handler.handle(text("evt_2", "/diary"), now()).await;

        let deleted = FeishuEvent::DocumentDeleted {
            event_id: "evt_9".into(),
            file_token: "doxcn1".into(),
        };
        assert_eq!(handler.handle(deleted, now()).await, HandleOutcome::Silent);
        assert!(handler.service().sync().list("ou_a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_messages_are_silent() {
        let handler = handler();
        let sticker = FeishuEvent::Message(InboundMessage {
            event_id: "evt_5".into(),
            message_id: "om_5".into(),
            open_id: "ou_a".into(),
            timestamp: now(),
            message_type: "sticker".into(),
            content: json!({ "file_key": "x" }),
        });
        assert_eq!(handler.handle(sticker, now()).await, HandleOutcome::Silent);
        assert_eq!(
            handler.handle(FeishuEvent::Challenge("c".into()), now()).await,
            HandleOutcome::Challenge("c".into())
        );
    }
}
