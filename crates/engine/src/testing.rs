//! Scripted stand-ins for the model, the remote document store and
//! metadata store outages.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use diarist_llm::{ChatModel, LlmError};

use crate::sync::{DocumentApi, RemoteDocument, RemoteError};

// ── ScriptedModel ─────────────────────────────────────────────────────────────

pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub(crate) fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Permanent("script exhausted".to_string())))
    }
}

// ── FakeDocumentApi ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Transient,
    Permanent,
    NotFound,
    /// Sleep well past any test timeout.
    Hang,
}

impl Behavior {
    async fn fail(self, what: &str) -> RemoteError {
        match self {
            Self::Transient => RemoteError::Transient(format!("{what}: 503")),
            Self::Permanent => RemoteError::Permanent(format!("{what}: 403")),
            Self::NotFound => RemoteError::NotFound(what.to_string()),
            Self::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                RemoteError::Transient(format!("{what}: hung"))
            }
        }
    }
}

/// Remote document store that succeeds unless a failure was scripted for
/// the next call of an operation.
#[derive(Default)]
pub(crate) struct FakeDocumentApi {
    create_script: Mutex<VecDeque<Behavior>>,
    replace_script: Mutex<VecDeque<Behavior>>,
    grant_script: Mutex<VecDeque<Behavior>>,
    delete_failures: Mutex<HashMap<String, Behavior>>,
    create_calls: AtomicUsize,
    replace_calls: AtomicUsize,
    grants: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeDocumentApi {
    pub(crate) fn script_create(&self, behavior: Behavior) {
        self.create_script.lock().unwrap().push_back(behavior);
    }

    pub(crate) fn script_replace(&self, behavior: Behavior) {
        self.replace_script.lock().unwrap().push_back(behavior);
    }

    pub(crate) fn script_grant(&self, behavior: Behavior) {
        self.grant_script.lock().unwrap().push_back(behavior);
    }

    pub(crate) fn fail_delete(&self, document_id: &str, behavior: Behavior) {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(document_id.to_string(), behavior);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn grants(&self) -> Vec<(String, String)> {
        self.grants.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentApi for FakeDocumentApi {
    async fn create_document(
        &self,
        _title: &str,
        _markdown: &str,
    ) -> Result<RemoteDocument, RemoteError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.create_script.lock().unwrap().pop_front();
        if let Some(behavior) = scripted {
            return Err(behavior.fail("create").await);
        }
        let document_id = format!("doxcn{n:04}");
        Ok(RemoteDocument {
            url: format!("https://www.feishu.cn/docx/{document_id}"),
            document_id,
        })
    }

    async fn replace_content(
        &self,
        _document_id: &str,
        _title: &str,
        _markdown: &str,
    ) -> Result<(), RemoteError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.replace_script.lock().unwrap().pop_front();
        match scripted {
            Some(behavior) => Err(behavior.fail("replace").await),
            None => Ok(()),
        }
    }

    async fn grant_owner_access(
        &self,
        document_id: &str,
        owner_user_id: &str,
    ) -> Result<(), RemoteError> {
        let scripted = self.grant_script.lock().unwrap().pop_front();
        if let Some(behavior) = scripted {
            return Err(behavior.fail("grant").await);
        }
        self.grants
            .lock()
            .unwrap()
            .push((document_id.to_string(), owner_user_id.to_string()));
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError> {
        let failure = self.delete_failures.lock().unwrap().get(document_id).copied();
        if let Some(behavior) = failure {
            return Err(behavior.fail("delete").await);
        }
        self.deleted.lock().unwrap().push(document_id.to_string());
        Ok(())
    }
}

// ── StoreFaults ───────────────────────────────────────────────────────────────

/// Simulated metadata store outage.  After `fail_after(n)` the next `n`
/// calls pass and every later call fails until `restore`.
#[derive(Debug, Default)]
pub(crate) struct StoreFaults {
    remaining: Mutex<Option<usize>>,
}

impl StoreFaults {
    pub(crate) fn fail_after(&self, calls: usize) {
        *self.remaining.lock().unwrap() = Some(calls);
    }

    pub(crate) fn restore(&self) {
        *self.remaining.lock().unwrap() = None;
    }

    pub(crate) fn trip(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        match remaining.as_mut() {
            None => false,
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
        }
    }
}
