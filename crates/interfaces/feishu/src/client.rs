//! HTTP client for the Feishu open platform: docx documents, drive
//! permissions and files, and bot text messages.
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use diarist_config::FeishuConfig;
use diarist_engine::{DocumentApi, RemoteDocument, RemoteError};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::blocks::{MAX_BLOCKS_PER_CALL, chunk_message, markdown_to_blocks};

const REPLY_CHUNK_CHARS: usize = 4_000;
/// Refresh the tenant token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Platform codes meaning the file or document no longer exists.
const NOT_FOUND_CODES: &[i64] = &[1_061_003, 1_061_007, 1_770_002, 1_770_003];
/// Rate limiting and internal errors.
const TRANSIENT_CODES: &[i64] = &[99_991_400, 1_061_045, 1_770_022];
/// The cached tenant token was rejected.
const TOKEN_CODES: &[i64] = &[99_991_661, 99_991_663, 99_991_668];

#[derive(Debug, Deserialize)]
struct FeishuResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedDocument {
    document: DocumentInfo,
}

#[derive(Debug, Deserialize)]
struct DocumentInfo {
    document_id: String,
}

#[derive(Debug, Deserialize)]
struct BlockChildren {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct FeishuClient {
    http: Client,
    config: FeishuConfig,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuClient {
    pub fn new(config: &FeishuConfig, timeout: Duration) -> Result<Self> {
        if !config.has_credentials() {
            bail!("FEISHU_APP_ID / FEISHU_APP_SECRET are not set");
        }
        let http = Client::builder()
            .timeout(timeout.max(Duration::from_secs(1)))
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub fn document_url(&self, document_id: &str) -> String {
        format!("{}{document_id}", self.config.document_url_base)
    }

    // ── Auth ──────────────────────────────────────────────────────────────────

    async fn tenant_token(&self) -> Result<String, RemoteError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| Instant::now() < token.refresh_at) {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(self.url("auth/v3/tenant_access_token/internal"))
            .json(&json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await
            .map_err(|err| classify_transport("tenant token", &err))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport("tenant token", &err))?;

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|_| classify_status("tenant token", status, &body))?;
        if parsed.code != 0 || parsed.tenant_access_token.is_empty() {
            return Err(classify_code("tenant token", status, parsed.code, &parsed.msg));
        }

        let lifetime = Duration::from_secs(parsed.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in = parsed.expire, "tenant access token refreshed");
        *cached = Some(CachedToken {
            value: parsed.tenant_access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(parsed.tenant_access_token)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        let token = self.tenant_token().await?;
        Ok(request.bearer_auth(token))
    }

    /// Send an authorized request and unwrap the `{code, msg, data}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        what: &str,
        request: RequestBuilder,
    ) -> Result<Option<T>, RemoteError> {
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|err| classify_transport(what, &err))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport(what, &err))?;

        let result = parse_envelope(what, status, &body);
        if result.is_err() && body_code(&body).is_some_and(|code| TOKEN_CODES.contains(&code)) {
            self.token.lock().await.take();
        }
        result
    }

    // ── Documents ─────────────────────────────────────────────────────────────

    async fn append_blocks(&self, document_id: &str, markdown: &str) -> Result<(), RemoteError> {
        let blocks = markdown_to_blocks(markdown);
        let path = format!("docx/v1/documents/{document_id}/blocks/{document_id}/children");
        for batch in blocks.chunks(MAX_BLOCKS_PER_CALL) {
            self.call::<Value>(
                "append blocks",
                self.http
                    .post(self.url(&path))
                    .query(&[("document_revision_id", "-1")])
                    .json(&json!({ "children": batch })),
            )
            .await?;
        }
        Ok(())
    }

    async fn root_child_count(&self, document_id: &str) -> Result<usize, RemoteError> {
        let path = format!("docx/v1/documents/{document_id}/blocks/{document_id}/children");
        let mut count = 0;
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("page_size".to_string(), "500".to_string())];
            if let Some(token) = &page_token {
                query.push(("page_token".to_string(), token.clone()));
            }
            let page: BlockChildren = self
                .call("list blocks", self.http.get(self.url(&path)).query(&query))
                .await?
                .ok_or_else(|| RemoteError::Permanent("list blocks: missing data".to_string()))?;
            count += page.items.len();
            match page.page_token {
                Some(token) if page.has_more => page_token = Some(token),
                _ => return Ok(count),
            }
        }
    }

    async fn set_title(&self, document_id: &str, title: &str) -> Result<(), RemoteError> {
        let path = format!("docx/v1/documents/{document_id}/blocks/{document_id}");
        self.call::<Value>(
            "update title",
            self.http.patch(self.url(&path)).json(&json!({
                "update_text_elements": {
                    "elements": [{ "text_run": { "content": title } }]
                }
            })),
        )
        .await?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Send `text` to `open_id` as one or more plain text messages.
    pub async fn send_text(&self, open_id: &str, text: &str) -> Result<(), RemoteError> {
        for chunk in chunk_message(text, REPLY_CHUNK_CHARS) {
            let content = json!({ "text": chunk }).to_string();
            self.call::<Value>(
                "send message",
                self.http
                    .post(self.url("im/v1/messages"))
                    .query(&[("receive_id_type", "open_id")])
                    .json(&json!({
                        "receive_id": open_id,
                        "msg_type": "text",
                        "content": content,
                    })),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentApi for FeishuClient {
    async fn create_document(
        &self,
        title: &str,
        markdown: &str,
    ) -> Result<RemoteDocument, RemoteError> {
        let mut body = json!({ "title": title });
        if !self.config.folder_token.trim().is_empty() {
            body["folder_token"] = json!(self.config.folder_token);
        }
        let created: CreatedDocument = self
            .call(
                "create document",
                self.http.post(self.url("docx/v1/documents")).json(&body),
            )
            .await?
            .ok_or_else(|| RemoteError::Permanent("create document: missing data".to_string()))?;
        let document_id = created.document.document_id;

        if let Err(err) = self.append_blocks(&document_id, markdown).await {
            warn!(document_id = %document_id, error = %err, "content append failed; removing empty document");
            if let Err(cleanup) = self.delete_document(&document_id).await {
                warn!(document_id = %document_id, error = %cleanup, "could not remove empty document");
            }
            return Err(err);
        }

        info!(document_id = %document_id, "feishu document created");
        Ok(RemoteDocument {
            url: self.document_url(&document_id),
            document_id,
        })
    }

    async fn replace_content(
        &self,
        document_id: &str,
        title: &str,
        markdown: &str,
    ) -> Result<(), RemoteError> {
        let existing = self.root_child_count(document_id).await?;
        if existing > 0 {
            let path =
                format!("docx/v1/documents/{document_id}/blocks/{document_id}/children/batch_delete");
            self.call::<Value>(
                "clear blocks",
                self.http
                    .delete(self.url(&path))
                    .query(&[("document_revision_id", "-1")])
                    .json(&json!({ "start_index": 0, "end_index": existing })),
            )
            .await?;
        }
        self.set_title(document_id, title).await?;
        self.append_blocks(document_id, markdown).await?;
        info!(document_id = %document_id, replaced = existing, "feishu document content replaced");
        Ok(())
    }

    async fn grant_owner_access(
        &self,
        document_id: &str,
        owner_user_id: &str,
    ) -> Result<(), RemoteError> {
        let path = format!("drive/v1/permissions/{document_id}/members");
        self.call::<Value>(
            "grant access",
            self.http
                .post(self.url(&path))
                .query(&[("type", "docx"), ("need_notification", "false")])
                .json(&json!({
                    "member_type": "openid",
                    "member_id": owner_user_id,
                    "perm": "full_access",
                })),
        )
        .await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), RemoteError> {
        let path = format!("drive/v1/files/{document_id}");
        self.call::<Value>(
            "delete document",
            self.http.delete(self.url(&path)).query(&[("type", "docx")]),
        )
        .await?;
        Ok(())
    }
}

// ── Failure classification ────────────────────────────────────────────────────

fn parse_envelope<T: DeserializeOwned>(
    what: &str,
    status: u16,
    body: &str,
) -> Result<Option<T>, RemoteError> {
    match serde_json::from_str::<FeishuResponse<T>>(body) {
        Ok(envelope) if envelope.code == 0 && status < 400 => Ok(envelope.data),
        Ok(envelope) => Err(classify_code(what, status, envelope.code, &envelope.msg)),
        Err(_) => Err(classify_status(what, status, body)),
    }
}

fn body_code(body: &str) -> Option<i64> {
    serde_json::from_str::<Value>(body).ok()?["code"].as_i64()
}

fn classify_code(what: &str, status: u16, code: i64, msg: &str) -> RemoteError {
    let message = format!("{what}: code {code}: {msg}");
    if NOT_FOUND_CODES.contains(&code) || status == 404 {
        RemoteError::NotFound(message)
    } else if TRANSIENT_CODES.contains(&code)
        || TOKEN_CODES.contains(&code)
        || status == 429
        || status >= 500
    {
        RemoteError::Transient(message)
    } else {
        RemoteError::Permanent(message)
    }
}

fn classify_status(what: &str, status: u16, body: &str) -> RemoteError {
    let snippet: String = body.chars().take(300).collect();
    let message = format!("{what}: HTTP {status}: {snippet}");
    match status {
        404 => RemoteError::NotFound(message),
        408 | 429 | 500..=599 => RemoteError::Transient(message),
        _ => RemoteError::Permanent(message),
    }
}

fn classify_transport(what: &str, error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        RemoteError::Transient(format!("{what}: unreachable: {error}"))
    } else {
        RemoteError::Permanent(format!("{what}: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_yields_data() {
        let body = r#"{"code":0,"msg":"success","data":{"document":{"document_id":"doxcnAbc"}}}"#;
        let created: Option<CreatedDocument> = parse_envelope("create", 200, body).unwrap();
        assert_eq!(created.unwrap().document.document_id, "doxcnAbc");

        let empty: Option<Value> = parse_envelope("delete", 200, r#"{"code":0,"msg":"ok"}"#).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn deleted_file_codes_are_not_found() {
        let body = r#"{"code":1061007,"msg":"file has been delete."}"#;
        let err = parse_envelope::<Value>("delete", 400, body).unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        let err = parse_envelope::<Value>("create", 429, r#"{"code":99991400,"msg":"too many"}"#)
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));

        let err = parse_envelope::<Value>("create", 502, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }

    #[test]
    fn expired_token_is_transient() {
        let body = r#"{"code":99991663,"msg":"tenant token invalid"}"#;
        let err = parse_envelope::<Value>("create", 400, body).unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
        assert_eq!(body_code(body), Some(99_991_663));
    }

    #[test]
    fn other_failures_are_permanent() {
        let body = r#"{"code":1770032,"msg":"forbidden"}"#;
        let err = parse_envelope::<Value>("create", 403, body).unwrap_err();
        assert!(matches!(err, RemoteError::Permanent(_)));

        let err = parse_envelope::<Value>("create", 401, "unauthorized").unwrap_err();
        assert!(matches!(err, RemoteError::Permanent(_)));
    }

    #[test]
    fn client_requires_credentials() {
        assert!(FeishuClient::new(&FeishuConfig::default(), Duration::from_secs(5)).is_err());

        let config = FeishuConfig {
            app_id: "cli_a".into(),
            app_secret: "secret".into(),
            ..FeishuConfig::default()
        };
        let client = FeishuClient::new(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(client.document_url("doxcn1"), "https://www.feishu.cn/docx/doxcn1");
        assert_eq!(
            client.url("docx/v1/documents"),
            "https://open.feishu.cn/open-apis/docx/v1/documents"
        );
    }
}
