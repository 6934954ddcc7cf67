use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

// ========================= Configuration =========================

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String, // e.g. "https://openrouter.ai/api/v1"
    pub api_key: String,  // env OPENROUTER_API_KEY
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".into()),
            api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            model: env::var("OPENROUTER_MODEL").unwrap_or_else(|_| "x-ai/grok-4.1-fast".into()),
        }
    }
}

// ========================= Wire Types =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text as produced by the model; may be malformed.
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletion {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Usage,
}

// ========================= Errors =========================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api returned status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed api response: {0}")]
    Decode(String),
    #[error("OPENROUTER_API_KEY missing")]
    MissingApiKey,
}

impl ApiError {
    /// Server errors and transport failures are worth retrying; client
    /// errors and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

// ========================= Backend =========================

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatCompletion, ApiError>;
}

pub struct OpenRouterClient {
    http: Client,
    cfg: LlmConfig,
}

impl OpenRouterClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, ApiError> {
        if cfg.api_key.is_empty() {
            return Err(ApiError::MissingApiKey);
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }
}

#[async_trait]
impl ChatBackend for OpenRouterClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatCompletion, ApiError> {
        let url = format!("{}/chat/completions", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                code: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

// ========================= Retry Layer =========================

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Transport-level retry wrapper around a single model call. Semantic
/// repair of model output lives in the agent loop, not here.
pub async fn complete_with_retry(
    backend: &dyn ChatBackend,
    req: &ChatRequest,
    policy: RetryPolicy,
) -> Result<ChatCompletion, ApiError> {
    let mut last: Option<ApiError> = None;
    for attempt in 0..policy.max_attempts {
        match backend.complete(req).await {
            Ok(completion) => return Ok(completion),
            Err(err) if err.is_retryable() => {
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    error = %err,
                    "model call failed, retrying"
                );
                last = Some(err);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    error!("all retry attempts failed");
    Err(last.unwrap_or_else(|| ApiError::Network("no attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<ChatCompletion, ApiError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<ChatCompletion, ApiError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, _req: &ChatRequest) -> Result<ChatCompletion, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(ApiError::Network("script exhausted".into())))
        }
    }

    fn text_completion(text: &str) -> ChatCompletion {
        ChatCompletion {
            choices: vec![ChatChoice {
                message: ChatMessage::assistant(text),
            }],
            usage: Usage::default(),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            response_format: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Status {
                code: 500,
                body: "boom".into(),
            }),
            Err(ApiError::Status {
                code: 503,
                body: "busy".into(),
            }),
            Ok(text_completion("ok")),
        ]);
        let out = complete_with_retry(&backend, &request(), RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(out.choices[0].message.content.as_deref(), Some("ok"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let backend = ScriptedBackend::new(vec![Err(ApiError::Status {
            code: 400,
            body: "bad request".into(),
        })]);
        let err = complete_with_retry(&backend, &request(), RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { code: 400, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::Network("reset".into())),
            Err(ApiError::Network("reset".into())),
            Err(ApiError::Network("reset again".into())),
        ]);
        let err = complete_with_retry(&backend, &request(), RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_schedule_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
    }

    #[test]
    fn tool_message_shape() {
        let msg = ChatMessage::tool("call_1", "{\"message\":\"done\"}");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
        assert!(v.get("tool_calls").is_none());
    }
}
