use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::LlmSettings,
    text::truncate_chars,
    types::{CompletionText, Usage},
};

const ERROR_BODY_LIMIT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API error {status}: {excerpt}")]
    Status { status: u16, excerpt: String },
    #[error("API returned empty content")]
    Empty,
}

/// A language-model completion service: one system instruction, one user turn.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<CompletionText, LlmError>;
}

/// Calls `llm` and logs the token usage under `stage`.
pub async fn ask(
    llm: &dyn Completion,
    stage: &str,
    system: &str,
    user: &str,
    max_tokens: u32,
) -> Result<String, LlmError> {
    let reply = llm.complete(system, user, max_tokens).await?;
    info!(
        stage,
        input_tokens = reply.usage.input_tokens,
        output_tokens = reply.usage.output_tokens,
        "completion done"
    );
    Ok(reply.text)
}

// ── Anthropic-compatible API wire types ───────────────────────────────────────

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

// ── HTTP client builder ───────────────────────────────────────────────────────

pub fn build_http_client(proxy: Option<&str>, timeout_ms: Option<u64>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(proxy_url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }

    if let Some(ms) = timeout_ms {
        builder = builder
            .timeout(Duration::from_millis(ms))
            .connect_timeout(Duration::from_secs(10));
    }

    builder.build().map_err(Into::into)
}

// ── Messages API client ───────────────────────────────────────────────────────

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, settings: &LlmSettings) -> Self {
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl Completion for AnthropicClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<CompletionText, LlmError> {
        let body = ApiRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: [ApiMessage {
                role: "user",
                content: user,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status,
                excerpt: truncate_chars(&text, ERROR_BODY_LIMIT_CHARS),
            });
        }

        let parsed: ApiResponse = resp.json().await?;
        collect_text(parsed)
    }
}

fn collect_text(parsed: ApiResponse) -> Result<CompletionText, LlmError> {
    let text: String = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(LlmError::Empty);
    }
    if parsed.stop_reason.as_deref() == Some("max_tokens") {
        debug!("completion stopped at the token budget; output may be truncated");
    }
    Ok(CompletionText {
        text,
        usage: parsed.usage,
    })
}
