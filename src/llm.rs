//! Language-model client for reply generation.
//!
//! [`ChatCompletionsClient`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint (Groq by default). A call makes exactly one
//! HTTP attempt; failures are classified as transient or fatal so the reply
//! pipeline can decide whether to retry.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::context::{Prompt, PromptMessage};
use crate::error::{Error, Result};

/// Generates reply text from an assembled prompt
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// HTTP client for OpenAI-compatible chat completion APIs
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    /// Build a client from config. Fails if no API key is configured.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.require_api_key()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::config(format!("invalid API key header value: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.llm_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.llm_base_url.trim_end_matches('/')),
            model: config.llm_model.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        })
    }

    /// Model identifier sent with each request
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: &prompt.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: 0.9,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("language model request timed out: {}", e))
                } else {
                    Error::llm_transient(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        debug!(status = %status, model = %self.model, "completion response received");

        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_transient(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            let message = format!("API returned {}: {}", status, detail);
            return Err(if is_transient_error(status) {
                Error::llm_transient(message)
            } else {
                Error::llm_fatal(message)
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_fatal(format!("failed to parse API response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| Error::llm_fatal("response contained no choices"))
    }
}

/// Returns true for HTTP status codes that indicate transient errors worth retrying.
fn is_transient_error(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

const REPLY_PREFIXES: [&str; 3] = ["reply:", "response:", "message:"];

/// Strip the wrapping models like to add: surrounding quotes and labels such
/// as `Reply:`. Returns an empty string if nothing usable is left.
pub fn clean_reply(raw: &str) -> String {
    let mut text = raw.trim();

    for prefix in REPLY_PREFIXES {
        if text.len() >= prefix.len()
            && text.is_char_boundary(prefix.len())
            && text[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            text = text[prefix.len()..].trim_start();
            break;
        }
    }

    // Quotes may be nested ("'hi'"), so peel until none wrap the text
    'peel: loop {
        for (open, close) in [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}')] {
            if text.chars().count() >= 2 && text.starts_with(open) && text.ends_with(close) {
                text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
                continue 'peel;
            }
        }
        break;
    }

    text.to_string()
}
