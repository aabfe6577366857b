//! AI-assisted tag suggestion
//!
//! Sends an image to an OpenAI-compatible `chat/completions` endpoint
//! and parses the structured reply into suggested manifest fields. The
//! suggestion path is independent of the batch pipeline: callers feed
//! the result back into a manifest themselves.

use crate::app_error::{Result, StampError};
use crate::manifest::split_keywords;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const PROMPT: &str =
    "Analyze this image and provide a title, description, and keywords in JSON format.";

/// Fields suggested for one image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedTags {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
}

pub struct TagAssistClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl Default for TagAssistClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TagAssistClient {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Point the client at a non-default endpoint (test servers,
    /// compatible proxies).
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();
        Self {
            agent,
            endpoint: endpoint.into(),
        }
    }

    /// Request tag suggestions for one image.
    ///
    /// The key is shape-checked before any bytes leave the machine.
    /// HTTP 401 maps to [`StampError::InvalidCredential`], 429 to
    /// [`StampError::RateLimited`]; everything else surfaces as
    /// [`StampError::AssistFailed`].
    pub fn suggest(&self, image_path: &Path, api_key: &str) -> Result<SuggestedTags> {
        if !api_key.starts_with("sk-") {
            return Err(StampError::InvalidCredential);
        }

        let bytes = std::fs::read(image_path)?;
        let data_url = format!(
            "data:{};base64,{}",
            mime_for(image_path),
            BASE64.encode(&bytes)
        );

        let body = request_body(&data_url);
        tracing::info!(
            image = %image_path.display(),
            model = MODEL,
            bytes = bytes.len(),
            "Requesting tag suggestions"
        );

        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", api_key))
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(map_http_error)?;

        let reply: serde_json::Value = response
            .into_json()
            .map_err(|e| StampError::AssistFailed(format!("unreadable response: {}", e)))?;
        parse_reply(&reply)
    }
}

fn request_body(data_url: &str) -> serde_json::Value {
    serde_json::json!({
        "model": MODEL,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": PROMPT },
                { "type": "image_url", "image_url": { "url": data_url, "detail": "low" } }
            ]
        }],
        "max_tokens": 300,
        "temperature": 0.3,
        "response_format": { "type": "json_object" }
    })
}

fn map_http_error(error: ureq::Error) -> StampError {
    match error {
        ureq::Error::Status(401, _) => StampError::InvalidCredential,
        ureq::Error::Status(429, _) => StampError::RateLimited,
        ureq::Error::Status(code, response) => {
            let detail = response
                .into_string()
                .unwrap_or_else(|_| "unreadable error body".to_string());
            StampError::AssistFailed(format!("HTTP {}: {}", code, detail))
        }
        ureq::Error::Transport(transport) => {
            StampError::AssistFailed(format!("transport error: {}", transport))
        }
    }
}

/// Extract `choices[0].message.content` and parse the model's JSON
/// payload. The model sometimes emits keywords as a single delimited
/// string rather than an array; both forms are accepted.
fn parse_reply(reply: &serde_json::Value) -> Result<SuggestedTags> {
    let content = reply
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StampError::AssistFailed("response carries no content".to_string()))?;

    let payload: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| StampError::AssistFailed(format!("content is not JSON: {}", e)))?;

    let title = string_field(&payload, "title")?;
    let description = string_field(&payload, "description")?;
    let keywords = match payload.get("keywords") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(serde_json::Value::String(joined)) => split_keywords(joined),
        _ => {
            return Err(StampError::AssistFailed(
                "response payload has no keywords".to_string(),
            ))
        }
    };

    Ok(SuggestedTags {
        title,
        description,
        keywords,
    })
}

fn string_field(payload: &serde_json::Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| StampError::AssistFailed(format!("response payload has no {}", field)))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
