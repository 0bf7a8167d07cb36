//! Hosted LLM client (Anthropic Messages API).
//!
//! Two entry points:
//! - [`complete`] — non-streaming completion with retry/backoff for
//!   transient errors (429/5xx/network), fail-fast on other 4xx.
//! - [`stream_completion`] — streaming completion; parses the API's SSE
//!   frames and invokes a callback per text delta. No retry: once tokens
//!   have been forwarded the call is not repeatable.
//!
//! Requires the `ANTHROPIC_API_KEY` environment variable.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;

use crate::config::AiConfig;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// One turn of a chat exchange (`role` is `"user"` or `"assistant"`).
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

fn request_body(
    config: &AiConfig,
    system: &str,
    messages: &[Message],
    max_tokens: u32,
    stream: bool,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": config.model,
        "max_tokens": max_tokens,
        "system": system,
        "messages": messages,
    });
    if stream {
        body["stream"] = serde_json::Value::Bool(true);
    }
    body
}

/// Non-streaming completion. Returns the concatenated text content.
pub async fn complete(
    config: &AiConfig,
    system: &str,
    messages: &[Message],
    max_tokens: u32,
) -> Result<String> {
    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = request_body(config, system, messages, max_tokens, false);
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(MESSAGES_URL)
            .header("x-api-key", &api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_completion_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("AI API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("AI API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
}

/// Extract the text from a Messages API response.
fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid AI response: missing content array"))?;

    let text: String = content
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                block.get("text").and_then(|t| t.as_str())
            } else {
                None
            }
        })
        .collect();

    if text.is_empty() {
        bail!("Invalid AI response: no text content");
    }
    Ok(text)
}

/// Streaming completion. Calls `on_delta` for each text fragment as it
/// arrives and returns the assembled full text when the stream ends.
pub async fn stream_completion(
    config: &AiConfig,
    system: &str,
    messages: &[Message],
    max_tokens: u32,
    mut on_delta: impl FnMut(&str),
) -> Result<String> {
    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

    // No overall timeout here: a healthy stream can legitimately run for
    // minutes. Connect failures still surface promptly.
    let client = reqwest::Client::new();

    let response = client
        .post(MESSAGES_URL)
        .header("x-api-key", &api_key)
        .header("anthropic-version", API_VERSION)
        .header("Content-Type", "application/json")
        .json(&request_body(config, system, messages, max_tokens, true))
        .send()
        .await
        .context("AI stream connect failed")?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("AI API error {}: {}", status, body_text);
    }

    let mut full_text = String::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("AI stream read failed")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // SSE frames are separated by a blank line.
        while let Some(pos) = buffer.find("\n\n") {
            let frame = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            if let Some(data) = sse_frame_data(&frame) {
                if let Some(text) = extract_text_delta(&data) {
                    full_text.push_str(&text);
                    on_delta(&text);
                } else if data.get("type").and_then(|t| t.as_str()) == Some("error") {
                    bail!(
                        "AI stream error: {}",
                        data.get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown")
                    );
                }
            }
        }
    }

    Ok(full_text)
}

/// Pull the JSON payload out of one SSE frame (`data: {...}` lines).
fn sse_frame_data(frame: &str) -> Option<serde_json::Value> {
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim();
            if rest == "[DONE]" {
                return None;
            }
            return serde_json::from_str(rest).ok();
        }
    }
    None
}

/// Extract the text fragment from a `content_block_delta` event, if any.
fn extract_text_delta(event: &serde_json::Value) -> Option<String> {
    if event.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type")?.as_str()? != "text_delta" {
        return None;
    }
    Some(delta.get("text")?.as_str()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_response() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "Hello " },
                { "type": "text", "text": "world" }
            ]
        });
        assert_eq!(parse_completion_response(&json).unwrap(), "Hello world");
    }

    #[test]
    fn test_parse_completion_response_missing_content() {
        let json = serde_json::json!({ "id": "msg_123" });
        assert!(parse_completion_response(&json).is_err());
    }

    #[test]
    fn test_sse_frame_data() {
        let frame = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}";
        let data = sse_frame_data(frame).unwrap();
        assert_eq!(extract_text_delta(&data).unwrap(), "hi");
    }

    #[test]
    fn test_sse_frame_ignores_non_delta_events() {
        let frame = "event: message_start\ndata: {\"type\":\"message_start\"}";
        let data = sse_frame_data(frame).unwrap();
        assert!(extract_text_delta(&data).is_none());
    }

    #[test]
    fn test_sse_frame_done_marker() {
        assert!(sse_frame_data("data: [DONE]").is_none());
        assert!(sse_frame_data("event: ping").is_none());
    }

    #[test]
    fn test_extract_text_delta_skips_other_delta_types() {
        let event = serde_json::json!({
            "type": "content_block_delta",
            "delta": { "type": "input_json_delta", "partial_json": "{}" }
        });
        assert!(extract_text_delta(&event).is_none());
    }
}
