//! Client for a messages-style LLM API with image inputs. Used for valuation
//! reports and garbage-image detection.
use crate::config::Llm;
use crate::error::{classify_status, PipelineError};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// An image attached to a prompt.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn from_key(key: &str, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type_for_key(key).to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub stop_reason: Option<String>,
}

impl Completion {
    /// The model stopped because it ran out of output budget.
    pub fn hit_token_limit(&self) -> bool {
        self.stop_reason.as_deref() == Some("max_tokens")
    }
}

pub fn media_type_for_key(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Serialize, Debug)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    version: String,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LlmClient {
    pub fn from_config(cfg: &Llm) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid llm.base_url")?;
        let http = Client::builder()
            .user_agent("moxon-worker/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .context("failed to build llm http client")?;
        Ok(Self {
            http,
            base_url,
            api_key: cfg.resolved_api_key(),
            version: cfg.version.clone(),
        })
    }

    pub fn build_body(
        model: &str,
        max_tokens: u32,
        system: Option<&str>,
        prompt: &str,
        images: &[ImageInput],
    ) -> Value {
        let mut content: Vec<Value> = images
            .iter()
            .map(|img| {
                json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": img.media_type,
                        "data": STANDARD.encode(&img.data),
                    }
                })
            })
            .collect();
        content.push(json!({ "type": "text", "text": prompt }));

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": content }],
        });
        if let Some(system) = system {
            body["system"] = Value::String(system.to_string());
        }
        body
    }

    #[instrument(skip(self, system, prompt, images), fields(images = images.len()))]
    pub async fn complete(
        &self,
        model: &str,
        max_tokens: u32,
        system: Option<&str>,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<Completion> {
        let endpoint = self
            .base_url
            .join("v1/messages")
            .context("invalid llm endpoint")?;
        let body = Self::build_body(model, max_tokens, system, prompt, images);

        let mut req = self
            .http
            .post(endpoint)
            .header("anthropic-version", &self.version)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let res = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                anyhow::Error::from(PipelineError::Transient(format!("llm request failed: {}", e)))
            } else {
                anyhow::Error::new(e).context("llm request failed")
            }
        })?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(%status, model, "llm api error");
            return Err(classify_status(status, &text).into());
        }

        let payload: MessagesResponse = res.json().await.context("invalid llm response JSON")?;
        let text: String = payload
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(anyhow!("llm response contained no text"));
        }
        if let Some(usage) = &payload.usage {
            info!(
                model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = payload.stop_reason.as_deref().unwrap_or(""),
                "llm completion"
            );
        }
        Ok(Completion {
            text,
            stop_reason: payload.stop_reason,
        })
    }
}
