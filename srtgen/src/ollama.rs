//! Refinement through an Ollama-compatible chat endpoint.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engines::{RefineRequest, Refiner};
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// Asks the server to evict a model from memory.
#[derive(Debug, Serialize)]
struct UnloadRequest<'a> {
    model: &'a str,
    keep_alive: u32,
}

pub struct OllamaRefiner {
    client: Client,
    /// (endpoint, model) of the last completion, for unloading.
    last_used: Mutex<Option<(String, String)>>,
}

impl OllamaRefiner {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            last_used: Mutex::new(None),
        }
    }

    fn remember(&self, endpoint: &str, model: &str) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Some((endpoint.to_string(), model.to_string()));
        }
    }
}

impl Default for OllamaRefiner {
    fn default() -> Self {
        Self::new()
    }
}

/// Only a refused or failed connection marks the endpoint unreachable. A slow
/// reply costs just the cue it was for.
fn map_send_error(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Refinement(format!("request to {url} timed out"))
    } else if e.is_connect() {
        Error::Unreachable(format!("{url}: {e}"))
    } else {
        Error::Refinement(format!("request to {url} failed: {e}"))
    }
}

#[async_trait]
impl Refiner for OllamaRefiner {
    async fn complete(&self, request: &RefineRequest) -> Result<String> {
        let url = format!("{}/api/chat", request.endpoint.trim_end_matches('/'));
        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: request.prompt.clone(),
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;
        self.remember(&request.endpoint, &request.model);

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Refinement(format!("{url} returned {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Refinement(format!("invalid response from {url}: {e}")))?;
        Ok(parsed.message.content)
    }

    async fn unload(&self) -> Result<()> {
        let last = self.last_used.lock().ok().and_then(|mut l| l.take());
        let Some((endpoint, model)) = last else {
            return Ok(());
        };

        let url = format!("{}/api/generate", endpoint.trim_end_matches('/'));
        debug!(%url, %model, "requesting model eviction");
        self.client
            .post(&url)
            .json(&UnloadRequest {
                model: &model,
                keep_alive: 0,
            })
            .send()
            .await?
            .error_for_status()?;
        info!(%model, "refinement model unloaded");
        Ok(())
    }
}
