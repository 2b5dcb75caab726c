//! Client for an NLLB-200 translation server.
//!
//! Speaks the `nllb-serve` protocol: `POST {endpoint}/translate` with a list
//! of source sentences and NLLB language codes.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engines::{TranslationRequest, Translator};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct TranslateBody<'a> {
    source: &'a [String],
    src_lang: &'a str,
    tgt_lang: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translation: Vec<String>,
}

pub struct NllbTranslator {
    client: Client,
}

impl NllbTranslator {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for NllbTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for NllbTranslator {
    async fn translate(&self, request: &TranslationRequest<'_>) -> Result<Vec<String>> {
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/translate", request.endpoint.trim_end_matches('/'));
        debug!(%url, count = request.texts.len(), "translating");

        let response = self
            .client
            .post(&url)
            .json(&TranslateBody {
                source: request.texts,
                src_lang: request.source.nllb_code(),
                tgt_lang: request.target.nllb_code(),
                model: request.model,
            })
            .send()
            .await
            .map_err(|e| Error::Translation(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            return Err(Error::Translation(format!("{url} returned {status}: {body}")));
        }

        let parsed: TranslateResponse = response
            .json()
            .await
            .map_err(|e| Error::Translation(format!("invalid response from {url}: {e}")))?;

        if parsed.translation.len() != request.texts.len() {
            return Err(Error::Translation(format!(
                "expected {} translations, got {}",
                request.texts.len(),
                parsed.translation.len()
            )));
        }
        Ok(parsed.translation)
    }
}
