//! OCR seam and the bundled Umi-style HTTP client.
//!
//! Severity contract: transport and protocol breakage means the backend is
//! gone and maps to [`OcrError::Fatal`] (aborts all scheduling); a call
//! timeout or an empty recognition is [`OcrError::Service`] and only costs
//! the current attempt its price read.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tracing::debug;

use crate::config::OcrConfig;
use crate::error::OcrError;

/// Text recognition over an encoded image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine name for logs and config matching.
    fn name(&self) -> &str;

    /// Recognize text in the given PNG bytes.
    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError>;
}

/// Umi-OCR HTTP API client (`POST /api/ocr` with a base64 payload).
pub struct UmiHttpOcr {
    client: reqwest::Client,
    base_url: String,
    options: serde_json::Value,
}

impl UmiHttpOcr {
    pub fn new(base_url: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            options,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(config.base_url.clone(), config.options.clone())
    }
}

#[async_trait]
impl OcrEngine for UmiHttpOcr {
    fn name(&self) -> &str {
        "umi"
    }

    async fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
        let data_b64 = base64::engine::general_purpose::STANDARD.encode(image_png);
        let mut payload = json!({ "base64": data_b64 });
        if self.options.is_object() {
            payload["options"] = self.options.clone();
        }

        let url = format!("{}/api/ocr", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OcrError::Fatal(format!("OCR service unreachable: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OcrError::Fatal(format!("OCR service returned malformed body: {e}")))?;

        // code 100 = ok, 101 = nothing recognized, anything else is an
        // engine-side failure worth retrying on the next attempt.
        let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        match code {
            100 => {}
            101 => return Ok(String::new()),
            other => {
                return Err(OcrError::Service(format!("OCR engine error code {other}")));
            }
        }

        let text = match body.get("data") {
            Some(serde_json::Value::Array(entries)) => entries
                .iter()
                .filter_map(|e| e.get("text").and_then(|t| t.as_str()))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        };

        debug!(chars = text.len(), "OCR response parsed");
        Ok(text)
    }
}

/// An OCR engine wrapped with the call timeout the worker relies on.
///
/// The configured engine name is matched against the supplied engines; an
/// unknown or empty name falls back to the bundled HTTP client, so a run
/// never starts without a working engine selection.
pub struct OcrService {
    engine: Box<dyn OcrEngine>,
    timeout: Duration,
}

impl OcrService {
    pub fn new(engine: Box<dyn OcrEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Pick the engine named by config from `engines`, defaulting to the
    /// bundled Umi HTTP client.
    pub fn resolve(config: &OcrConfig, engines: Vec<Box<dyn OcrEngine>>) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut engines = engines;
        if let Some(idx) = engines.iter().position(|e| e.name() == config.engine) {
            return Self::new(engines.swap_remove(idx), timeout);
        }
        Self::new(Box::new(UmiHttpOcr::from_config(config)), timeout)
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Recognize with the per-call timeout enforced; a stalled backend
    /// costs one attempt, not the worker.
    pub async fn read_text(&self, image_png: &[u8]) -> Result<String, OcrError> {
        match tokio::time::timeout(self.timeout, self.engine.recognize(image_png)).await {
            Ok(result) => result,
            Err(_) => Err(OcrError::Service(format!(
                "OCR call exceeded {:?}",
                self.timeout
            ))),
        }
    }
}
