//! Classification client — turns message batches into urgency verdicts.
//!
//! Drives an OpenAI-compatible `chat/completions` endpoint directly over
//! HTTP. Owns prompt construction, response parsing, and the request-level
//! retry/backoff policy; run-level policy (halting, cooldowns) belongs to
//! the engine.

mod parse;
mod prompt;

pub use parse::parse_verdicts;
pub use prompt::{build_prompt, normalize_text, PromptMessages};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ClassifyError;
use crate::settings::{Provider, TriageSettings};
use crate::types::{Message, TriageVerdict};

/// Seam for the orchestrator (and for test doubles).
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a batch. Empty input returns empty output without a call.
    async fn classify(
        &self,
        messages: &[Message],
        settings: &TriageSettings,
    ) -> Result<Vec<TriageVerdict>, ClassifyError>;
}

/// HTTP classification client.
pub struct HttpClassifier {
    http: reqwest::Client,
}

impl Default for HttpClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClassifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Single canned round-trip to verify the configured provider works.
    /// Consent is implied by the caller explicitly asking for a probe.
    pub async fn test_connection(
        &self,
        settings: &TriageSettings,
    ) -> Result<Vec<TriageVerdict>, ClassifyError> {
        let probe = Message {
            identity: "test-thread".into(),
            sender: "test@example.com".into(),
            subject: "Can you classify this message?".into(),
            snippet: "This is a test message for connection health.".into(),
            body_text: String::new(),
            source_handle: None,
            permalink: None,
            detected_level: None,
        };
        let mut settings = settings.clone();
        settings.enabled = true;
        settings.consent_granted = true;
        self.classify(&[probe], &settings).await
    }

    /// One request attempt. Returns the assistant text on success.
    async fn attempt(
        &self,
        endpoint: &str,
        settings: &TriageSettings,
        prompt: &PromptMessages,
        strict_json: bool,
    ) -> Result<String, ClassifyError> {
        let provider = settings.provider.as_str().to_string();

        let mut payload = json!({
            "model": settings.model,
            "temperature": 0.1,
            "max_tokens": 1000,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        if strict_json {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let mut request = self
            .http
            .post(endpoint)
            // Hard timeout: the request is cancelled, not abandoned.
            .timeout(settings.request_timeout)
            .json(&payload);

        if settings.provider.requires_api_key() {
            if let Some(key) = &settings.api_key {
                request = request.bearer_auth(key.expose_secret());
            }
        }
        if settings.provider == Provider::OpenRouter {
            request = request
                .header("HTTP-Referer", "https://mail.google.com")
                .header("X-Title", "Inbox Triage");
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifyError::Timeout {
                    provider: provider.clone(),
                    seconds: settings.request_timeout.as_secs(),
                }
            } else {
                ClassifyError::Transport {
                    provider: provider.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_else(|_| json!({}));

        if status.as_u16() == 401 {
            return Err(ClassifyError::Credential { provider });
        }
        if status.as_u16() == 429 {
            return Err(ClassifyError::RateLimited { provider });
        }
        if !status.is_success() {
            let detail = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string().chars().take(240).collect());
            return Err(ClassifyError::Http {
                provider,
                status: status.as_u16(),
                detail,
            });
        }

        Ok(body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }
}

/// Whether a 400 body is complaining about strict JSON output mode.
fn rejects_json_mode(error: &ClassifyError) -> bool {
    match error {
        ClassifyError::Http { status: 400, detail, .. } => {
            let detail = detail.to_ascii_lowercase();
            detail.contains("response_format") || detail.contains("json_object")
        }
        _ => false,
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        messages: &[Message],
        settings: &TriageSettings,
    ) -> Result<Vec<TriageVerdict>, ClassifyError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        settings.ensure_ready()?;

        let batch = &messages[..messages.len().min(settings.batch_size)];
        let prompt = build_prompt(batch, settings.max_input_chars);
        let endpoint = format!(
            "{}/chat/completions",
            settings.endpoint_base.trim_end_matches('/')
        );

        debug!(
            provider = settings.provider.as_str(),
            model = %settings.model,
            batch = batch.len(),
            "Requesting classification"
        );

        let mut strict_json = true;
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(&endpoint, settings, &prompt, strict_json).await {
                Ok(text) => {
                    let verdicts = parse_verdicts(&text);
                    info!(
                        verdicts = verdicts.len(),
                        batch = batch.len(),
                        "Classification response parsed"
                    );
                    return Ok(verdicts);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    // Provider refuses strict JSON mode: downgrade once and
                    // go straight into the next attempt without consuming a
                    // retry.
                    if strict_json && rejects_json_mode(&e) {
                        warn!("Provider rejected strict JSON mode — downgrading to plain output");
                        strict_json = false;
                        continue;
                    }
                    if attempt >= settings.retry_count {
                        warn!(error = %e, attempts = attempt + 1, "Classification retries exhausted");
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = settings.retry_backoff_base * attempt;
                    debug!(error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying classification");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
