//! Triage settings — provider selection, validation, and persistence.
//!
//! Settings are persisted as one whole JSON object under a single kv key and
//! merged over defaults on load, so a partially-written or older settings
//! blob can never leave the engine with out-of-range values: everything is
//! re-clamped on the way in.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, StoreError};
use crate::store::StateBackend;

/// kv key holding the persisted settings object.
pub const SETTINGS_KEY: &str = "triage_settings_v1";

/// Models accepted on Groq's free tier. Anything else is snapped to the
/// first entry.
pub const GROQ_FREE_MODELS: [&str; 4] = [
    "llama-3.1-8b-instant",
    "llama-3.3-70b-versatile",
    "meta-llama/llama-4-scout-17b-16e-instruct",
    "meta-llama/llama-4-maverick-17b-128e-instruct",
];

// ── Providers ───────────────────────────────────────────────────────

/// Supported classification providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hosted, key required, base URL and model pinned to the free route.
    OpenRouter,
    /// Hosted, key required, constrained free model list.
    Groq,
    /// Local, unauthenticated.
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }

    /// Case-insensitive parse, defaulting to OpenRouter for unknown input
    /// (mirrors the stored-settings merge behavior).
    pub fn parse_or_default(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "groq" => Self::Groq,
            "ollama" => Self::Ollama,
            _ => Self::OpenRouter,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter/free",
            Self::Groq => GROQ_FREE_MODELS[0],
            Self::Ollama => "llama3.1",
        }
    }

    /// Expected key shape: (pattern, human-readable description).
    fn key_format(&self) -> Option<(&'static Regex, &'static str)> {
        static OPENROUTER_KEY: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^sk-or-[A-Za-z0-9_-]{8,}$").expect("key pattern is valid")
        });
        static GROQ_KEY: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^gsk_[A-Za-z0-9]{8,}$").expect("key pattern is valid")
        });
        match self {
            Self::OpenRouter => Some((&OPENROUTER_KEY, "sk-or-…")),
            Self::Groq => Some((&GROQ_KEY, "gsk_…")),
            Self::Ollama => None,
        }
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Engine configuration.
///
/// Construct via `Default` + field updates or `from_env`, then call
/// `normalized()` — every load/save path goes through normalization.
#[derive(Debug, Clone)]
pub struct TriageSettings {
    pub provider: Provider,
    pub endpoint_base: String,
    pub model: String,
    /// API key for hosted providers. Kept secret in memory; exposed only at
    /// request-build and persistence boundaries.
    pub api_key: Option<SecretString>,
    /// Messages per classification request. Clamped to [1, 100].
    pub batch_size: usize,
    /// Hard per-request timeout. Clamped to [5s, 120s].
    pub request_timeout: Duration,
    /// Extra attempts after the first failure. Clamped to [0, 5].
    pub retry_count: u32,
    /// Linear backoff base (`base * attempt_number`). Clamped to [200ms, 20s].
    pub retry_backoff_base: Duration,
    /// Per-field truncation limit for free text. Clamped to [400, 10000].
    pub max_input_chars: usize,
    pub enabled: bool,
    pub consent_granted: bool,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            provider: Provider::OpenRouter,
            endpoint_base: Provider::OpenRouter.default_endpoint().to_string(),
            model: Provider::OpenRouter.default_model().to_string(),
            api_key: None,
            batch_size: 25,
            request_timeout: Duration::from_secs(30),
            retry_count: 2,
            retry_backoff_base: Duration::from_millis(1200),
            max_input_chars: 2200,
            enabled: true,
            consent_granted: false,
        }
    }
}

fn clamp<T: Ord>(value: T, min: T, max: T) -> T {
    value.max(min).min(max)
}

impl TriageSettings {
    /// Clamp numeric fields and apply provider pinning rules.
    ///
    /// OpenRouter is pinned to its free route entirely; Groq pins the base
    /// URL and snaps the model onto the free list; Ollama keeps whatever the
    /// user entered, falling back to defaults for blanks.
    pub fn normalized(mut self) -> Self {
        let defaults = TriageSettings::default();

        self.endpoint_base = self.endpoint_base.trim().to_string();
        self.model = self.model.trim().to_string();
        self.api_key = self.api_key.and_then(|k| {
            let trimmed = k.expose_secret().trim().to_string();
            (!trimmed.is_empty()).then(|| SecretString::from(trimmed))
        });

        self.batch_size = clamp(
            if self.batch_size == 0 {
                defaults.batch_size
            } else {
                self.batch_size
            },
            1,
            100,
        );
        self.request_timeout = clamp(
            self.request_timeout,
            Duration::from_secs(5),
            Duration::from_secs(120),
        );
        self.retry_count = clamp(self.retry_count, 0, 5);
        self.retry_backoff_base = clamp(
            self.retry_backoff_base,
            Duration::from_millis(200),
            Duration::from_secs(20),
        );
        self.max_input_chars = clamp(
            if self.max_input_chars == 0 {
                defaults.max_input_chars
            } else {
                self.max_input_chars
            },
            400,
            10_000,
        );

        match self.provider {
            Provider::OpenRouter => {
                self.endpoint_base = Provider::OpenRouter.default_endpoint().to_string();
                self.model = Provider::OpenRouter.default_model().to_string();
            }
            Provider::Groq => {
                self.endpoint_base = Provider::Groq.default_endpoint().to_string();
                if !GROQ_FREE_MODELS.contains(&self.model.as_str()) {
                    self.model = Provider::Groq.default_model().to_string();
                }
            }
            Provider::Ollama => {
                if self.endpoint_base.is_empty() {
                    self.endpoint_base = Provider::Ollama.default_endpoint().to_string();
                }
                if self.model.is_empty() {
                    self.model = Provider::Ollama.default_model().to_string();
                }
            }
        }

        self
    }

    /// Gate check: classification may run only when enabled, consented, and
    /// (for key-required providers) holding a key in the expected format.
    pub fn ensure_ready(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }
        if !self.consent_granted {
            return Err(ConfigError::ConsentMissing);
        }
        if let Some((re, expected)) = self.provider.key_format() {
            let key = self.api_key.as_ref().ok_or_else(|| ConfigError::MissingApiKey {
                provider: self.provider.as_str().to_string(),
            })?;
            if !re.is_match(key.expose_secret()) {
                return Err(ConfigError::MalformedApiKey {
                    provider: self.provider.as_str().to_string(),
                    expected: expected.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Build settings from environment variables (binary entry point).
    ///
    /// `TRIAGE_PROVIDER`, `TRIAGE_API_KEY`, `TRIAGE_MODEL`, `TRIAGE_ENDPOINT`
    /// override defaults; consent is implied by running the binary.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(provider) = std::env::var("TRIAGE_PROVIDER") {
            settings.provider = Provider::parse_or_default(&provider);
            settings.endpoint_base = settings.provider.default_endpoint().to_string();
            settings.model = settings.provider.default_model().to_string();
        }
        if let Ok(endpoint) = std::env::var("TRIAGE_ENDPOINT") {
            settings.endpoint_base = endpoint;
        }
        if let Ok(model) = std::env::var("TRIAGE_MODEL") {
            settings.model = model;
        }
        if let Ok(key) = std::env::var("TRIAGE_API_KEY") {
            settings.api_key = Some(SecretString::from(key));
        }
        settings.consent_granted = true;
        settings.normalized()
    }
}

// ── Persistence ─────────────────────────────────────────────────────

/// Flat wire form of the settings object.
///
/// Durations are stored in milliseconds, matching the numeric-field layout
/// the presentation layer edits. Every field defaults independently, so a
/// partial blob (say, one written before a field existed) merges over the
/// defaults instead of discarding the whole object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct StoredSettings {
    provider: Provider,
    endpoint_base: String,
    model: String,
    api_key: String,
    batch_size: usize,
    timeout_ms: u64,
    retry_count: u32,
    retry_backoff_ms: u64,
    max_input_chars: usize,
    enabled: bool,
    consent_granted: bool,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self::from(&TriageSettings::default())
    }
}

impl From<&TriageSettings> for StoredSettings {
    fn from(s: &TriageSettings) -> Self {
        Self {
            provider: s.provider,
            endpoint_base: s.endpoint_base.clone(),
            model: s.model.clone(),
            api_key: s
                .api_key
                .as_ref()
                .map(|k| k.expose_secret().to_string())
                .unwrap_or_default(),
            batch_size: s.batch_size,
            timeout_ms: s.request_timeout.as_millis() as u64,
            retry_count: s.retry_count,
            retry_backoff_ms: s.retry_backoff_base.as_millis() as u64,
            max_input_chars: s.max_input_chars,
            enabled: s.enabled,
            consent_granted: s.consent_granted,
        }
    }
}

impl From<StoredSettings> for TriageSettings {
    fn from(s: StoredSettings) -> Self {
        Self {
            provider: s.provider,
            endpoint_base: s.endpoint_base,
            model: s.model,
            api_key: (!s.api_key.is_empty()).then(|| SecretString::from(s.api_key)),
            batch_size: s.batch_size,
            request_timeout: Duration::from_millis(s.timeout_ms),
            retry_count: s.retry_count,
            retry_backoff_base: Duration::from_millis(s.retry_backoff_ms),
            max_input_chars: s.max_input_chars,
            enabled: s.enabled,
            consent_granted: s.consent_granted,
        }
        .normalized()
    }
}

/// Load settings from the backend, merging over defaults and re-validating.
/// A missing or unreadable blob yields defaults.
pub async fn load_settings(backend: &Arc<dyn StateBackend>) -> Result<TriageSettings, StoreError> {
    match backend.read_key(SETTINGS_KEY).await? {
        Some(raw) => match serde_json::from_str::<StoredSettings>(&raw) {
            Ok(stored) => Ok(stored.into()),
            Err(e) => {
                debug!(error = %e, "Stored settings unreadable — using defaults");
                Ok(TriageSettings::default())
            }
        },
        None => Ok(TriageSettings::default()),
    }
}

/// Persist settings as one whole-object replacement.
pub async fn save_settings(
    backend: &Arc<dyn StateBackend>,
    settings: &TriageSettings,
) -> Result<TriageSettings, StoreError> {
    let normalized = settings.clone().normalized();
    let raw = serde_json::to_string(&StoredSettings::from(&normalized))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    backend.write_key(SETTINGS_KEY, &raw).await?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    #[test]
    fn defaults_are_openrouter_free() {
        let s = TriageSettings::default();
        assert_eq!(s.provider, Provider::OpenRouter);
        assert_eq!(s.endpoint_base, "https://openrouter.ai/api/v1");
        assert_eq!(s.model, "openrouter/free");
        assert!(s.enabled);
        assert!(!s.consent_granted);
    }

    #[test]
    fn normalization_clamps_numeric_fields() {
        let s = TriageSettings {
            batch_size: 500,
            request_timeout: Duration::from_secs(1),
            retry_count: 99,
            retry_backoff_base: Duration::from_millis(1),
            max_input_chars: 50,
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.request_timeout, Duration::from_secs(5));
        assert_eq!(s.retry_count, 5);
        assert_eq!(s.retry_backoff_base, Duration::from_millis(200));
        assert_eq!(s.max_input_chars, 400);
    }

    #[test]
    fn normalization_pins_openrouter_route() {
        let s = TriageSettings {
            endpoint_base: "https://example.com/v1".into(),
            model: "gpt-4o".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.endpoint_base, "https://openrouter.ai/api/v1");
        assert_eq!(s.model, "openrouter/free");
    }

    #[test]
    fn normalization_snaps_groq_model_to_free_list() {
        let s = TriageSettings {
            provider: Provider::Groq,
            model: "gpt-4o".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.model, GROQ_FREE_MODELS[0]);

        let kept = TriageSettings {
            provider: Provider::Groq,
            model: GROQ_FREE_MODELS[1].into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(kept.model, GROQ_FREE_MODELS[1]);
    }

    #[test]
    fn ollama_keeps_user_endpoint() {
        let s = TriageSettings {
            provider: Provider::Ollama,
            endpoint_base: "http://127.0.0.1:9999/v1".into(),
            model: String::new(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.endpoint_base, "http://127.0.0.1:9999/v1");
        assert_eq!(s.model, "llama3.1");
    }

    fn consented(provider: Provider, key: Option<&str>) -> TriageSettings {
        TriageSettings {
            provider,
            api_key: key.map(SecretString::from),
            consent_granted: true,
            ..Default::default()
        }
        .normalized()
    }

    #[test]
    fn gate_requires_enabled_and_consent() {
        let disabled = TriageSettings {
            enabled: false,
            consent_granted: true,
            ..Default::default()
        };
        assert!(matches!(disabled.ensure_ready(), Err(ConfigError::Disabled)));

        let unconsented = TriageSettings::default();
        assert!(matches!(
            unconsented.ensure_ready(),
            Err(ConfigError::ConsentMissing)
        ));
    }

    #[test]
    fn gate_checks_key_presence_and_format() {
        assert!(matches!(
            consented(Provider::OpenRouter, None).ensure_ready(),
            Err(ConfigError::MissingApiKey { .. })
        ));
        assert!(matches!(
            consented(Provider::OpenRouter, Some("sk-wrong")).ensure_ready(),
            Err(ConfigError::MalformedApiKey { .. })
        ));
        assert!(consented(Provider::OpenRouter, Some("sk-or-abcdefgh123"))
            .ensure_ready()
            .is_ok());
        assert!(matches!(
            consented(Provider::Groq, Some("sk-or-abcdefgh123")).ensure_ready(),
            Err(ConfigError::MalformedApiKey { .. })
        ));
        assert!(consented(Provider::Groq, Some("gsk_abcDEF12345"))
            .ensure_ready()
            .is_ok());
    }

    #[test]
    fn ollama_needs_no_key() {
        assert!(consented(Provider::Ollama, None).ensure_ready().is_ok());
    }

    #[tokio::test]
    async fn settings_round_trip_through_backend() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let original = TriageSettings {
            provider: Provider::Groq,
            api_key: Some(SecretString::from("gsk_abcDEF12345")),
            batch_size: 10,
            consent_granted: true,
            ..Default::default()
        };
        save_settings(&backend, &original).await.unwrap();

        let loaded = load_settings(&backend).await.unwrap();
        assert_eq!(loaded.provider, Provider::Groq);
        assert_eq!(loaded.batch_size, 10);
        assert!(loaded.consent_granted);
        assert_eq!(
            loaded.api_key.unwrap().expose_secret(),
            "gsk_abcDEF12345"
        );
    }

    #[tokio::test]
    async fn missing_settings_yield_defaults() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let loaded = load_settings(&backend).await.unwrap();
        assert_eq!(loaded.provider, Provider::OpenRouter);
        assert!(!loaded.consent_granted);
    }

    #[tokio::test]
    async fn partial_settings_blob_merges_over_defaults() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        backend
            .write_key(
                SETTINGS_KEY,
                r#"{"provider":"groq","api_key":"gsk_abcDEF12345","consent_granted":true}"#,
            )
            .await
            .unwrap();

        let loaded = load_settings(&backend).await.unwrap();
        assert_eq!(loaded.provider, Provider::Groq);
        assert_eq!(
            loaded.api_key.as_ref().unwrap().expose_secret(),
            "gsk_abcDEF12345"
        );
        assert!(loaded.consent_granted);
        // Missing fields come from the defaults, not from a reset.
        assert_eq!(loaded.batch_size, 25);
        assert_eq!(loaded.request_timeout, Duration::from_secs(30));
        assert_eq!(loaded.model, GROQ_FREE_MODELS[0]);
    }

    #[tokio::test]
    async fn corrupt_settings_blob_falls_back_to_defaults() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        backend.write_key(SETTINGS_KEY, "not json").await.unwrap();
        let loaded = load_settings(&backend).await.unwrap();
        assert_eq!(loaded.batch_size, 25);
    }
}
