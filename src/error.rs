//! Error types for the triage engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors — surfaced before a run ever starts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Triage is disabled in settings")]
    Disabled,

    #[error("Triage consent has not been granted")]
    ConsentMissing,

    #[error("Missing API key for provider {provider}")]
    MissingApiKey { provider: String },

    #[error("API key for provider {provider} does not match the expected format ({expected})")]
    MalformedApiKey { provider: String, expected: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Classification client errors.
///
/// Parse failures are NOT here — malformed model output yields zero
/// verdicts, never an error (the run-halt policy owns that case).
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Request to {provider} failed: {reason}")]
    Transport { provider: String, reason: String },

    #[error("Request to {provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("Provider {provider} rejected the request ({status}): {detail}")]
    Http {
        provider: String,
        status: u16,
        detail: String,
    },

    #[error("Authentication failed for provider {provider} — check the API key")]
    Credential { provider: String },

    #[error(
        "Provider {provider} rate limited the request — wait a minute, \
         lower the batch size, or switch to a local provider"
    )]
    RateLimited { provider: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClassifyError {
    /// Whether the retry loop may attempt this request again.
    ///
    /// 401 is a credential problem and retrying cannot help. 429 and all
    /// transport-level failures stay inside the normal retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Credential { .. } | Self::Config(_) => false,
            Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::Http { .. }
            | Self::RateLimited { .. } => true,
        }
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_error_is_not_retryable() {
        let err = ClassifyError::Credential {
            provider: "groq".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_error_is_retryable() {
        let err = ClassifyError::RateLimited {
            provider: "openrouter".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_message_carries_guidance() {
        let err = ClassifyError::RateLimited {
            provider: "openrouter".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch size"));
        assert!(msg.contains("local provider"));
    }

    #[test]
    fn config_errors_wrap_into_classify() {
        let err: ClassifyError = ConfigError::Disabled.into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("disabled"));
    }
}
