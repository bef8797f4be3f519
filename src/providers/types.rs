use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider_kind: ProviderKind,
    pub model: String,
    pub instructions: Option<String>,
    pub input: String,
    pub image_data_url: Option<String>,
    /// JSON schema the response text must satisfy. `None` means free text.
    pub response_schema: Option<Value>,
    pub max_output_tokens: Option<u32>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider_kind: ProviderKind,
    pub model: String,
    pub text: String,
    pub usage: ProviderUsage,
}

/// Structured compile request handed to the generation backend.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub instructions: String,
    pub input: String,
    pub image_data_url: Option<String>,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn not_configured() -> Self {
        Self::non_retryable("Generation backend is not configured.")
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Retryable)
    }
}
