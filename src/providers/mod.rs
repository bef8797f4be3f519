pub mod runtime;
pub mod types;

pub use runtime::ProviderRuntime;
pub use types::{
    Generation, ProviderError, ProviderKind, ProviderRequest, ProviderResponse, ProviderUsage,
    StructuredRequest,
};

use serde_json::Value;

/// Port to the text/structured-output generation service used by compile and
/// run. Failures are values, never panics; callers branch to their
/// deterministic fallback on `Err`.
pub trait GenerationBackend: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Returns the backend's structured payload as untrusted JSON. Callers
    /// must validate it before use.
    fn compile(&self, request: &StructuredRequest) -> Result<Value, ProviderError>;

    fn generate(&self, prompt: &str) -> Result<Generation, ProviderError>;
}
