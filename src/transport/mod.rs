mod mock;
mod openai_http;

pub use mock::MockTransport;
pub use openai_http::OpenAiHttpTransport;

use crate::providers::types::{ProviderError, ProviderRequest, ProviderResponse};

pub trait ExecutionTransport: Send + Sync {
    fn dispatch(
        &self,
        request: &ProviderRequest,
        api_key: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError>;

    fn requires_api_key(&self) -> bool {
        false
    }
}
