use crate::config::{AppConfig, TransportMode};
use crate::providers::types::{
    Generation, ProviderError, ProviderKind, ProviderRequest, ProviderResponse, StructuredRequest,
};
use crate::providers::GenerationBackend;
use crate::transport::{ExecutionTransport, MockTransport, OpenAiHttpTransport};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const COMPILE_MAX_OUTPUT_TOKENS: u32 = 2_000;
const RUN_MAX_OUTPUT_TOKENS: u32 = 1_500;

/// Generation backend backed by a configurable transport. A runtime without a
/// transport (or without the key its transport needs) reports itself as
/// unconfigured, which routes compile and run to their fallbacks.
pub struct ProviderRuntime {
    transport: Option<Arc<dyn ExecutionTransport>>,
    provider_kind: ProviderKind,
    api_key: Option<String>,
    model: String,
}

impl ProviderRuntime {
    pub fn from_config(config: &AppConfig) -> Self {
        let (transport, provider_kind) = match config.transport {
            TransportMode::None => (None, ProviderKind::OpenAi),
            TransportMode::Mock => (
                Some(Arc::new(MockTransport::new()) as Arc<dyn ExecutionTransport>),
                ProviderKind::Mock,
            ),
            TransportMode::OpenAi => (
                Some(Arc::new(OpenAiHttpTransport::new(&config.base_url)) as Arc<dyn ExecutionTransport>),
                ProviderKind::OpenAi,
            ),
        };
        Self {
            transport,
            provider_kind,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }

    pub fn with_transport(
        transport: Arc<dyn ExecutionTransport>,
        provider_kind: ProviderKind,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            transport: Some(transport),
            provider_kind,
            api_key,
            model: model.into(),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            transport: None,
            provider_kind: ProviderKind::OpenAi,
            api_key: None,
            model: String::new(),
        }
    }

    fn dispatch(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(ProviderError::not_configured)?;
        let response = transport.dispatch(&request, self.api_key.as_deref())?;
        debug!(
            provider = response.provider_kind.as_str(),
            model = %response.model,
            correlation_id = request.correlation_id.as_deref().unwrap_or("-"),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "provider call finished"
        );
        Ok(response)
    }

    fn request(&self, input: String, max_output_tokens: u32) -> ProviderRequest {
        ProviderRequest {
            provider_kind: self.provider_kind,
            model: self.model.clone(),
            instructions: None,
            input,
            image_data_url: None,
            response_schema: None,
            max_output_tokens: Some(max_output_tokens),
            correlation_id: None,
        }
    }
}

impl GenerationBackend for ProviderRuntime {
    fn is_configured(&self) -> bool {
        match self.transport.as_ref() {
            None => false,
            Some(transport) if transport.requires_api_key() => self
                .api_key
                .as_deref()
                .map(|key| !key.trim().is_empty())
                .unwrap_or(false),
            Some(_) => true,
        }
    }

    fn compile(&self, request: &StructuredRequest) -> Result<Value, ProviderError> {
        let mut provider_request = self.request(request.input.clone(), COMPILE_MAX_OUTPUT_TOKENS);
        provider_request.instructions = Some(request.instructions.clone());
        provider_request.image_data_url = request.image_data_url.clone();
        provider_request.response_schema = Some(request.schema.clone());
        provider_request.correlation_id = Some("compile".to_string());

        let response = self.dispatch(provider_request)?;
        serde_json::from_str::<Value>(response.text.trim())
            .map_err(|_| ProviderError::non_retryable("Provider returned a malformed workflow payload."))
    }

    fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let mut provider_request = self.request(prompt.to_string(), RUN_MAX_OUTPUT_TOKENS);
        provider_request.correlation_id = Some("run".to_string());

        let response = self.dispatch(provider_request)?;
        Ok(Generation {
            text: response.text,
            total_tokens: response.usage.total_tokens,
        })
    }
}
