use crate::providers::types::{ProviderError, ProviderRequest, ProviderResponse, ProviderUsage};
use crate::transport::ExecutionTransport;
use serde_json::json;

const SIMULATE_FAILURE: &str = "simulate_provider_failure";
const SIMULATE_INVALID_SPEC: &str = "simulate_invalid_spec";

/// Offline transport with deterministic output. Inputs containing
/// `simulate_provider_failure` fail; structured requests containing
/// `simulate_invalid_spec` return a payload that fails validation.
pub struct MockTransport;

impl MockTransport {
    pub fn new() -> Self {
        Self
    }

    fn structured_text(request: &ProviderRequest) -> String {
        if request.input.contains(SIMULATE_INVALID_SPEC) {
            return json!({ "oneLiner": "", "inputs": [], "steps": "not a list" }).to_string();
        }

        json!({
            "oneLiner": "Turn the pasted source text into a reviewed draft.",
            "inputs": [
                { "key": "source_text", "label": "Source text", "required": true }
            ],
            "steps": [
                {
                    "id": "step_1", "order": 1, "type": "trigger",
                    "title": "Receive source text", "description": "Collect the pasted text.",
                    "tool": "simulated", "requiresApproval": false
                },
                {
                    "id": "step_2", "order": 2, "type": "action",
                    "title": "Outline key points", "description": "Group the text into key points.",
                    "tool": "simulated", "requiresApproval": false
                },
                {
                    "id": "step_3", "order": 3, "type": "condition",
                    "title": "Review outline", "description": "Confirm the outline before drafting.",
                    "tool": "simulated", "requiresApproval": true
                },
                {
                    "id": "step_4", "order": 4, "type": "output",
                    "title": "Write draft", "description": "Write the final draft.",
                    "tool": "generation", "requiresApproval": false,
                    "promptTemplate": "Write a reviewed draft from:\n{{source_text}}"
                }
            ]
        })
        .to_string()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTransport for MockTransport {
    fn dispatch(
        &self,
        request: &ProviderRequest,
        _api_key: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        if request.input.contains(SIMULATE_FAILURE) {
            return Err(ProviderError::retryable(
                "Mock provider is temporarily unavailable.",
            ));
        }

        let text = match request.response_schema {
            Some(_) => Self::structured_text(request),
            None => {
                let excerpt = request.input.chars().take(120).collect::<String>();
                format!("Mock result\n\n{excerpt}")
            }
        };

        let input_tokens = request.input.split_whitespace().count() as u32;
        let output_tokens = text.split_whitespace().count() as u32;
        Ok(ProviderResponse {
            provider_kind: request.provider_kind,
            model: request.model.clone(),
            text,
            usage: ProviderUsage {
                input_tokens,
                output_tokens,
                total_tokens: Some(u64::from(input_tokens) + u64::from(output_tokens)),
            },
        })
    }
}
