use crate::logging::sanitize_log_message;
use crate::providers::GenerationBackend;
use crate::schema::{ExecutionMode, Pilot};
use crate::template::{render_template, synthesize_template};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const NEXT_STEPS: [&str; 3] = [
    "Review the inputs above and fill in anything that is missing.",
    "Connect a generation backend to produce the full result.",
    "Run the pilot again once the inputs are final.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub output: String,
    pub total_tokens: Option<u64>,
    pub mode: ExecutionMode,
}

/// The prompt a run would send, with every `{{key}}` replaced.
pub fn render_prompt(pilot: &Pilot, values: &BTreeMap<String, String>) -> String {
    let template = pilot
        .generation_step()
        .and_then(|step| step.prompt_template.as_deref())
        .filter(|template| !template.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| synthesize_template(&pilot.one_liner, &pilot.inputs));
    render_template(&template, values)
}

/// Executes a pilot once. Never fails: backend errors and empty completions
/// drop to the markdown fallback.
pub fn run_workflow(
    backend: &dyn GenerationBackend,
    pilot: &Pilot,
    values: &BTreeMap<String, String>,
) -> RunOutput {
    if backend.is_configured() {
        let prompt = render_prompt(pilot, values);
        match backend.generate(&prompt) {
            Ok(generation) if !generation.text.trim().is_empty() => {
                return RunOutput {
                    output: generation.text,
                    total_tokens: generation.total_tokens,
                    mode: ExecutionMode::Generated,
                };
            }
            Ok(_) => warn!(pilot_id = %pilot.id, "backend returned an empty completion; using fallback"),
            Err(err) => warn!(
                pilot_id = %pilot.id,
                retryable = err.is_retryable(),
                reason = %sanitize_log_message(&err.message),
                "backend generation failed; using fallback"
            ),
        }
    } else {
        debug!(pilot_id = %pilot.id, "generation backend not configured; using fallback");
    }

    RunOutput {
        output: fallback_report(pilot, values),
        total_tokens: None,
        mode: ExecutionMode::Fallback,
    }
}

pub fn fallback_report(pilot: &Pilot, values: &BTreeMap<String, String>) -> String {
    let mut report = format!("# {}\n\n", pilot.name.trim());
    if !pilot.one_liner.trim().is_empty() {
        report.push_str(&format!("{}\n\n", pilot.one_liner.trim()));
    }

    report.push_str("## Inputs\n");
    for field in &pilot.inputs {
        let value = values
            .get(&field.key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or("(empty)");
        report.push_str(&format!("- {}: {}\n", field.label, value));
    }

    report.push_str("\n## Suggested next steps\n");
    for (index, step) in NEXT_STEPS.iter().enumerate() {
        report.push_str(&format!("{}. {}\n", index + 1, step));
    }
    report
}
