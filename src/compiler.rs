//! Workflow compilation.
//!
//! A compile turns a raw task description into a `WorkflowSpec`. When a
//! generation backend is configured the description is sent to it together
//! with the structural constraints; the returned payload is untrusted and goes
//! through `validate_compiled_spec` before anything downstream sees it. Any
//! backend or validation failure drops to `fallback_spec`, which builds a
//! fixed four-step template that satisfies every step-list invariant.

use crate::inputs::{ensure_minimum_inputs, normalize_inputs, parse_input_fields};
use crate::logging::sanitize_log_message;
use crate::providers::{GenerationBackend, StructuredRequest};
use crate::schema::{
    truncate_chars, ExecutionMode, InputField, RecordMode, RecordPayload, StepTool, StepType,
    WorkflowSpec, WorkflowStep, MAX_STEPS, MIN_COMPILED_STEPS,
};
use crate::steps::normalize_steps;
use crate::template::{placeholder_keys, synthesize_template};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

const ONE_LINER_MAX_CHARS: usize = 140;
const DEFAULT_IMAGE_MIME: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub name: String,
    pub record_mode: RecordMode,
    pub record: RecordPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub spec: WorkflowSpec,
    pub mode: ExecutionMode,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("workflow payload does not match the schema: {0}")]
    Malformed(String),
    #[error("workflow payload is missing a one-line summary")]
    MissingOneLiner,
    #[error("workflow payload has {0} steps; expected 1 to 6")]
    StepCount(usize),
    #[error("generation step '{0}' has no prompt template")]
    MissingPromptTemplate(String),
    #[error("step '{0}' has an empty title")]
    MissingTitle(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCompiledSpec {
    one_liner: String,
    #[serde(default)]
    inputs: Vec<InputField>,
    steps: Vec<WorkflowStep>,
}

pub fn build_default_name(candidate: &str) -> String {
    build_default_name_at(candidate, Utc::now())
}

pub fn build_default_name_at(candidate: &str, now: DateTime<Utc>) -> String {
    match candidate.trim() {
        "" => format!("Pilot {}", now.format("%Y-%m-%d %H:%M")),
        name => name.to_string(),
    }
}

pub fn compile_workflow(
    backend: &dyn GenerationBackend,
    request: &CompileRequest,
    locale: &str,
) -> CompileResult {
    if !backend.is_configured() {
        debug!(name = %request.name, "generation backend not configured; using fallback compiler");
        return fallback_result(request);
    }

    let structured = build_structured_request(request, locale);
    match backend.compile(&structured) {
        Ok(payload) => match validate_compiled_spec(payload) {
            Ok(spec) => {
                info!(
                    name = %request.name,
                    steps = spec.steps.len(),
                    inputs = spec.inputs.len(),
                    "compiled workflow with generation backend"
                );
                return CompileResult {
                    spec,
                    mode: ExecutionMode::Generated,
                };
            }
            Err(err) => {
                warn!(name = %request.name, reason = %err, "backend workflow rejected; using fallback compiler");
            }
        },
        Err(err) => {
            warn!(
                name = %request.name,
                retryable = err.is_retryable(),
                reason = %sanitize_log_message(&err.message),
                "backend compile failed; using fallback compiler"
            );
        }
    }

    fallback_result(request)
}

fn fallback_result(request: &CompileRequest) -> CompileResult {
    CompileResult {
        spec: fallback_spec(request),
        mode: ExecutionMode::Fallback,
    }
}

pub fn build_structured_request(request: &CompileRequest, locale: &str) -> StructuredRequest {
    let instructions = format!(
        "You design short, practical workflows (\"pilots\") from a user's task description.\n\
         Return JSON matching the provided schema.\n\
         Rules:\n\
         - Produce between {MIN_COMPILED_STEPS} and {MAX_STEPS} steps, ordered from 1.\n\
         - Exactly one step uses tool \"generation\"; it must carry a promptTemplate. All other steps use tool \"simulated\".\n\
         - At least one step has requiresApproval set to true.\n\
         - Reference inputs inside promptTemplate with {{{{input_key}}}} placeholders.\n\
         - Input keys are lowercase identifiers using letters, digits and underscores.\n\
         - Write titles, descriptions and the oneLiner in locale \"{locale}\"."
    );

    let record = &request.record;
    let mut input = String::new();
    push_section(&mut input, "Pilot name", Some(request.name.as_str()));
    push_section(&mut input, "Record mode", Some(request.record_mode.as_str()));
    push_section(&mut input, "Task description", record.description.as_deref());
    push_section(&mut input, "Prompt", record.prompt.as_deref());
    push_section(&mut input, "Inputs (CSV: key,label,required,placeholder)", record.inputs_csv.as_deref());
    push_section(&mut input, "Example input", record.example_input.as_deref());
    push_section(&mut input, "Example output", record.example_output.as_deref());
    push_section(&mut input, "Capture notes", record.capture_notes.as_deref());

    let image_data_url = match request.record_mode {
        RecordMode::Capture => record.capture_image.as_deref().and_then(image_data_url),
        RecordMode::Describe | RecordMode::Prompt => None,
    };

    StructuredRequest {
        instructions,
        input,
        image_data_url,
        schema: workflow_spec_schema(),
    }
}

fn push_section(buffer: &mut String, title: &str, value: Option<&str>) {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return;
    };
    buffer.push_str(&format!("## {title}\n{value}\n\n"));
}

/// Accepts either a `data:image/...;base64,` URL or bare base64 and returns a
/// data URL, or `None` when the payload is not valid base64.
pub fn image_data_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (mime, encoded) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest.split_once(',')?;
            let mime = meta.strip_suffix(";base64")?;
            if !mime.starts_with("image/") {
                return None;
            }
            (mime, data)
        }
        None => (DEFAULT_IMAGE_MIME, raw),
    };

    let compact = encoded.split_whitespace().collect::<String>();
    if compact.is_empty() || BASE64.decode(compact.as_bytes()).is_err() {
        warn!("capture image is not valid base64; compiling without it");
        return None;
    }
    Some(format!("data:{mime};base64,{compact}"))
}

pub fn workflow_spec_schema() -> Value {
    let step_types = StepType::ALL.map(|t| t.as_str());
    let step_tools = StepTool::ALL.map(|t| t.as_str());
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["oneLiner", "inputs", "steps"],
        "properties": {
            "oneLiner": { "type": "string" },
            "inputs": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["key", "label", "required", "placeholder"],
                    "properties": {
                        "key": { "type": "string" },
                        "label": { "type": "string" },
                        "required": { "type": "boolean" },
                        "placeholder": { "type": ["string", "null"] }
                    }
                }
            },
            "steps": {
                "type": "array",
                "minItems": MIN_COMPILED_STEPS,
                "maxItems": MAX_STEPS,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": [
                        "id", "order", "type", "title", "description",
                        "tool", "requiresApproval", "promptTemplate"
                    ],
                    "properties": {
                        "id": { "type": "string" },
                        "order": { "type": "integer" },
                        "type": { "type": "string", "enum": step_types },
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                        "tool": { "type": "string", "enum": step_tools },
                        "requiresApproval": { "type": "boolean" },
                        "promptTemplate": { "type": ["string", "null"] }
                    }
                }
            }
        }
    })
}

/// Validates an untrusted backend payload and brings it into normal form.
pub fn validate_compiled_spec(payload: Value) -> Result<WorkflowSpec, SpecValidationError> {
    let raw: RawCompiledSpec = serde_json::from_value(payload)
        .map_err(|e| SpecValidationError::Malformed(e.to_string()))?;

    let one_liner = raw.one_liner.trim().to_string();
    if one_liner.is_empty() {
        return Err(SpecValidationError::MissingOneLiner);
    }
    if raw.steps.is_empty() || raw.steps.len() > MAX_STEPS {
        return Err(SpecValidationError::StepCount(raw.steps.len()));
    }
    for step in &raw.steps {
        if step.title.trim().is_empty() {
            return Err(SpecValidationError::MissingTitle(step.id.clone()));
        }
        let has_template = step
            .prompt_template
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if step.is_generation() && !has_template {
            return Err(SpecValidationError::MissingPromptTemplate(step.id.clone()));
        }
    }

    Ok(WorkflowSpec {
        one_liner,
        inputs: normalize_inputs(raw.inputs),
        steps: normalize_steps(raw.steps),
    })
}

pub fn fallback_spec(request: &CompileRequest) -> WorkflowSpec {
    let record = &request.record;
    let inputs = ensure_minimum_inputs(parse_input_fields(
        record.inputs_csv.as_deref().unwrap_or_default(),
    ));
    let one_liner = derive_one_liner(&request.name, record);
    let labels = inputs
        .iter()
        .map(|field| field.label.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let processing = match request.record_mode {
        RecordMode::Capture => "Interpret the captured screen and notes against the inputs.",
        RecordMode::Describe => "Organise the described task and examples into a working brief.",
        RecordMode::Prompt => "Apply the supplied prompt instructions to the inputs.",
    };

    let steps = vec![
        simulated_step(1, StepType::Trigger, "Collect inputs", &format!("Gather: {labels}."), false),
        simulated_step(2, StepType::Action, "Prepare the material", processing, false),
        simulated_step(
            3,
            StepType::Condition,
            "Review before generating",
            "Confirm the prepared material before the result is generated.",
            true,
        ),
        WorkflowStep {
            id: "step_4".to_string(),
            order: 4,
            step_type: StepType::Output,
            title: "Generate the result".to_string(),
            description: "Produce the final text from the reviewed material.".to_string(),
            tool: StepTool::Generation,
            requires_approval: false,
            prompt_template: Some(fallback_template(request, &one_liner, &inputs)),
        },
    ];

    WorkflowSpec {
        one_liner,
        inputs,
        steps,
    }
}

fn simulated_step(
    order: u32,
    step_type: StepType,
    title: &str,
    description: &str,
    requires_approval: bool,
) -> WorkflowStep {
    WorkflowStep {
        id: format!("step_{order}"),
        order,
        step_type,
        title: title.to_string(),
        description: description.to_string(),
        tool: StepTool::Simulated,
        requires_approval,
        prompt_template: None,
    }
}

fn fallback_template(request: &CompileRequest, one_liner: &str, inputs: &[InputField]) -> String {
    let record = &request.record;
    let user_prompt = record
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty() && request.record_mode == RecordMode::Prompt);

    let mut template = match user_prompt {
        Some(prompt) => {
            let referenced = placeholder_keys(prompt);
            let missing = inputs
                .iter()
                .filter(|field| !referenced.contains(&field.key))
                .cloned()
                .collect::<Vec<_>>();
            if missing.is_empty() {
                prompt.to_string()
            } else {
                format!("{prompt}\n\n{}", synthesize_template("", &missing))
            }
        }
        None => synthesize_template(one_liner, inputs),
    };

    if let Some(example) = record
        .example_output
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        template.push_str(&format!("\nMatch the format of this example output:\n{example}\n"));
    }
    template
}

fn derive_one_liner(name: &str, record: &RecordPayload) -> String {
    let candidates = [
        record.prompt.as_deref(),
        record.description.as_deref(),
        record.example_output.as_deref(),
        record.capture_notes.as_deref(),
    ];
    candidates
        .into_iter()
        .flatten()
        .flat_map(str::lines)
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| truncate_chars(line, ONE_LINER_MAX_CHARS))
        .unwrap_or_else(|| format!("Run \"{}\" on the provided inputs.", name.trim()))
}
