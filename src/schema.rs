use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_STEPS: usize = 6;
pub const MIN_COMPILED_STEPS: usize = 4;
pub const INITIAL_CREDITS: i64 = 50;
pub const RUN_LOG_LIMIT: usize = 200;
pub const OUTPUT_PREVIEW_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    Capture,
    Describe,
    Prompt,
}

impl RecordMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Describe => "describe",
            Self::Prompt => "prompt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "capture" => Some(Self::Capture),
            "describe" => Some(Self::Describe),
            "prompt" => Some(Self::Prompt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Trigger,
    Action,
    Condition,
    Output,
}

impl StepType {
    pub const ALL: [StepType; 4] = [Self::Trigger, Self::Action, Self::Condition, Self::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Output => "output",
        }
    }
}

/// Which executor a step is assigned to. Only one step per pilot may use the
/// generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTool {
    Generation,
    Simulated,
}

impl StepTool {
    pub const ALL: [StepTool; 2] = [Self::Generation, Self::Simulated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputField {
    pub key: String,
    pub label: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(default)]
    pub id: String,
    pub order: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub tool: StepTool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

impl WorkflowStep {
    pub fn is_generation(&self) -> bool {
        self.tool == StepTool::Generation
    }
}

/// Raw task description captured by the builder UI. Which fields are filled
/// depends on the record mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub one_liner: String,
    pub inputs: Vec<InputField>,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pilot {
    pub id: String,
    pub name: String,
    pub one_liner: String,
    pub record_mode: RecordMode,
    pub record: RecordPayload,
    pub inputs: Vec<InputField>,
    pub steps: Vec<WorkflowStep>,
    pub credits: i64,
    pub version: i64,
    pub created_at_ms: i64,
}

impl Pilot {
    pub fn generation_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.is_generation())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub id: String,
    pub pilot_id: String,
    pub created_at_ms: i64,
    pub input_values: BTreeMap<String, String>,
    pub output_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    pub status: RunStatus,
}

/// Which path produced a compile or run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Generated,
    Fallback,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Fallback => "fallback",
        }
    }
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect::<String>()
}
