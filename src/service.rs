//! Request-scoped facade over the compile, edit and run pipeline.
//!
//! `PilotService` owns nothing but handles to a store and a generation
//! backend, so it can be shared across threads behind an `Arc`. Not-found and
//! out-of-credit conditions come back as outcome variants; only storage
//! failures and caller mistakes are errors.

use crate::compiler::{build_default_name, compile_workflow, CompileRequest};
use crate::config::AppConfig;
use crate::ids::{make_id, now_ms};
use crate::inputs::normalize_inputs;
use crate::logging::sanitize_log_message;
use crate::providers::{GenerationBackend, ProviderRuntime};
use crate::retention;
use crate::run_engine::run_workflow;
use crate::schema::{
    truncate_chars, ExecutionMode, InputField, Pilot, RunLog, RunStatus, WorkflowStep,
    INITIAL_CREDITS, OUTPUT_PREVIEW_MAX_CHARS, RUN_LOG_LIMIT,
};
use crate::steps::normalize_steps;
use crate::store::{CommitOutcome, MemoryStore, PilotStore, SqliteStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("missing required inputs: {}", .0.join(", "))]
    MissingRequiredInputs(Vec<String>),
    #[error("invalid pilot update: {0}")]
    InvalidPatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPilot {
    pub pilot: Pilot,
    pub mode: ExecutionMode,
}

/// Editor changes. `None` leaves a field as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PilotPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub one_liner: Option<String>,
    #[serde(default)]
    pub inputs: Option<Vec<InputField>>,
    #[serde(default)]
    pub steps: Option<Vec<WorkflowStep>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub output: String,
    pub total_tokens: Option<u64>,
    pub mode: ExecutionMode,
    pub credits_left: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    NotFound,
    InsufficientCredits,
}

pub struct PilotService {
    store: Arc<dyn PilotStore>,
    backend: Arc<dyn GenerationBackend>,
    locale: String,
}

impl PilotService {
    pub fn new(
        store: Arc<dyn PilotStore>,
        backend: Arc<dyn GenerationBackend>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            store,
            backend,
            locale: locale.into(),
        }
    }

    /// SQLite when a database path is configured, otherwise an in-memory
    /// store.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let store: Arc<dyn PilotStore> = match config.db_path.as_deref() {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let backend = Arc::new(ProviderRuntime::from_config(config));
        info!(
            transport = ?config.transport,
            persistent = config.db_path.is_some(),
            configured = backend.is_configured(),
            "pilot service ready"
        );
        Ok(Self::new(store, backend, config.locale.clone()))
    }

    pub fn create_pilot(&self, request: CompileRequest) -> Result<CreatedPilot, ServiceError> {
        let request = CompileRequest {
            name: build_default_name(&request.name),
            ..request
        };
        let compiled = compile_workflow(self.backend.as_ref(), &request, &self.locale);

        let pilot = Pilot {
            id: make_id("pilot"),
            name: request.name,
            one_liner: compiled.spec.one_liner,
            record_mode: request.record_mode,
            record: request.record,
            inputs: compiled.spec.inputs,
            steps: compiled.spec.steps,
            credits: INITIAL_CREDITS,
            version: 1,
            created_at_ms: now_ms(),
        };
        self.store.create_pilot(&pilot)?;
        info!(pilot_id = %pilot.id, mode = compiled.mode.as_str(), "pilot created");

        Ok(CreatedPilot {
            pilot,
            mode: compiled.mode,
        })
    }

    pub fn get_pilot(&self, pilot_id: &str) -> Result<Option<Pilot>, ServiceError> {
        Ok(self.store.get_pilot(pilot_id)?)
    }

    pub fn list_pilots(&self) -> Result<Vec<Pilot>, ServiceError> {
        Ok(self.store.list_pilots()?)
    }

    pub fn update_pilot(
        &self,
        pilot_id: &str,
        patch: PilotPatch,
    ) -> Result<Option<Pilot>, ServiceError> {
        if matches!(patch.steps.as_deref(), Some([])) {
            return Err(ServiceError::InvalidPatch(
                "a pilot needs at least one step".to_string(),
            ));
        }
        let Some(mut pilot) = self.store.get_pilot(pilot_id)? else {
            return Ok(None);
        };

        if let Some(name) = patch.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            pilot.name = name.to_string();
        }
        if let Some(one_liner) = patch.one_liner {
            pilot.one_liner = one_liner.trim().to_string();
        }
        if let Some(inputs) = patch.inputs {
            pilot.inputs = normalize_inputs(inputs);
        }
        if let Some(steps) = patch.steps {
            pilot.steps = normalize_steps(steps);
        }

        // The store bumps the version and returns the row as written.
        let Some(updated) = self.store.update_pilot(&pilot)? else {
            return Ok(None);
        };
        info!(pilot_id, version = updated.version, "pilot updated");
        Ok(Some(updated))
    }

    pub fn run_pilot(
        &self,
        pilot_id: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<RunOutcome, ServiceError> {
        retention::cleanup(self.store.as_ref(), now_ms());

        let Some(pilot) = self.store.get_pilot(pilot_id)? else {
            return Ok(RunOutcome::NotFound);
        };
        if pilot.credits <= 0 {
            return Ok(RunOutcome::InsufficientCredits);
        }

        let values = trim_values(values);
        let missing = missing_required_inputs(&pilot, &values);
        if !missing.is_empty() {
            return Err(ServiceError::MissingRequiredInputs(missing));
        }

        let run = run_workflow(self.backend.as_ref(), &pilot, &values);
        let log = RunLog {
            id: make_id("run"),
            pilot_id: pilot.id.clone(),
            created_at_ms: now_ms(),
            input_values: values,
            output_preview: truncate_chars(&run.output, OUTPUT_PREVIEW_MAX_CHARS),
            total_tokens: run.total_tokens,
            status: RunStatus::Success,
        };

        let outcome = self.store.commit_run(pilot_id, &log)?;
        info!(pilot_id, run_id = %log.id, mode = run.mode.as_str(), outcome = outcome.as_str(), "run committed");
        Ok(match outcome {
            CommitOutcome::Success { credits_left } => RunOutcome::Completed(RunReport {
                run_id: log.id,
                output: run.output,
                total_tokens: run.total_tokens,
                mode: run.mode,
                credits_left,
            }),
            CommitOutcome::NotFound => RunOutcome::NotFound,
            CommitOutcome::InsufficientCredits => RunOutcome::InsufficientCredits,
        })
    }

    /// Charges a credit for a run that failed outside the engine and keeps an
    /// error log whose preview is the reason.
    pub fn record_failed_run(
        &self,
        pilot_id: &str,
        values: &BTreeMap<String, String>,
        reason: &str,
    ) -> Result<CommitOutcome, ServiceError> {
        let preview = truncate_chars(&sanitize_log_message(reason.trim()), OUTPUT_PREVIEW_MAX_CHARS);
        let log = RunLog {
            id: make_id("run"),
            pilot_id: pilot_id.to_string(),
            created_at_ms: now_ms(),
            input_values: trim_values(values),
            output_preview: preview,
            total_tokens: None,
            status: RunStatus::Error,
        };
        let outcome = self.store.commit_run(pilot_id, &log)?;
        warn!(pilot_id, run_id = %log.id, outcome = outcome.as_str(), "failed run recorded");
        Ok(outcome)
    }

    pub fn list_runs(&self, pilot_id: &str, limit: usize) -> Result<Vec<RunLog>, ServiceError> {
        Ok(self.store.list_run_logs(pilot_id, limit.min(RUN_LOG_LIMIT))?)
    }
}

fn trim_values(values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(key, value)| (key.clone(), value.trim().to_string()))
        .collect()
}

fn missing_required_inputs(pilot: &Pilot, values: &BTreeMap<String, String>) -> Vec<String> {
    pilot
        .inputs
        .iter()
        .filter(|field| field.required)
        .filter(|field| values.get(&field.key).map(|v| v.is_empty()).unwrap_or(true))
        .map(|field| field.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{PilotPatch, PilotService, RunOutcome, ServiceError};
    use crate::compiler::CompileRequest;
    use crate::config::AppConfig;
    use crate::providers::{GenerationBackend, ProviderRuntime};
    use crate::retention::RETENTION_META_KEY;
    use crate::schema::{
        ExecutionMode, InputField, RecordMode, RecordPayload, RunStatus, StepTool, StepType,
        WorkflowStep, INITIAL_CREDITS,
    };
    use crate::store::test_support::{pilot, run_log};
    use crate::store::{CommitOutcome, MemoryStore, PilotStore};
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::thread;

    fn service_with(backend: Arc<dyn GenerationBackend>) -> (PilotService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = PilotService::new(store.clone(), backend, "en");
        (service, store)
    }

    fn offline() -> (PilotService, Arc<MemoryStore>) {
        service_with(Arc::new(ProviderRuntime::unconfigured()))
    }

    fn mock_config() -> AppConfig {
        let env = HashMap::from([("PILOTWRIGHT_TRANSPORT".to_string(), "mock".to_string())]);
        AppConfig::from_lookup(move |name| env.get(name).cloned()).expect("config")
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn describe(name: &str, description: &str) -> CompileRequest {
        CompileRequest {
            name: name.to_string(),
            record_mode: RecordMode::Describe,
            record: RecordPayload {
                description: Some(description.to_string()),
                ..RecordPayload::default()
            },
        }
    }

    #[test]
    fn create_without_backend_persists_fallback_pilot() {
        let (service, store) = offline();
        let created = service
            .create_pilot(describe("  ", "Summarize support tickets\nand flag urgent ones"))
            .expect("create");

        assert_eq!(created.mode, ExecutionMode::Fallback);
        assert!(created.pilot.name.starts_with("Pilot "));
        assert_eq!(created.pilot.one_liner, "Summarize support tickets");
        assert_eq!(created.pilot.credits, INITIAL_CREDITS);
        assert_eq!(created.pilot.version, 1);
        assert_eq!(
            store.get_pilot(&created.pilot.id).expect("get"),
            Some(created.pilot.clone())
        );
    }

    #[test]
    fn mock_backend_compiles_and_runs_generated() {
        let service = PilotService::from_config(&mock_config()).expect("service");
        let created = service
            .create_pilot(describe("Drafts", "Turn notes into a reviewed draft"))
            .expect("create");
        assert_eq!(created.mode, ExecutionMode::Generated);
        assert_eq!(created.pilot.inputs[0].key, "source_text");

        let outcome = service
            .run_pilot(&created.pilot.id, &values(&[("source_text", "  launch notes  ")]))
            .expect("run");
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected completed run");
        };
        assert_eq!(report.mode, ExecutionMode::Generated);
        assert!(report.output.contains("launch notes"));
        assert_eq!(report.credits_left, INITIAL_CREDITS - 1);

        let runs = service.list_runs(&created.pilot.id, 10).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, report.run_id);
        assert_eq!(runs[0].input_values["source_text"], "launch notes");
    }

    #[test]
    fn invalid_backend_workflow_falls_back_to_template() {
        let service = PilotService::from_config(&mock_config()).expect("service");
        let created = service
            .create_pilot(describe("Broken", "simulate_invalid_spec please"))
            .expect("create");
        assert_eq!(created.mode, ExecutionMode::Fallback);
        assert_eq!(created.pilot.steps.len(), 4);
        assert_eq!(created.pilot.one_liner, "simulate_invalid_spec please");
    }

    #[test]
    fn missing_required_values_do_not_charge() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 3, 1)).expect("create");

        let err = service
            .run_pilot("p1", &values(&[("source_text", "   ")]))
            .expect_err("missing input");
        assert!(matches!(
            err,
            ServiceError::MissingRequiredInputs(ref keys) if keys == &vec!["source_text".to_string()]
        ));
        assert_eq!(store.get_pilot("p1").expect("get").expect("pilot").credits, 3);
        assert!(store.list_run_logs("p1", 10).expect("logs").is_empty());
    }

    #[test]
    fn fallback_run_charges_and_truncates_preview() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 1, 1)).expect("create");

        let long_text = "長".repeat(500);
        let outcome = service
            .run_pilot("p1", &values(&[("source_text", &long_text)]))
            .expect("run");
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected completed run");
        };
        assert_eq!(report.mode, ExecutionMode::Fallback);
        assert_eq!(report.credits_left, 0);
        assert_eq!(report.total_tokens, None);

        let log = &store.list_run_logs("p1", 1).expect("logs")[0];
        assert_eq!(log.status, RunStatus::Success);
        assert_eq!(log.output_preview.chars().count(), 200);

        assert_eq!(
            service
                .run_pilot("p1", &values(&[("source_text", "again")]))
                .expect("run"),
            RunOutcome::InsufficientCredits
        );
        assert_eq!(
            service.run_pilot("ghost", &BTreeMap::new()).expect("run"),
            RunOutcome::NotFound
        );
    }

    #[test]
    fn failed_runs_are_charged_and_logged_as_errors() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 2, 1)).expect("create");

        let outcome = service
            .record_failed_run(
                "p1",
                &values(&[("source_text", "x")]),
                "upstream said: Bearer sk-abcdefghijklmnopqrstuvwxyz is invalid",
            )
            .expect("record");
        assert_eq!(outcome, CommitOutcome::Success { credits_left: 1 });

        let log = &store.list_run_logs("p1", 1).expect("logs")[0];
        assert_eq!(log.status, RunStatus::Error);
        assert_eq!(
            log.output_preview,
            "upstream said: [REDACTED_BEARER] [REDACTED_KEY] is invalid"
        );
        assert_eq!(
            service
                .record_failed_run("ghost", &BTreeMap::new(), "boom")
                .expect("record"),
            CommitOutcome::NotFound
        );
    }

    #[test]
    fn update_normalizes_and_bumps_version_only() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 17, 1)).expect("create");

        let patch = PilotPatch {
            name: Some("   ".to_string()),
            one_liner: Some(" Weekly digest ".to_string()),
            inputs: Some(vec![InputField {
                key: "Meeting Notes".to_string(),
                label: String::new(),
                required: true,
                placeholder: Some("  ".to_string()),
            }]),
            steps: Some(vec![WorkflowStep {
                id: String::new(),
                order: 9,
                step_type: StepType::Action,
                title: "Only step".to_string(),
                description: String::new(),
                tool: StepTool::Simulated,
                requires_approval: false,
                prompt_template: None,
            }]),
        };
        let updated = service.update_pilot("p1", patch).expect("update").expect("pilot");

        assert_eq!(updated.name, "Pilot p1");
        assert_eq!(updated.one_liner, "Weekly digest");
        assert_eq!(updated.inputs[0].key, "meeting_notes");
        assert_eq!(updated.inputs[0].label, "meeting_notes");
        assert_eq!(updated.inputs[0].placeholder, None);
        assert_eq!(updated.steps.len(), 1);
        assert_eq!(updated.steps[0].id, "step_1");
        assert!(updated.steps[0].requires_approval);
        assert!(updated.steps[0].is_generation());
        assert_eq!(updated.version, 2);
        assert_eq!(updated.credits, 17);
        assert_eq!(updated.created_at_ms, 1);
    }

    #[test]
    fn parallel_edits_each_get_their_own_version() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 5, 1)).expect("create");
        let service = Arc::new(service);

        let handles = (0..8)
            .map(|i| {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    let patch = PilotPatch {
                        name: Some(format!("Edit {i}")),
                        ..PilotPatch::default()
                    };
                    service.update_pilot("p1", patch).expect("update").expect("pilot").version
                })
            })
            .collect::<Vec<_>>();
        let mut versions = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect::<Vec<_>>();
        versions.sort_unstable();

        assert_eq!(versions, (2..=9).collect::<Vec<_>>());
        assert_eq!(store.get_pilot("p1").expect("get").expect("pilot").version, 9);
    }

    #[test]
    fn update_rejects_empty_steps_and_unknown_ids() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 5, 1)).expect("create");

        let err = service
            .update_pilot(
                "p1",
                PilotPatch {
                    steps: Some(Vec::new()),
                    ..PilotPatch::default()
                },
            )
            .expect_err("empty steps");
        assert!(matches!(err, ServiceError::InvalidPatch(_)));
        assert_eq!(store.get_pilot("p1").expect("get").expect("pilot").version, 1);

        assert_eq!(
            service.update_pilot("ghost", PilotPatch::default()).expect("update"),
            None
        );
    }

    #[test]
    fn run_triggers_retention_sweep_first() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 5, 1)).expect("create");
        store.append_run_log(&run_log("ancient", "p1", 0)).expect("append");

        service
            .run_pilot("p1", &values(&[("source_text", "hi")]))
            .expect("run");

        let logs = store.list_run_logs("p1", 10).expect("logs");
        assert_eq!(logs.len(), 1);
        assert!(logs[0].id.starts_with("run_"));
        assert!(store.get_meta(RETENTION_META_KEY).expect("meta").is_some());
    }

    #[test]
    fn list_runs_is_bounded() {
        let (service, store) = offline();
        store.create_pilot(&pilot("p1", 5, 1)).expect("create");
        for i in 0..5 {
            store
                .append_run_log(&run_log(&format!("r{i}"), "p1", i))
                .expect("append");
        }
        let ids = service
            .list_runs("p1", 2)
            .expect("runs")
            .into_iter()
            .map(|log| log.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["r4", "r3"]);
    }
}
