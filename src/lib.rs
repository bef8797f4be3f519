//! Compile free-form task descriptions into small workflow "pilots" and run
//! them against a generation backend, with a deterministic offline fallback
//! for both steps and a credit-metered run history.

pub mod compiler;
pub mod config;
pub mod ids;
pub mod inputs;
pub mod logging;
pub mod providers;
pub mod retention;
pub mod run_engine;
pub mod schema;
pub mod service;
pub mod steps;
pub mod store;
pub mod template;
pub mod transport;

pub use compiler::{CompileRequest, CompileResult};
pub use config::AppConfig;
pub use service::{PilotPatch, PilotService, RunOutcome, RunReport, ServiceError};
