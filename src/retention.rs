use crate::logging::sanitize_log_message;
use crate::store::{PilotStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const RETENTION_META_KEY: &str = "retention:run_logs";
pub const SWEEP_INTERVAL_MS: i64 = 24 * 60 * 60 * 1_000;
pub const RETENTION_HORIZON_MS: i64 = 90 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepRecord {
    executed_at: i64,
    deleted_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub attempted: bool,
    pub skipped: bool,
    pub deleted_count: usize,
    pub error: Option<String>,
}

/// Deletes run logs older than the retention horizon, at most once per
/// interval. Storage failures are reported in the result and never returned
/// as errors.
pub fn cleanup(store: &dyn PilotStore, now_ms: i64) -> SweepReport {
    match sweep(store, now_ms) {
        Ok(report) => report,
        Err(err) => {
            let message = sanitize_log_message(&err.to_string());
            warn!(error = %message, "run log retention sweep failed");
            SweepReport {
                attempted: true,
                skipped: false,
                deleted_count: 0,
                error: Some(message),
            }
        }
    }
}

fn not_due() -> SweepReport {
    SweepReport {
        skipped: true,
        ..SweepReport::default()
    }
}

fn sweep(store: &dyn PilotStore, now_ms: i64) -> Result<SweepReport, StoreError> {
    let previous = store.get_meta(RETENTION_META_KEY)?;
    let last = previous
        .clone()
        .and_then(|value| serde_json::from_value::<SweepRecord>(value).ok());

    if let Some(last) = last {
        if now_ms - last.executed_at < SWEEP_INTERVAL_MS {
            debug!(last_executed_at = last.executed_at, "retention sweep not due");
            return Ok(not_due());
        }
    }

    // Claim the interval before deleting so concurrent callers see it taken.
    let claim = serde_json::to_value(SweepRecord {
        executed_at: now_ms,
        deleted_count: 0,
    })?;
    if !store.claim_meta(RETENTION_META_KEY, previous.as_ref(), &claim)? {
        debug!("retention sweep claimed by another caller");
        return Ok(not_due());
    }

    let cutoff = now_ms - RETENTION_HORIZON_MS;
    let deleted_count = match store.delete_run_logs_older_than(cutoff) {
        Ok(count) => count,
        Err(err) => {
            release_claim(store, previous.as_ref(), &claim, now_ms);
            return Err(err);
        }
    };
    let record = SweepRecord {
        executed_at: now_ms,
        deleted_count,
    };
    store.set_meta(RETENTION_META_KEY, &serde_json::to_value(record)?)?;
    info!(deleted_count, cutoff, "run log retention sweep finished");

    Ok(SweepReport {
        attempted: true,
        skipped: false,
        deleted_count,
        error: None,
    })
}

/// Puts back the record a failed sweep claimed over, so the next call retries
/// instead of waiting out the interval.
fn release_claim(store: &dyn PilotStore, previous: Option<&Value>, claim: &Value, now_ms: i64) {
    let restored = match previous {
        Some(value) => value.clone(),
        None => match serde_json::to_value(SweepRecord {
            executed_at: now_ms - SWEEP_INTERVAL_MS,
            deleted_count: 0,
        }) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "could not encode retention record");
                return;
            }
        },
    };
    match store.claim_meta(RETENTION_META_KEY, Some(claim), &restored) {
        Ok(true) => {}
        Ok(false) => debug!("retention record changed while the sweep ran"),
        Err(err) => warn!(
            error = %sanitize_log_message(&err.to_string()),
            "could not release retention sweep claim"
        ),
    }
}
