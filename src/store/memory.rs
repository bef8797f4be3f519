use crate::schema::{Pilot, RunLog, RUN_LOG_LIMIT};
use crate::store::{CommitOutcome, PilotStore, StoreError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    pilots: HashMap<String, Pilot>,
    // Newest at the front.
    run_logs: HashMap<String, VecDeque<RunLog>>,
    meta: HashMap<String, Value>,
}

/// Process-local store. Every operation takes the single state lock, which
/// also makes `commit_run` atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn push_log(state: &mut MemoryState, log: &RunLog) {
    let logs = state.run_logs.entry(log.pilot_id.clone()).or_default();
    logs.push_front(log.clone());
    logs.truncate(RUN_LOG_LIMIT);
}

impl PilotStore for MemoryStore {
    fn create_pilot(&self, pilot: &Pilot) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.pilots.contains_key(&pilot.id) {
            return Err(StoreError::Corrupt(format!("pilot {} already exists", pilot.id)));
        }
        state.pilots.insert(pilot.id.clone(), pilot.clone());
        Ok(())
    }

    fn get_pilot(&self, id: &str) -> Result<Option<Pilot>, StoreError> {
        Ok(self.lock()?.pilots.get(id).cloned())
    }

    fn update_pilot(&self, pilot: &Pilot) -> Result<Option<Pilot>, StoreError> {
        let mut state = self.lock()?;
        let Some(stored) = state.pilots.get_mut(&pilot.id) else {
            return Ok(None);
        };
        *stored = Pilot {
            id: stored.id.clone(),
            credits: stored.credits,
            version: stored.version + 1,
            created_at_ms: stored.created_at_ms,
            ..pilot.clone()
        };
        Ok(Some(stored.clone()))
    }

    fn list_pilots(&self) -> Result<Vec<Pilot>, StoreError> {
        let mut pilots = self.lock()?.pilots.values().cloned().collect::<Vec<_>>();
        pilots.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(pilots)
    }

    fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.pilots.contains_key(&log.pilot_id) {
            return Err(StoreError::UnknownPilot(log.pilot_id.clone()));
        }
        push_log(&mut state, log);
        Ok(())
    }

    fn list_run_logs(&self, pilot_id: &str, limit: usize) -> Result<Vec<RunLog>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .run_logs
            .get(pilot_id)
            .map(|logs| logs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn commit_run(&self, pilot_id: &str, log: &RunLog) -> Result<CommitOutcome, StoreError> {
        let mut state = self.lock()?;
        let Some(pilot) = state.pilots.get_mut(pilot_id) else {
            return Ok(CommitOutcome::NotFound);
        };
        if pilot.credits <= 0 {
            return Ok(CommitOutcome::InsufficientCredits);
        }
        pilot.credits -= 1;
        let credits_left = pilot.credits;
        push_log(&mut state, log);
        Ok(CommitOutcome::Success { credits_left })
    }

    fn delete_run_logs_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut deleted = 0;
        for logs in state.run_logs.values_mut() {
            let before = logs.len();
            logs.retain(|log| log.created_at_ms >= cutoff_ms);
            deleted += before - logs.len();
        }
        Ok(deleted)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.lock()?.meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.lock()?.meta.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn claim_meta(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: &Value,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.meta.get(key) != expected {
            return Ok(false);
        }
        state.meta.insert(key.to_string(), value.clone());
        Ok(true)
    }
}
