//! Persistence Store (C3): append-only step log per run, plus named
//! checkpoints independent of run history. `InMemoryStore` here is the
//! in-process backend for tests and embedding without I/O.
//! See `store_sled` and `store_sql` for the on-disk backends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::graph::NodeId;

/// One persisted, never-mutated step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord<S> {
    pub run_id: String,
    pub step: u64,
    pub node_id: NodeId,
    pub post_state: S,
    pub attempt: u32,
    pub wall_clock_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// A named snapshot, independent of any particular run's step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub cp_id: String,
    pub state: S,
    pub step: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persistence contract every backend implements.
///
/// Stores provide durable write-then-read consistency for every method
/// here, and uniqueness on `(run_id, step)` and `cp_id`. `save_step` is
/// idempotent when called again with the same `(node_id, post_state)`;
/// a different payload for an existing `(run_id, step)` is an
/// `IdempotencyViolation`.
#[async_trait]
pub trait Store<S>: Send + Sync
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn save_step(
        &self,
        run_id: &str,
        step: u64,
        node_id: &NodeId,
        post_state: &S,
        attempt: u32,
        wall_clock_ms: u64,
    ) -> EngineResult<()>;

    /// Most recent step for a run. `NotFound` if the run has no steps yet.
    async fn load_latest(&self, run_id: &str) -> EngineResult<(S, u64)>;

    async fn load_step(&self, run_id: &str, step: u64) -> EngineResult<StepRecord<S>>;

    /// Highest persisted step number for a run, if any.
    async fn last_step(&self, run_id: &str) -> EngineResult<Option<u64>>;

    async fn save_checkpoint(&self, cp_id: &str, state: &S, step: u64) -> EngineResult<()>;

    async fn load_checkpoint(&self, cp_id: &str) -> EngineResult<Checkpoint<S>>;

    /// Persists the last error observed for a run alongside its last
    /// successful step, so a resumed replay can see the failure point.
    async fn save_last_error(&self, run_id: &str, error: &str) -> EngineResult<()>;

    async fn load_last_error(&self, run_id: &str) -> EngineResult<Option<String>>;
}

struct RunLog<S> {
    steps: BTreeMap<u64, StepRecord<S>>,
    last_error: Option<String>,
}

impl<S> Default for RunLog<S> {
    fn default() -> Self {
        Self {
            steps: BTreeMap::new(),
            last_error: None,
        }
    }
}

/// In-process store backed by a lock-guarded map. No I/O, so it has no
/// durability across process restarts — intended for tests and for
/// embedding the engine where the caller supplies its own persistence.
#[derive(Default)]
pub struct InMemoryStore<S> {
    runs: RwLock<std::collections::HashMap<String, RunLog<S>>>,
    checkpoints: RwLock<std::collections::HashMap<String, Checkpoint<S>>>,
}

impl<S> InMemoryStore<S> {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(std::collections::HashMap::new()),
            checkpoints: RwLock::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl<S> Store<S> for InMemoryStore<S>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn save_step(
        &self,
        run_id: &str,
        step: u64,
        node_id: &NodeId,
        post_state: &S,
        attempt: u32,
        wall_clock_ms: u64,
    ) -> EngineResult<()> {
        let mut runs = self.runs.write();
        let log = runs.entry(run_id.to_string()).or_default();
        if let Some(existing) = log.steps.get(&step) {
            let same = existing.node_id == *node_id
                && serde_json::to_vec(&existing.post_state)?
                    == serde_json::to_vec(post_state)?;
            if same {
                return Ok(());
            }
            return Err(EngineError::IdempotencyViolation {
                run_id: run_id.to_string(),
                step,
            });
        }
        log.steps.insert(
            step,
            StepRecord {
                run_id: run_id.to_string(),
                step,
                node_id: node_id.clone(),
                post_state: post_state.clone(),
                attempt,
                wall_clock_ms,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> EngineResult<(S, u64)> {
        let runs = self.runs.read();
        let log = runs
            .get(run_id)
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        let (step, record) = log
            .steps
            .iter()
            .next_back()
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        Ok((record.post_state.clone(), *step))
    }

    async fn load_step(&self, run_id: &str, step: u64) -> EngineResult<StepRecord<S>> {
        let runs = self.runs.read();
        runs.get(run_id)
            .and_then(|log| log.steps.get(&step))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id} step {step}")))
    }

    async fn last_step(&self, run_id: &str) -> EngineResult<Option<u64>> {
        let runs = self.runs.read();
        Ok(runs.get(run_id).and_then(|log| log.steps.keys().next_back().copied()))
    }

    async fn save_checkpoint(&self, cp_id: &str, state: &S, step: u64) -> EngineResult<()> {
        let mut checkpoints = self.checkpoints.write();
        let now = Utc::now();
        let created_at = checkpoints
            .get(cp_id)
            .map(|cp| cp.created_at)
            .unwrap_or(now);
        checkpoints.insert(
            cp_id.to_string(),
            Checkpoint {
                cp_id: cp_id.to_string(),
                state: state.clone(),
                step,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn load_checkpoint(&self, cp_id: &str) -> EngineResult<Checkpoint<S>> {
        self.checkpoints
            .read()
            .get(cp_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {cp_id}")))
    }

    async fn save_last_error(&self, run_id: &str, error: &str) -> EngineResult<()> {
        let mut runs = self.runs.write();
        let log = runs.entry(run_id.to_string()).or_default();
        log.last_error = Some(error.to_string());
        Ok(())
    }

    async fn load_last_error(&self, run_id: &str) -> EngineResult<Option<String>> {
        Ok(self
            .runs
            .read()
            .get(run_id)
            .and_then(|log| log.last_error.clone()))
    }
}
