//! Embedded single-file store backend (dev/CI), via `sled`.
//!
//! Opens a `sled::Db` and serializes values as JSON under string keys, with
//! zero-padded step keys so a prefix scan visits a run's steps in order.

use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;

use crate::error::{EngineError, EngineResult};
use crate::graph::NodeId;
use crate::store::{Checkpoint, StepRecord, Store};

pub struct SledStore<S> {
    db: Db,
    _marker: PhantomData<S>,
}

impl<S> SledStore<S> {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path).map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(Self {
            db,
            _marker: PhantomData,
        })
    }

    fn step_key(run_id: &str, step: u64) -> String {
        format!("step:{run_id}:{step:020}")
    }

    fn step_prefix(run_id: &str) -> String {
        format!("step:{run_id}:")
    }

    fn checkpoint_key(cp_id: &str) -> String {
        format!("checkpoint:{cp_id}")
    }

    fn last_error_key(run_id: &str) -> String {
        format!("last_error:{run_id}")
    }
}

#[async_trait]
impl<S> Store<S> for SledStore<S>
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
        let key = Self::step_key(run_id, step);
        if let Some(existing) = self
            .db
            .get(key.as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            let existing: StepRecord<S> =
                serde_json::from_slice(&existing).map_err(|e| EngineError::Store(e.to_string()))?;
            let same = existing.node_id == *node_id
                && serde_json::to_vec(&existing.post_state)? == serde_json::to_vec(post_state)?;
            return if same {
                Ok(())
            } else {
                Err(EngineError::IdempotencyViolation {
                    run_id: run_id.to_string(),
                    step,
                })
            };
        }
        let record = StepRecord {
            run_id: run_id.to_string(),
            step,
            node_id: node_id.clone(),
            post_state: post_state.clone(),
            attempt,
            wall_clock_ms,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> EngineResult<(S, u64)> {
        let prefix = Self::step_prefix(run_id);
        let last = self
            .db
            .scan_prefix(prefix.as_bytes())
            .last()
            .transpose()
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        let record: StepRecord<S> =
            serde_json::from_slice(&last.1).map_err(|e| EngineError::Store(e.to_string()))?;
        Ok((record.post_state, record.step))
    }

    async fn load_step(&self, run_id: &str, step: u64) -> EngineResult<StepRecord<S>> {
        let key = Self::step_key(run_id, step);
        let bytes = self
            .db
            .get(key.as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id} step {step}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn last_step(&self, run_id: &str) -> EngineResult<Option<u64>> {
        let prefix = Self::step_prefix(run_id);
        match self
            .db
            .scan_prefix(prefix.as_bytes())
            .last()
            .transpose()
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            Some((_, bytes)) => {
                let record: StepRecord<S> = serde_json::from_slice(&bytes)?;
                Ok(Some(record.step))
            }
            None => Ok(None),
        }
    }

    async fn save_checkpoint(&self, cp_id: &str, state: &S, step: u64) -> EngineResult<()> {
        let key = Self::checkpoint_key(cp_id);
        let now = Utc::now();
        let created_at = match self
            .db
            .get(key.as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            Some(existing) => {
                let existing: Checkpoint<S> = serde_json::from_slice(&existing)?;
                existing.created_at
            }
            None => now,
        };
        let checkpoint = Checkpoint {
            cp_id: cp_id.to_string(),
            state: state.clone(),
            step,
            created_at,
            updated_at: now,
        };
        let bytes = serde_json::to_vec(&checkpoint)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_checkpoint(&self, cp_id: &str) -> EngineResult<Checkpoint<S>> {
        let key = Self::checkpoint_key(cp_id);
        let bytes = self
            .db
            .get(key.as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {cp_id}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save_last_error(&self, run_id: &str, error: &str) -> EngineResult<()> {
        self.db
            .insert(Self::last_error_key(run_id).as_bytes(), error.as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_last_error(&self, run_id: &str) -> EngineResult<Option<String>> {
        match self
            .db
            .get(Self::last_error_key(run_id).as_bytes())
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            Some(bytes) => Ok(Some(
                String::from_utf8_lossy(bytes.as_ref()).into_owned(),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_steps_and_checkpoints_through_sled() {
        let dir = tempfile::tempdir().unwrap();
        let store: SledStore<i64> = SledStore::open(dir.path()).unwrap();
        let node = NodeId::from("n");
        store.save_step("r1", 0, &node, &1, 1, 5).await.unwrap();
        store.save_step("r1", 1, &node, &2, 1, 5).await.unwrap();
        let (state, step) = store.load_latest("r1").await.unwrap();
        assert_eq!(state, 2);
        assert_eq!(step, 1);

        store.save_checkpoint("cp", &9, 1).await.unwrap();
        let cp = store.load_checkpoint("cp").await.unwrap();
        assert_eq!(cp.state, 9);
    }
}
