//! Relational store backend: `workflow_steps` / `workflow_checkpoints`
//! tables with a JSON state column and a `UNIQUE(run_id, step)` constraint.
//!
//! `sqlx` is the natural async-Rust fit for this schema and runs on the
//! same `tokio` runtime the rest of the engine uses. This backend targets
//! SQLite through `sqlx::SqlitePool` for a connection-string-only,
//! dependency-light "relational" option; pointing the same pool type at
//! Postgres is a matter of swapping the DSN and is left to the embedder.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::{EngineError, EngineResult};
use crate::graph::NodeId;
use crate::store::{Checkpoint, StepRecord, Store};

pub struct SqlStore<S> {
    pool: SqlitePool,
    _marker: PhantomData<S>,
}

impl<S> SqlStore<S> {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        let store = Self {
            pool,
            _marker: PhantomData,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                wall_clock_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, step)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflow_steps_run_id ON workflow_steps(run_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_steps_run_id_step ON workflow_steps(run_id, step)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                checkpoint_id TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL,
                step INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_run_errors (
                run_id TEXT PRIMARY KEY,
                error TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(())
    }
}

fn deserialize_state<S: DeserializeOwned>(raw: &str) -> EngineResult<S> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl<S> Store<S> for SqlStore<S>
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
        let existing = sqlx::query("SELECT node_id, state FROM workflow_steps WHERE run_id = ? AND step = ?")
            .bind(run_id)
            .bind(step as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let new_state_json = serde_json::to_string(post_state)?;
        if let Some(row) = existing {
            let existing_node: String = row.try_get("node_id").map_err(|e| EngineError::Store(e.to_string()))?;
            let existing_state: String = row.try_get("state").map_err(|e| EngineError::Store(e.to_string()))?;
            return if existing_node == node_id.as_str() && existing_state == new_state_json {
                Ok(())
            } else {
                Err(EngineError::IdempotencyViolation {
                    run_id: run_id.to_string(),
                    step,
                })
            };
        }

        sqlx::query(
            "INSERT INTO workflow_steps (run_id, step, node_id, state, attempt, wall_clock_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(step as i64)
        .bind(node_id.as_str())
        .bind(&new_state_json)
        .bind(attempt as i64)
        .bind(wall_clock_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> EngineResult<(S, u64)> {
        let row = sqlx::query(
            "SELECT state, step FROM workflow_steps WHERE run_id = ? ORDER BY step DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;

        let state_json: String = row.try_get("state").map_err(|e| EngineError::Store(e.to_string()))?;
        let step: i64 = row.try_get("step").map_err(|e| EngineError::Store(e.to_string()))?;
        Ok((deserialize_state(&state_json)?, step as u64))
    }

    async fn load_step(&self, run_id: &str, step: u64) -> EngineResult<StepRecord<S>> {
        let row = sqlx::query(
            "SELECT node_id, state, attempt, wall_clock_ms, created_at FROM workflow_steps \
             WHERE run_id = ? AND step = ?",
        )
        .bind(run_id)
        .bind(step as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id} step {step}")))?;

        let node_id: String = row.try_get("node_id").map_err(|e| EngineError::Store(e.to_string()))?;
        let state_json: String = row.try_get("state").map_err(|e| EngineError::Store(e.to_string()))?;
        let attempt: i64 = row.try_get("attempt").map_err(|e| EngineError::Store(e.to_string()))?;
        let wall_clock_ms: i64 = row.try_get("wall_clock_ms").map_err(|e| EngineError::Store(e.to_string()))?;
        let created_at: String = row.try_get("created_at").map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(StepRecord {
            run_id: run_id.to_string(),
            step,
            node_id: NodeId::from(node_id),
            post_state: deserialize_state(&state_json)?,
            attempt: attempt as u32,
            wall_clock_ms: wall_clock_ms as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EngineError::Store(e.to_string()))?,
        })
    }

    async fn last_step(&self, run_id: &str) -> EngineResult<Option<u64>> {
        let row = sqlx::query("SELECT MAX(step) as max_step FROM workflow_steps WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        let max_step: Option<i64> = row.try_get("max_step").map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(max_step.map(|s| s as u64))
    }

    async fn save_checkpoint(&self, cp_id: &str, state: &S, step: u64) -> EngineResult<()> {
        let state_json = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO workflow_checkpoints (checkpoint_id, state, step, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(checkpoint_id) DO UPDATE SET state = excluded.state, step = excluded.step, updated_at = excluded.updated_at",
        )
        .bind(cp_id)
        .bind(&state_json)
        .bind(step as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_checkpoint(&self, cp_id: &str) -> EngineResult<Checkpoint<S>> {
        let row = sqlx::query(
            "SELECT state, step, created_at, updated_at FROM workflow_checkpoints WHERE checkpoint_id = ?",
        )
        .bind(cp_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?
        .ok_or_else(|| EngineError::NotFound(format!("checkpoint {cp_id}")))?;

        let state_json: String = row.try_get("state").map_err(|e| EngineError::Store(e.to_string()))?;
        let step: i64 = row.try_get("step").map_err(|e| EngineError::Store(e.to_string()))?;
        let created_at: String = row.try_get("created_at").map_err(|e| EngineError::Store(e.to_string()))?;
        let updated_at: String = row.try_get("updated_at").map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(Checkpoint {
            cp_id: cp_id.to_string(),
            state: deserialize_state(&state_json)?,
            step: step as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EngineError::Store(e.to_string()))?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EngineError::Store(e.to_string()))?,
        })
    }

    async fn save_last_error(&self, run_id: &str, error: &str) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO workflow_run_errors (run_id, error) VALUES (?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET error = excluded.error",
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_last_error(&self, run_id: &str) -> EngineResult<Option<String>> {
        let row = sqlx::query("SELECT error FROM workflow_run_errors WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        match row {
            Some(row) => Ok(Some(row.try_get("error").map_err(|e| EngineError::Store(e.to_string()))?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_steps_through_sqlite() {
        let store: SqlStore<i64> = SqlStore::connect("sqlite::memory:").await.unwrap();
        let node = NodeId::from("n");
        store.save_step("r1", 0, &node, &1, 1, 5).await.unwrap();
        store.save_step("r1", 1, &node, &2, 1, 5).await.unwrap();
        let (state, step) = store.load_latest("r1").await.unwrap();
        assert_eq!(state, 2);
        assert_eq!(step, 1);
    }

    #[tokio::test]
    async fn rejects_conflicting_rewrite_of_an_existing_step() {
        let store: SqlStore<i64> = SqlStore::connect("sqlite::memory:").await.unwrap();
        let node = NodeId::from("n");
        store.save_step("r1", 0, &node, &1, 1, 5).await.unwrap();
        let err = store.save_step("r1", 0, &node, &2, 1, 5).await;
        assert!(matches!(err, Err(EngineError::IdempotencyViolation { .. })));
    }
}
