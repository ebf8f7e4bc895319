//! Workflow aggregate persistence.
//!
//! The orchestration layer only needs `load` and `save`; everything else
//! about the aggregate's storage is behind this trait so tests can run
//! against the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{CourseWorkflow, UserId, WorkflowId, WorkflowStatus};

/// Aggregate store collaborator contract.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Load a workflow by id. `None` when it does not exist.
    async fn load(&self, id: WorkflowId) -> Result<Option<CourseWorkflow>>;

    /// Persist the full aggregate state.
    async fn save(&self, workflow: &CourseWorkflow) -> Result<()>;
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

/// Row shape for the `course_workflows` table. Collections are JSONB
/// documents; scalar fields stay queryable columns.
#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: WorkflowId,
    user_id: Option<UserId>,
    status: WorkflowStatus,
    current_step: i32,
    step_progress: serde_json::Value,
    modules: serde_json::Value,
    step_results: serde_json::Value,
    last_error: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<CourseWorkflow> {
        Ok(CourseWorkflow {
            id: self.id,
            user_id: self.user_id,
            status: self.status,
            current_step: self.current_step,
            step_progress: serde_json::from_value(self.step_progress)
                .context("malformed step_progress column")?,
            modules: serde_json::from_value(self.modules).context("malformed modules column")?,
            step_results: serde_json::from_value(self.step_results)
                .context("malformed step_results column")?,
            last_error: serde_json::from_value(self.last_error)
                .context("malformed last_error column")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// PostgreSQL-backed workflow store.
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn load(&self, id: WorkflowId) -> Result<Option<CourseWorkflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM course_workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRow::into_workflow).transpose()
    }

    async fn save(&self, workflow: &CourseWorkflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO course_workflows (
                id, user_id, status, current_step,
                step_progress, modules, step_results, last_error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                current_step = EXCLUDED.current_step,
                step_progress = EXCLUDED.step_progress,
                modules = EXCLUDED.modules,
                step_results = EXCLUDED.step_results,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.user_id)
        .bind(workflow.status)
        .bind(workflow.current_step)
        .bind(serde_json::to_value(&workflow.step_progress)?)
        .bind(serde_json::to_value(&workflow.modules)?)
        .bind(serde_json::to_value(&workflow.step_results)?)
        .bind(serde_json::to_value(&workflow.last_error)?)
        .bind(workflow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests, inline tooling)
// ============================================================================

/// In-memory workflow store for tests.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, CourseWorkflow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a workflow directly.
    pub fn insert(&self, workflow: CourseWorkflow) {
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workflow.id, workflow);
    }

    /// Snapshot for assertions.
    pub fn get(&self, id: WorkflowId) -> Option<CourseWorkflow> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn load(&self, id: WorkflowId) -> Result<Option<CourseWorkflow>> {
        Ok(self.get(id))
    }

    async fn save(&self, workflow: &CourseWorkflow) -> Result<()> {
        self.insert(workflow.clone());
        Ok(())
    }
}
