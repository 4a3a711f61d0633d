//! Workflow CRUD operations.

use chrono::Utc;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::{DbError, models::WorkflowRow};

/// Insert a new workflow.
///
/// `schedule` and `retention_policy` are the JSON forms of the engine's
/// `Schedule` and `RetentionPolicy` types.
pub async fn create_workflow<'e, E>(
    executor: E,
    id: Uuid,
    name: &str,
    description: &str,
    schedule: serde_json::Value,
    retention_policy: serde_json::Value,
) -> Result<WorkflowRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, name, description, schedule, retention_policy, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id, name, description, schedule, retention_policy, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(description)
    .bind(schedule)
    .bind(retention_policy)
    .bind(Utc::now())
    .fetch_one(executor)
    .await?;

    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow<'e, E>(executor: E, id: Uuid) -> Result<WorkflowRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, name, description, schedule, retention_policy, created_at
        FROM workflows WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or(DbError::NotFound)
}

/// Return all workflows ordered by creation time (newest first).
pub async fn list_workflows<'e, E>(executor: E) -> Result<Vec<WorkflowRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, name, description, schedule, retention_policy, created_at
        FROM workflows ORDER BY created_at DESC
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Permanently delete a workflow, cascading to its DAGs and results.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_workflow<'e, E>(executor: E, id: Uuid) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
