//! DAG, operator and artifact result operations.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::{
    DbError,
    models::{ArtifactResultRow, DagResultRow, ExecutionStatus, OperatorResultRow},
};

// ---------------------------------------------------------------------------
// dag_results
// ---------------------------------------------------------------------------

/// Create a DAG result row.
///
/// `created_at` is caller-supplied: externally imported runs use the remote
/// run's start time, which is also what de-duplicates later imports.
pub async fn create_dag_result<'e, E>(
    executor: E,
    workflow_id: Uuid,
    workflow_dag_id: Uuid,
    status: ExecutionStatus,
    exec_state: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
) -> Result<DagResultRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, DagResultRow>(
        r#"
        INSERT INTO dag_results (id, workflow_id, workflow_dag_id, status, exec_state, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id, workflow_id, workflow_dag_id, status, exec_state, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(workflow_id)
    .bind(workflow_dag_id)
    .bind(status.to_string())
    .bind(exec_state)
    .bind(created_at)
    .fetch_one(executor)
    .await?;

    Ok(row)
}

/// Update the status and execution state of a DAG result.
pub async fn update_dag_result<'e, E>(
    executor: E,
    id: Uuid,
    status: ExecutionStatus,
    exec_state: serde_json::Value,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE dag_results SET status = ?, exec_state = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(exec_state)
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Fetch a single DAG result.
pub async fn get_dag_result<'e, E>(executor: E, id: Uuid) -> Result<DagResultRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, DagResultRow>(
        r#"
        SELECT id, workflow_id, workflow_dag_id, status, exec_state, created_at
        FROM dag_results WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or(DbError::NotFound)
}

/// All DAG results of a workflow, newest first.
pub async fn get_dag_results_by_workflow<'e, E>(
    executor: E,
    workflow_id: Uuid,
) -> Result<Vec<DagResultRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, DagResultRow>(
        r#"
        SELECT id, workflow_id, workflow_dag_id, status, exec_state, created_at
        FROM dag_results WHERE workflow_id = ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(workflow_id)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

/// Delete every DAG result of `workflow_id` except the `keep` most recent.
///
/// Operator and artifact results cascade. Returns the number of DAG results
/// removed.
pub async fn delete_excess_dag_results<'e, E>(
    executor: E,
    workflow_id: Uuid,
    keep: i64,
) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM dag_results
        WHERE workflow_id = ?
          AND id NOT IN (
              SELECT id FROM dag_results
              WHERE workflow_id = ?
              ORDER BY created_at DESC
              LIMIT ?
          )
        "#,
    )
    .bind(workflow_id)
    .bind(workflow_id)
    .bind(keep)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// operator_results
// ---------------------------------------------------------------------------

/// Create the result row for one operator within a DAG result.
pub async fn create_operator_result<'e, E>(
    executor: E,
    dag_result_id: Uuid,
    operator_id: Uuid,
    status: ExecutionStatus,
    exec_state: Option<serde_json::Value>,
) -> Result<OperatorResultRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, OperatorResultRow>(
        r#"
        INSERT INTO operator_results (id, dag_result_id, operator_id, status, exec_state)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, dag_result_id, operator_id, status, exec_state
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(dag_result_id)
    .bind(operator_id)
    .bind(status.to_string())
    .bind(exec_state)
    .fetch_one(executor)
    .await?;

    Ok(row)
}

/// Record the final state of an operator result.
pub async fn update_operator_result<'e, E>(
    executor: E,
    id: Uuid,
    status: ExecutionStatus,
    exec_state: serde_json::Value,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE operator_results SET status = ?, exec_state = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(exec_state)
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Operator results of a DAG result.
pub async fn get_operator_results<'e, E>(
    executor: E,
    dag_result_id: Uuid,
) -> Result<Vec<OperatorResultRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, OperatorResultRow>(
        r#"
        SELECT id, dag_result_id, operator_id, status, exec_state
        FROM operator_results WHERE dag_result_id = ?
        "#,
    )
    .bind(dag_result_id)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// artifact_results
// ---------------------------------------------------------------------------

/// Create the result row for one artifact within a DAG result.
pub async fn create_artifact_result<'e, E>(
    executor: E,
    dag_result_id: Uuid,
    artifact_id: Uuid,
    content_path: &str,
    status: ExecutionStatus,
    exec_state: Option<serde_json::Value>,
) -> Result<ArtifactResultRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, ArtifactResultRow>(
        r#"
        INSERT INTO artifact_results (id, dag_result_id, artifact_id, content_path, status, exec_state)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id, dag_result_id, artifact_id, content_path, status, exec_state, metadata
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(dag_result_id)
    .bind(artifact_id)
    .bind(content_path)
    .bind(status.to_string())
    .bind(exec_state)
    .fetch_one(executor)
    .await?;

    Ok(row)
}

/// Record the final state (and metadata, when computed) of an artifact result.
pub async fn update_artifact_result<'e, E>(
    executor: E,
    id: Uuid,
    status: ExecutionStatus,
    exec_state: serde_json::Value,
    metadata: Option<serde_json::Value>,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE artifact_results SET status = ?, exec_state = ?, metadata = ? WHERE id = ?",
    )
    .bind(status.to_string())
    .bind(exec_state)
    .bind(metadata)
    .bind(id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Artifact results of a DAG result.
pub async fn get_artifact_results<'e, E>(
    executor: E,
    dag_result_id: Uuid,
) -> Result<Vec<ArtifactResultRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, ArtifactResultRow>(
        r#"
        SELECT id, dag_result_id, artifact_id, content_path, status, exec_state, metadata
        FROM artifact_results WHERE dag_result_id = ?
        "#,
    )
    .bind(dag_result_id)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}
