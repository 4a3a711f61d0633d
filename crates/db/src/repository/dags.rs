//! DAG structure operations: DAG versions, operators, artifacts and edges.

use chrono::Utc;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{ArtifactRow, EdgeRow, OperatorRow, WorkflowDagRow},
};

/// Every row making up one DAG version.
#[derive(Debug, Clone)]
pub struct DagRows {
    pub dag: WorkflowDagRow,
    pub operators: Vec<OperatorRow>,
    pub artifacts: Vec<ArtifactRow>,
    pub edges: Vec<EdgeRow>,
}

/// Insert a complete DAG version (header, nodes and edges) atomically.
pub async fn create_dag(pool: &DbPool, rows: &DagRows) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workflow_dags (id, workflow_id, storage_config, engine_config, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(rows.dag.id)
    .bind(rows.dag.workflow_id)
    .bind(&rows.dag.storage_config)
    .bind(&rows.dag.engine_config)
    .bind(rows.dag.created_at)
    .execute(&mut *tx)
    .await?;

    for op in &rows.operators {
        sqlx::query(
            r#"
            INSERT INTO operators (id, workflow_dag_id, name, description, spec)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(op.id)
        .bind(rows.dag.id)
        .bind(&op.name)
        .bind(&op.description)
        .bind(&op.spec)
        .execute(&mut *tx)
        .await?;
    }

    for artifact in &rows.artifacts {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, workflow_dag_id, name, description, type)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(artifact.id)
        .bind(rows.dag.id)
        .bind(&artifact.name)
        .bind(&artifact.description)
        .bind(&artifact.artifact_type)
        .execute(&mut *tx)
        .await?;
    }

    for edge in &rows.edges {
        sqlx::query(
            r#"
            INSERT INTO workflow_dag_edges (workflow_dag_id, edge_type, from_id, to_id, idx)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(rows.dag.id)
        .bind(&edge.edge_type)
        .bind(edge.from_id)
        .bind(edge.to_id)
        .bind(edge.idx)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Fetch a DAG version together with its nodes and edges.
pub async fn get_dag(pool: &DbPool, id: Uuid) -> Result<DagRows, DbError> {
    let dag = sqlx::query_as::<_, WorkflowDagRow>(
        r#"
        SELECT id, workflow_id, storage_config, engine_config, created_at
        FROM workflow_dags WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    let operators = sqlx::query_as::<_, OperatorRow>(
        "SELECT id, workflow_dag_id, name, description, spec FROM operators WHERE workflow_dag_id = ?",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let artifacts = sqlx::query_as::<_, ArtifactRow>(
        "SELECT id, workflow_dag_id, name, description, type FROM artifacts WHERE workflow_dag_id = ?",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let edges = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT workflow_dag_id, edge_type, from_id, to_id, idx
        FROM workflow_dag_edges WHERE workflow_dag_id = ?
        ORDER BY idx ASC
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(DagRows { dag, operators, artifacts, edges })
}

/// IDs of every DAG whose engine config has the given `type` tag.
pub async fn list_dag_ids_by_engine<'e, E>(executor: E, engine: &str) -> Result<Vec<Uuid>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id FROM workflow_dags
        WHERE json_extract(engine_config, '$.type') = ?
        ORDER BY created_at ASC
        "#,
    )
    .bind(engine)
    .fetch_all(executor)
    .await?;

    Ok(ids)
}

/// Most recently created DAG version of a workflow.
pub async fn get_latest_dag_id<'e, E>(executor: E, workflow_id: Uuid) -> Result<Uuid, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM workflow_dags WHERE workflow_id = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(workflow_id)
    .fetch_optional(executor)
    .await?
    .ok_or(DbError::NotFound)
}

/// Replace a DAG's engine config.
pub async fn update_engine_config<'e, E>(
    executor: E,
    id: Uuid,
    engine_config: serde_json::Value,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE workflow_dags SET engine_config = ? WHERE id = ?")
        .bind(engine_config)
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Refine an artifact's declared type.
pub async fn update_artifact_type<'e, E>(
    executor: E,
    id: Uuid,
    artifact_type: &str,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE artifacts SET type = ? WHERE id = ?")
        .bind(artifact_type)
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Fetch one artifact row.
pub async fn get_artifact<'e, E>(executor: E, id: Uuid) -> Result<ArtifactRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ArtifactRow>(
        "SELECT id, workflow_dag_id, name, description, type FROM artifacts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or(DbError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ARTIFACT_TO_OPERATOR, OPERATOR_TO_ARTIFACT};
    use crate::repository::{test_support::pool_in, workflows};
    use serde_json::json;

    async fn seed(pool: &DbPool, engine: serde_json::Value) -> DagRows {
        let workflow_id = Uuid::new_v4();
        workflows::create_workflow(pool, workflow_id, "wf", "", json!({}), json!({}))
            .await
            .unwrap();

        let dag_id = Uuid::new_v4();
        let op = Uuid::new_v4();
        let consumer = Uuid::new_v4();
        let artifact = Uuid::new_v4();
        let rows = DagRows {
            dag: WorkflowDagRow {
                id: dag_id,
                workflow_id,
                storage_config: json!({"type": "file", "directory": "/tmp"}),
                engine_config: engine,
                created_at: Utc::now(),
            },
            operators: vec![
                OperatorRow {
                    id: op,
                    workflow_dag_id: dag_id,
                    name: "extract".into(),
                    description: String::new(),
                    spec: json!({"type": "param", "value": "1"}),
                },
                OperatorRow {
                    id: consumer,
                    workflow_dag_id: dag_id,
                    name: "fn".into(),
                    description: String::new(),
                    spec: json!({"type": "param", "value": "2"}),
                },
            ],
            artifacts: vec![ArtifactRow {
                id: artifact,
                workflow_dag_id: dag_id,
                name: "out".into(),
                description: String::new(),
                artifact_type: "untyped".into(),
            }],
            edges: vec![
                EdgeRow {
                    workflow_dag_id: dag_id,
                    edge_type: OPERATOR_TO_ARTIFACT.into(),
                    from_id: op,
                    to_id: artifact,
                    idx: 0,
                },
                EdgeRow {
                    workflow_dag_id: dag_id,
                    edge_type: ARTIFACT_TO_OPERATOR.into(),
                    from_id: artifact,
                    to_id: consumer,
                    idx: 0,
                },
            ],
        };
        create_dag(pool, &rows).await.unwrap();
        rows
    }

    #[tokio::test]
    async fn dag_round_trips_with_nodes_and_edges() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        let rows = seed(&pool, json!({"type": "local"})).await;

        let fetched = get_dag(&pool, rows.dag.id).await.unwrap();
        assert_eq!(fetched.operators.len(), 2);
        assert_eq!(fetched.artifacts.len(), 1);
        assert_eq!(fetched.edges.len(), 2);
        assert_eq!(
            get_latest_dag_id(&pool, rows.dag.workflow_id).await.unwrap(),
            rows.dag.id
        );
    }

    #[tokio::test]
    async fn dags_are_selected_by_engine_tag() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        let local = seed(&pool, json!({"type": "local"})).await;
        let airflow = seed(&pool, json!({"type": "airflow", "dag_id": "x"})).await;

        let ids = list_dag_ids_by_engine(&pool, "airflow").await.unwrap();
        assert_eq!(ids, vec![airflow.dag.id]);
        assert!(!ids.contains(&local.dag.id));
    }

    #[tokio::test]
    async fn artifact_type_and_engine_config_updates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        let rows = seed(&pool, json!({"type": "local"})).await;
        let artifact_id = rows.artifacts[0].id;

        update_artifact_type(&pool, artifact_id, "table").await.unwrap();
        assert_eq!(get_artifact(&pool, artifact_id).await.unwrap().artifact_type, "table");

        update_engine_config(&pool, rows.dag.id, json!({"type": "airflow"}))
            .await
            .unwrap();
        let dag = get_dag(&pool, rows.dag.id).await.unwrap().dag;
        assert_eq!(dag.engine_config["type"], "airflow");

        assert!(matches!(
            update_artifact_type(&pool, Uuid::new_v4(), "table").await,
            Err(DbError::NotFound)
        ));
    }
}
