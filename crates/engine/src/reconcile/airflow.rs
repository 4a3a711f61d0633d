//! Airflow stable REST API client (`/api/v1`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;
use uuid::Uuid;

use super::{ExternalScheduler, RemoteDag, RemoteDagRun, SchedulerConnector, TaskState};
use crate::error::EngineError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Entries requested per page of a collection endpoint.
const PAGE_SIZE: usize = 100;

/// Basic-auth credentials for one Airflow deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AirflowCredentials {
    /// Webserver base URL, e.g. `http://airflow:8080`.
    pub host: String,
    pub username: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DagTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DagResponse {
    dag_id: String,
    #[serde(default)]
    tags: Option<Vec<DagTag>>,
}

#[derive(Debug, Deserialize)]
struct DagRunPage {
    #[serde(default)]
    dag_runs: Vec<RemoteDagRun>,
    #[serde(default)]
    total_entries: usize,
}

#[derive(Debug, Deserialize)]
struct TaskInstance {
    task_id: String,
    #[serde(default)]
    state: Option<TaskState>,
}

#[derive(Debug, Deserialize)]
struct TaskInstancePage {
    #[serde(default)]
    task_instances: Vec<TaskInstance>,
    #[serde(default)]
    total_entries: usize,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AirflowClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl AirflowClient {
    pub fn new(credentials: &AirflowCredentials) -> Result<Self, EngineError> {
        let base_url = Url::parse(&credentials.host).map_err(|e| {
            EngineError::Scheduler(format!("invalid Airflow host '{}': {e}", credentials.host))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(EngineError::Scheduler(format!(
                "invalid Airflow host '{}': not a base URL",
                credentials.host
            )));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        })
    }

    /// Check the credentials with a cheap authenticated request.
    pub async fn authenticate(&self) -> Result<(), EngineError> {
        let url = self.url(&["dags"])?;
        let _: serde_json::Value = self.get(url, &[("limit", "1".to_owned())]).await?;
        Ok(())
    }

    /// `{base}/api/v1/{segments...}`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, EngineError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                EngineError::Scheduler(format!("{} cannot be a base URL", self.base_url))
            })?;
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, EngineError> {
        debug!(%url, "GET");
        let response = self
            .http
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Scheduler(format!("{status} from {url}: {body}")));
        }
        Ok(response.json::<T>().await?)
    }
}

fn page_query(offset: usize) -> [(&'static str, String); 2] {
    [("limit", PAGE_SIZE.to_string()), ("offset", offset.to_string())]
}

#[async_trait]
impl ExternalScheduler for AirflowClient {
    async fn get_dag(&self, dag_id: &str) -> Result<RemoteDag, EngineError> {
        let dag: DagResponse = self.get(self.url(&["dags", dag_id])?, &[]).await?;
        Ok(RemoteDag {
            dag_id: dag.dag_id,
            tags: dag.tags.unwrap_or_default().into_iter().map(|t| t.name).collect(),
        })
    }

    async fn get_dag_runs(&self, dag_id: &str) -> Result<Vec<RemoteDagRun>, EngineError> {
        let url = self.url(&["dags", dag_id, "dagRuns"])?;
        let mut runs = Vec::new();
        loop {
            let page: DagRunPage = self.get(url.clone(), &page_query(runs.len())).await?;
            let fetched = page.dag_runs.len();
            runs.extend(page.dag_runs);
            if fetched == 0 || runs.len() >= page.total_entries {
                break;
            }
        }
        Ok(runs)
    }

    async fn get_task_states(
        &self,
        dag_id: &str,
        dag_run_id: &str,
    ) -> Result<HashMap<String, TaskState>, EngineError> {
        let url = self.url(&["dags", dag_id, "dagRuns", dag_run_id, "taskInstances"])?;
        let mut states = HashMap::new();
        let mut offset = 0;
        loop {
            let page: TaskInstancePage = self.get(url.clone(), &page_query(offset)).await?;
            let fetched = page.task_instances.len();
            offset += fetched;
            states.extend(
                page.task_instances
                    .into_iter()
                    .map(|t| (t.task_id, t.state.unwrap_or(TaskState::None))),
            );
            if fetched == 0 || offset >= page.total_entries {
                break;
            }
        }
        Ok(states)
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connects to Airflow deployments using credentials keyed by integration.
#[derive(Debug, Clone, Default)]
pub struct AirflowConnector {
    credentials: HashMap<Uuid, AirflowCredentials>,
}

impl AirflowConnector {
    pub fn new(credentials: HashMap<Uuid, AirflowCredentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SchedulerConnector for AirflowConnector {
    async fn connect(&self, integration_id: Uuid) -> Result<Arc<dyn ExternalScheduler>, EngineError> {
        let credentials = self.credentials.get(&integration_id).ok_or_else(|| {
            EngineError::Scheduler(format!("no Airflow credentials for integration {integration_id}"))
        })?;
        let client = AirflowClient::new(credentials)?;
        client.authenticate().await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::RemoteRunState;

    fn client(host: &str) -> AirflowClient {
        AirflowClient::new(&AirflowCredentials {
            host: host.into(),
            username: "admin".into(),
            password: "admin".into(),
        })
        .unwrap()
    }

    #[test]
    fn urls_are_rooted_at_the_api_and_encoded() {
        let url = client("http://airflow:8080/").url(&["dags", "my dag", "dagRuns"]).unwrap();
        assert_eq!(url.as_str(), "http://airflow:8080/api/v1/dags/my%20dag/dagRuns");

        let url = client("https://example.com/airflow").url(&["dags", "etl"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/airflow/api/v1/dags/etl");
    }

    #[test]
    fn invalid_hosts_are_rejected() {
        let creds = AirflowCredentials {
            host: "not a url".into(),
            username: String::new(),
            password: String::new(),
        };
        assert!(matches!(AirflowClient::new(&creds), Err(EngineError::Scheduler(_))));
    }

    #[test]
    fn dag_run_pages_parse() {
        let page: DagRunPage = serde_json::from_str(
            r#"{
                "dag_runs": [
                    {"dag_run_id": "scheduled__1", "start_date": "2024-03-01T12:00:00.123456+00:00",
                     "end_date": null, "state": "running", "conf": {}},
                    {"dag_run_id": "manual__2", "start_date": null, "state": "queued"},
                    {"dag_run_id": "manual__3", "start_date": "2024-03-01T13:00:00+00:00",
                     "end_date": "2024-03-01T13:05:00+00:00", "state": "success"}
                ],
                "total_entries": 3
            }"#,
        )
        .unwrap();

        assert_eq!(page.total_entries, 3);
        assert_eq!(page.dag_runs[0].state, RemoteRunState::Running);
        assert!(page.dag_runs[0].start_date.is_some());
        assert!(page.dag_runs[1].start_date.is_none());
        assert!(page.dag_runs[2].state.is_terminal());
    }

    #[test]
    fn task_instances_without_state_are_pending() {
        let page: TaskInstancePage = serde_json::from_str(
            r#"{"task_instances": [
                {"task_id": "extract", "state": "success"},
                {"task_id": "load", "state": null}
            ], "total_entries": 2}"#,
        )
        .unwrap();

        let states: HashMap<_, _> = page
            .task_instances
            .into_iter()
            .map(|t| (t.task_id, t.state.unwrap_or(TaskState::None)))
            .collect();
        assert_eq!(states["extract"], TaskState::Success);
        assert_eq!(states["load"], TaskState::None);
    }

    #[tokio::test]
    async fn connector_requires_known_integration() {
        let connector = AirflowConnector::default();
        let err = connector.connect(Uuid::new_v4()).await.err().unwrap();
        assert!(matches!(err, EngineError::Scheduler(_)));
    }
}
