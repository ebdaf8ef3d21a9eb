//! HTTP implementation of [`TaskApi`] over `reqwest`.

use super::TaskApi;
use crate::error::{SyncError, SyncResult};
use crate::types::{
    Dependency, GraphAnalysis, Project, ProjectId, ProjectMember, Task, TaskId, TaskStatus, User,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Client for the task/project API and the scheduling analysis service.
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTaskApi {
    /// Build a client. `token` is passed through as a bearer token.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::transport)?;
        Ok(Self {
            client,
            base_url: normalize_base(base_url.into()),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        what: &str,
        path: &str,
        builder: RequestBuilder,
    ) -> SyncResult<T> {
        let response = builder.send().await.map_err(SyncError::transport)?;

        let status = response.status();
        if !status.is_success() {
            debug!(endpoint = path, status = status.as_u16(), "Request failed");
            return Err(SyncError::HttpStatus {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(SyncError::transport)?;
        serde_json::from_str(&body).map_err(|e| SyncError::decode(what, e))
    }

    async fn get<T: DeserializeOwned>(&self, what: &str, path: &str) -> SyncResult<T> {
        self.send(what, path, self.request(Method::GET, path)).await
    }
}

/// Strip trailing slashes so paths can be appended verbatim.
pub(crate) fn normalize_base(base: String) -> String {
    base.trim_end_matches('/').to_string()
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn list_projects(&self) -> SyncResult<Vec<Project>> {
        self.get("projects", "/projects/").await
    }

    async fn list_tasks(&self, project_id: ProjectId) -> SyncResult<Vec<Task>> {
        let path = "/tasks/";
        let builder = self
            .request(Method::GET, path)
            .query(&[("project_id", project_id)]);
        self.send("tasks", path, builder).await
    }

    async fn get_task_dependencies(&self, task_id: TaskId) -> SyncResult<Vec<Dependency>> {
        self.get("dependencies", &format!("/tasks/{task_id}/dependencies"))
            .await
    }

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> SyncResult<Task> {
        let path = format!("/tasks/{task_id}");
        let builder = self
            .request(Method::PATCH, &path)
            .json(&serde_json::json!({ "status": status }));
        self.send("task", &path, builder).await
    }

    async fn create_dependency(
        &self,
        task_id: TaskId,
        depends_on: TaskId,
    ) -> SyncResult<Dependency> {
        let path = "/tasks/dependencies";
        let builder = self
            .request(Method::POST, path)
            .json(&Dependency::new(task_id, depends_on));
        self.send("dependency", path, builder).await
    }

    async fn list_project_members(&self, project_id: ProjectId) -> SyncResult<Vec<ProjectMember>> {
        self.get("members", &format!("/projects/{project_id}/members"))
            .await
    }

    async fn get_graph_analysis(&self, project_id: ProjectId) -> SyncResult<GraphAnalysis> {
        self.get("graph analysis", &format!("/analysis/projects/{project_id}/graph"))
            .await
    }

    async fn current_user(&self) -> SyncResult<User> {
        self.get("user", "/auth/me").await
    }
}
