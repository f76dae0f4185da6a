use anyhow::{Context, Result, bail};
use reqwest::Client;
use uuid::Uuid;

use crate::models::AgentConfig;
use crate::server::{
    AgentsResponse, ExecuteRequest, ExecuteResponse, ExecutionDto, RegisterResponse,
};

/// Client for the control plane HTTP API.
#[derive(Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ControlClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Check if the service is healthy.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to send health request")?;

        if resp.status().is_success() {
            Ok(())
        } else {
            bail!("health check failed with status: {}", resp.status())
        }
    }

    pub async fn register_agent(&self, config: &AgentConfig) -> Result<RegisterResponse> {
        let url = format!("{}/api/agents/register", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(config)
            .send()
            .await
            .context("failed to send register request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("register agent failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode register response")
    }

    pub async fn list_agents(&self, name: Option<&str>) -> Result<AgentsResponse> {
        let url = format!("{}/api/agents", self.base_url);
        let mut req = self.client.get(&url).header("x-api-key", &self.api_key);
        if let Some(name) = name {
            req = req.query(&[("name", name)]);
        }
        let resp = req.send().await.context("failed to send agents request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("list agents failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode agents response")
    }

    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let url = format!("{}/api/execute", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .context("failed to send execute request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("execute failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode execute response")
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionDto> {
        let url = format!("{}/api/executions/{}", self.base_url, id);
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .context("failed to send execution request")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("execution {} not found", id);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("get execution failed with status {}: {}", status, body);
        }
        resp.json().await.context("failed to decode execution response")
    }
}
