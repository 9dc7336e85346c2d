//! Runtime agent HTTP client
//!
//! Implements [`RuntimeDriver`] against the node agent REST API:
//! `POST /api/v1/machines/{namespace}/{name}/{operation}` and
//! `GET /api/v1/machines/{namespace}/{name}/state`.

use crate::driver_trait::RuntimeDriver;
use crate::error::RuntimeError;
use crate::models::{PowerOperation, PowerRequest, RuntimeState, StateResponse, VmIdentity};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// HTTP runtime driver
pub struct HttpRuntimeDriver {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRuntimeDriver {
    /// Create a new runtime client
    ///
    /// # Arguments
    /// * `base_url` - Agent base URL (e.g., "http://vm-runtime:8080")
    /// * `token` - Optional bearer token
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, RuntimeError> {
        // Power operations can take minutes; the controller applies its own
        // per-call deadline on top of this.
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(RuntimeError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the agent answers on its health endpoint.
    pub async fn validate_connectivity(&self) -> Result<(), RuntimeError> {
        let url = format!("{}/healthz", self.base_url);
        debug!("Validating runtime connectivity at {}", url);

        let response = self.authorized(self.client.get(&url)).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Api(format!("Health check failed: {} - {}", status, body)));
        }
        Ok(())
    }

    fn machine_url(&self, vm: &VmIdentity, suffix: &str) -> String {
        format!(
            "{}/api/v1/machines/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&vm.namespace),
            urlencoding::encode(&vm.name),
            suffix
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_operation(&self, operation: PowerOperation, vm: &VmIdentity) -> Result<(), RuntimeError> {
        let url = self.machine_url(vm, operation.as_str());
        debug!("POST {}", url);

        let body = PowerRequest { image: vm.image.clone() };
        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &format!("{} {}", operation, vm), body))
    }
}

#[async_trait::async_trait]
impl RuntimeDriver for HttpRuntimeDriver {
    async fn power_on(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.post_operation(PowerOperation::PowerOn, vm).await
    }

    async fn power_off(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.post_operation(PowerOperation::PowerOff, vm).await
    }

    async fn hibernate(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.post_operation(PowerOperation::Hibernate, vm).await
    }

    async fn resume(&self, vm: &VmIdentity) -> Result<(), RuntimeError> {
        self.post_operation(PowerOperation::Resume, vm).await
    }

    async fn query_state(&self, vm: &VmIdentity) -> Result<RuntimeState, RuntimeError> {
        let url = self.machine_url(vm, "state");
        debug!("GET {}", url);

        let response = self.authorized(self.client.get(&url)).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &format!("state of {}", vm), body));
        }

        let text = response.text().await.map_err(classify)?;
        let parsed: StateResponse = serde_json::from_str(&text)?;
        Ok(RuntimeState::from_wire(&parsed.state))
    }
}

/// Map transport failures onto the runtime error taxonomy.
fn classify(err: reqwest::Error) -> RuntimeError {
    if err.is_timeout() {
        RuntimeError::Timeout(err.to_string())
    } else if err.is_connect() {
        RuntimeError::Unreachable(err.to_string())
    } else {
        RuntimeError::Http(err)
    }
}

/// Map a non-success HTTP status onto the runtime error taxonomy.
fn error_for_status(status: StatusCode, what: &str, body: String) -> RuntimeError {
    match status {
        StatusCode::NOT_FOUND => RuntimeError::NotFound(format!("{}: {}", what, body)),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            RuntimeError::OperationFailed(format!("{}: {}", what, body))
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            RuntimeError::Timeout(format!("{}: {}", what, body))
        }
        StatusCode::TOO_MANY_REQUESTS => RuntimeError::Api(format!("{} throttled: {}", what, body)),
        // The runtime refused the request outright, so nothing changed
        s if s.is_client_error() => RuntimeError::OperationFailed(format!("{}: {} - {}", what, status, body)),
        _ => RuntimeError::Api(format!("{} failed: {} - {}", what, status, body)),
    }
}
