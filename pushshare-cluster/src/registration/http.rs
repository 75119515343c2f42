use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use pushshare_core::metrics;
use pushshare_core::models::{ConnectionId, InstanceId};

use super::{InstanceRegistry, Registration};
use crate::error::{Error, Result};

/// Error body the push server sends alongside non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// `InstanceRegistry` over the server's HTTP endpoints
#[derive(Debug, Clone)]
pub struct HttpRegistrationClient {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpRegistrationClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        Self::with_client(build_client()?, base_url, request_timeout)
    }

    /// Reuse an existing client, e.g. to share its connection pool with
    /// [`crate::relay::SseConnector::with_client`]
    pub fn with_client(client: Client, base_url: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            request_timeout,
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get(&self, operation: &'static str, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Configuration(format!("Invalid endpoint {path}: {e}")))?;

        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                metrics::REGISTRATION_FAILURES.with_label_values(&[operation]).inc();
                if e.is_timeout() {
                    Error::Timeout(format!("{operation} after {:?}", self.request_timeout))
                } else {
                    Error::RegistrationFailed(format!("{operation}: {e}"))
                }
            })?;

        if response.status().is_success() {
            return Ok(response);
        }

        metrics::REGISTRATION_FAILURES.with_label_values(&[operation]).inc();
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| status.to_string());
        Err(Error::RegistrationFailed(format!("{operation}: {message}")))
    }
}

#[async_trait]
impl InstanceRegistry for HttpRegistrationClient {
    async fn register_new(&self, existing: Option<ConnectionId>) -> Result<Registration> {
        let query: Vec<(&str, &str)> = existing
            .as_ref()
            .map(|id| vec![("connection_id", id.as_str())])
            .unwrap_or_default();

        let response = self.get("add_user", "add/user", &query).await?;
        let registration: Registration = response
            .json()
            .await
            .map_err(|e| Error::RegistrationFailed(format!("add_user: invalid response: {e}")))?;

        debug!(
            instance_id = %registration.instance_id,
            connection_id = %registration.connection_id,
            requested = ?existing,
            "Registered instance"
        );
        Ok(registration)
    }

    async fn change_connection(&self, instance_id: InstanceId, connection_id: ConnectionId) -> Result<()> {
        self.get(
            "update_user",
            "update/user",
            &[
                ("instance_id", instance_id.as_str()),
                ("connection_id", connection_id.as_str()),
            ],
        )
        .await?;
        debug!(instance_id = %instance_id, connection_id = %connection_id, "Instance moved to connection");
        Ok(())
    }

    async fn remove_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.get("remove_user", "remove/user", &[("instance_id", instance_id.as_str())])
            .await?;
        debug!(instance_id = %instance_id, "Instance removed");
        Ok(())
    }
}

/// HTTP client shared by the registration endpoints and the push stream
pub fn build_client() -> Result<Client> {
    Client::builder()
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))
}

/// Parse the server base URL so relative endpoint paths join beneath it
pub(crate) fn normalize_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| Error::Configuration(format!("Invalid server base URL {base_url}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
