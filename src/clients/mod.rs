use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::models::{ApiMethod, Tenant};
use crate::normalize::SourceKind;

pub mod graph;
pub mod powershell;

pub use graph::GraphClient;
pub use powershell::PowershellClient;

/// One trace record exactly as the backend returned it.
pub type RawTrace = serde_json::Value;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The tenant record is missing or holds unusable credentials.
    #[error("configuration error: {0}")]
    Config(String),

    /// The identity provider rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The API call itself failed.
    #[error("api error: {0}")]
    Api(String),

    /// The tenant's API surface does not expose message traces; the
    /// orchestrator may retry on the other backend.
    #[error("message trace capability not available: {0}")]
    CapabilityNotAvailable(String),

    /// This backend has no implementation of the requested operation.
    #[error("operation not supported by this backend")]
    NotSupported,

    #[error("operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Api(e.to_string())
    }
}

/// A transport that can pull message traces for one tenant.
#[async_trait(?Send)]
pub trait TraceClient {
    fn name(&self) -> &str;

    /// Which normalization table applies to this backend's records.
    fn source(&self) -> SourceKind;

    /// Acquires or refreshes credentials. Called once before fetching;
    /// backends may also re-authenticate internally.
    async fn authenticate(&mut self) -> Result<(), ClientError>;

    async fn fetch_traces(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<RawTrace>, ClientError>;

    /// Lists the tenant's verified domains. Optional capability.
    async fn list_verified_domains(&mut self) -> Result<Vec<String>, ClientError> {
        Err(ClientError::NotSupported)
    }
}

/// Builds the transport for a tenant's configured api_method.
pub fn client_for_tenant(tenant: &Tenant) -> Result<Box<dyn TraceClient>, ClientError> {
    client_for_method(tenant.api_method, tenant)
}

/// Builds a specific transport regardless of the tenant's configured
/// api_method; the orchestrator uses this for the fallback path.
pub fn client_for_method(
    method: ApiMethod,
    tenant: &Tenant,
) -> Result<Box<dyn TraceClient>, ClientError> {
    match method {
        ApiMethod::Graph => Ok(Box::new(GraphClient::new(tenant)?)),
        ApiMethod::Powershell => Ok(Box::new(PowershellClient::new(tenant)?)),
    }
}
