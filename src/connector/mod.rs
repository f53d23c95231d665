//! Provider connections.
//!
//! Defines the `RouteConnector` trait the background loops drive: a
//! capability probe, a balance query, and a bulk job-status query. Every
//! call carries an explicit timeout and returns a typed result; connectors
//! never panic across the boundary.

pub mod client;
pub mod http;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::routes::Route;

pub use self::client::HttpClient;
pub use self::http::HttpConnector;

/// Boxed future alias so the trait stays dyn-compatible without a macro.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ConnectorError
// ---------------------------------------------------------------------------

/// Errors that can occur talking to a provider.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Bulk job status types
// ---------------------------------------------------------------------------

/// Provider-reported outcome for one externally-executing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    InProgress,
    Succeeded,
    Failed,
}

/// One entry of a bulk status response, keyed by the provider job handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub handle: String,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// RouteConnector trait
// ---------------------------------------------------------------------------

/// Operations the orchestration core performs against a route's provider.
///
/// Async methods return boxed futures so the trait is dyn-compatible (can be
/// used as `Arc<dyn RouteConnector>`). No `async_trait` macro is needed.
pub trait RouteConnector: Send + Sync {
    /// Lightweight capability probe: can the route serve requests right now?
    fn probe<'a>(
        &'a self,
        route: &'a Route,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), ConnectorError>>;

    /// Query the remaining balance/credit at the provider.
    fn balance<'a>(
        &'a self,
        route: &'a Route,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64, ConnectorError>>;

    /// Bulk status query for a batch of job handles belonging to this route.
    fn job_statuses<'a>(
        &'a self,
        route: &'a Route,
        handles: Vec<String>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<JobStatusUpdate>, ConnectorError>>;
}
