//! HTTP implementation of [`RouteConnector`].
//!
//! Speaks the gateway's provider wire contract against each route's
//! endpoint: `GET /v1/models` as the capability probe, `GET /v1/balance`
//! for the remaining-credit query, and `POST /v1/jobs/status` for the bulk
//! job-status query. The per-call timeout is applied on every request.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::connector::{
    BoxFuture, ConnectorError, HttpClient, JobStatusUpdate, RouteConnector,
};
use crate::routes::Route;

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    remaining: f64,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    jobs: Vec<JobStatusUpdate>,
}

/// Connector that talks to providers over HTTP.
#[derive(Clone, Default)]
pub struct HttpConnector {
    client: HttpClient,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: HttpClient::new(),
        }
    }

    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }

    fn url(route: &Route, path: &str) -> String {
        format!("{}{}", route.endpoint.trim_end_matches('/'), path)
    }

    fn map_error(err: reqwest::Error, timeout: Duration) -> ConnectorError {
        if err.is_timeout() {
            ConnectorError::Timeout(timeout)
        } else {
            ConnectorError::Http(err)
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConnectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ConnectorError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

impl RouteConnector for HttpConnector {
    fn probe<'a>(
        &'a self,
        route: &'a Route,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), ConnectorError>> {
        Box::pin(async move {
            let response = self
                .client
                .inner()
                .get(Self::url(route, "/v1/models"))
                .bearer_auth(&route.api_key)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| Self::map_error(e, timeout))?;
            Self::check_status(response).await?;
            Ok(())
        })
    }

    fn balance<'a>(
        &'a self,
        route: &'a Route,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64, ConnectorError>> {
        Box::pin(async move {
            let response = self
                .client
                .inner()
                .get(Self::url(route, "/v1/balance"))
                .bearer_auth(&route.api_key)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| Self::map_error(e, timeout))?;
            let response = Self::check_status(response).await?;
            let body: BalanceResponse = response
                .json()
                .await
                .map_err(|e| ConnectorError::Malformed(e.to_string()))?;
            Ok(body.remaining)
        })
    }

    fn job_statuses<'a>(
        &'a self,
        route: &'a Route,
        handles: Vec<String>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<JobStatusUpdate>, ConnectorError>> {
        Box::pin(async move {
            let response = self
                .client
                .inner()
                .post(Self::url(route, "/v1/jobs/status"))
                .bearer_auth(&route.api_key)
                .timeout(timeout)
                .json(&json!({ "ids": handles }))
                .send()
                .await
                .map_err(|e| Self::map_error(e, timeout))?;
            let response = Self::check_status(response).await?;
            let body: JobStatusResponse = response
                .json()
                .await
                .map_err(|e| ConnectorError::Malformed(e.to_string()))?;
            Ok(body.jobs)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
