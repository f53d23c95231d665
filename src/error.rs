use crate::connector::ConnectorError;

/// Unified application error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Orphaned ability: ({group}, {model}) references missing route {route_id}")]
    OrphanedAbility {
        group: String,
        model: String,
        route_id: String,
    },

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Startup cache build failed after repair: {0}")]
    StartupBuild(String),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}
