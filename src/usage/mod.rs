//! Usage metering.
//!
//! The request path hands finished-request usage events to the batch
//! writer; a background flusher amortizes the store writes.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::writer::UsageBatchWriter;

/// One billed request, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub route_id: String,
    pub requester_id: String,
    pub model: String,
    pub cost: f64,
    pub prompt_units: u32,
    pub completion_units: u32,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        route_id: &str,
        requester_id: &str,
        model: &str,
        cost: f64,
        prompt_units: u32,
        completion_units: u32,
    ) -> Self {
        Self {
            route_id: route_id.to_string(),
            requester_id: requester_id.to_string(),
            model: model.to_string(),
            cost,
            prompt_units,
            completion_units,
            created_at: Utc::now(),
        }
    }
}
