//! Route model and persistence.
//!
//! A route is one configured upstream provider connection. Routes own the
//! authoritative copy of group/model membership; the ability table and the
//! in-memory cache are projections derived from them.

pub mod cache;
pub mod store;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use self::cache::{AbilityCache, AbilitySnapshot, RouteCandidate};
pub use self::store::RouteStore;

// ---------------------------------------------------------------------------
// RouteStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a route.
///
/// `Testing` is transient: it marks a route with an in-flight health probe so
/// the same route is never probed twice concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    #[default]
    Enabled,
    Disabled,
    Testing,
}

impl std::fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

impl FromStr for RouteStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "testing" => Ok(Self::Testing),
            _ => Err(format!("Unknown route status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// A configured upstream provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    /// Provider kind (opaque to the core, e.g. "openai").
    pub kind: String,
    pub endpoint: String,
    pub api_key: String,
    /// Groups this route serves.
    pub groups: Vec<String>,
    /// Model names this route can serve.
    pub models: Vec<String>,
    /// Lower tier preferred.
    pub priority: i64,
    /// Weight within the priority tier.
    pub weight: u32,
    pub status: RouteStatus,
    /// Last known remaining balance at the provider.
    pub balance: f64,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<String>,
}

impl Route {
    /// Minimal constructor used by tests and the admin surface; ids are
    /// generated when empty.
    pub fn new(name: &str, endpoint: &str, groups: &[&str], models: &[&str]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: "openai".to_string(),
            endpoint: endpoint.to_string(),
            api_key: String::new(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            models: models.iter().map(|s| s.to_string()).collect(),
            priority: 0,
            weight: 1,
            status: RouteStatus::Enabled,
            balance: 0.0,
            consecutive_failures: 0,
            last_checked_at: None,
        }
    }
}

/// Split a comma-separated column into trimmed, non-empty parts.
pub(crate) fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Join parts back into the comma-separated column form.
pub(crate) fn join_csv(parts: &[String]) -> String {
    parts.join(",")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
