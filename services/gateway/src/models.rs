//! HTTP Models
//!
//! Response bodies for the gateway's REST endpoints, annotated for the
//! `utoipa` OpenAPI document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    /// Calls accepted since the process started.
    pub total: u64,
    /// Calls currently in progress.
    pub active: u64,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "voice-gateway")]
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub calls: CallCounts,
    #[schema(example = "0.1.0")]
    pub version: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct ReadyResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
