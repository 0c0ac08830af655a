//! Tool Dispatcher
//!
//! The AI model asks the host to run tools mid-conversation. This module
//! declares the tool schemas advertised to the model, the invocation record a
//! call session keeps while a tool is outstanding, and the dispatcher that
//! routes a request to the booking collaborator.
//!
//! Every request produces a JSON result. Unknown tools, malformed arguments and
//! collaborator failures all become an `{"error": ...}` object, because the
//! model's turn cannot proceed until the call id receives some answer.

use crate::booking::{BookingOutcome, BookingRequest, BookingService};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::{fmt, sync::Arc};
use tracing::{info, warn};

/// The closed set of tools the host implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    FindAvailability,
    CreateBooking,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::FindAvailability, ToolKind::CreateBooking];

    /// Resolves the wire name used by the model. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "find_availability" => Some(ToolKind::FindAvailability),
            "create_booking" => Some(ToolKind::CreateBooking),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::FindAvailability => "find_availability",
            ToolKind::CreateBooking => "create_booking",
        }
    }

    fn description(self) -> &'static str {
        match self {
            ToolKind::FindAvailability => {
                "Get available time slots on a given date for a specific service."
            }
            ToolKind::CreateBooking => "Create a booking at a specified start time.",
        }
    }

    fn parameters(self) -> Value {
        match self {
            ToolKind::FindAvailability => parameters_schema::<FindAvailabilityArgs>(),
            ToolKind::CreateBooking => parameters_schema::<CreateBookingArgs>(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// --- Data Structures for Tools ---

/// Arguments for `find_availability`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct FindAvailabilityArgs {
    /// The service to look up, e.g. "massage" or "waxing".
    pub service: String,
    /// YYYY-MM-DD in spa local time
    pub date: String,
}

/// Arguments for `create_booking`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct CreateBookingArgs {
    /// The caller's name.
    pub name: String,
    /// The caller's callback number.
    pub phone: String,
    /// The service to book.
    pub service: String,
    /// ISO8601 start time in spa timezone
    pub start: String,
}

/// A function tool as advertised in the AI session handshake.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Builds the tool list sent to the model at session start.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolKind::ALL
        .into_iter()
        .map(|tool| ToolDefinition {
            kind: "function",
            name: tool.name(),
            description: tool.description(),
            parameters: tool.parameters(),
        })
        .collect()
}

/// Generates a bare JSON object schema for a tool's arguments.
fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}));
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

// --- Invocation Tracking ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Resolved,
    Failed,
}

/// A tool call requested by the model and tracked until its result is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    pub status: ToolStatus,
}

impl ToolInvocation {
    pub fn new(call_id: String, name: String, arguments: Map<String, Value>) -> Self {
        Self {
            call_id,
            name,
            arguments,
            status: ToolStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ToolStatus::Pending
    }

    /// Records the dispatch outcome. Only the first resolution takes effect.
    pub fn resolve(&mut self, status: ToolStatus) -> bool {
        if !self.is_pending() || status == ToolStatus::Pending {
            return false;
        }
        self.status = status;
        true
    }
}

/// The result to hand back to the model for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub result: Value,
}

impl ToolOutcome {
    fn resolved(result: Value) -> Self {
        Self {
            status: ToolStatus::Resolved,
            result,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            result: json!({ "error": message.into() }),
        }
    }
}

/// Reasons a dispatch fails before or during the collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown_tool")]
    UnknownTool,
    #[error("invalid_arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Upstream(String),
}

// --- Dispatcher ---

/// Routes tool requests to the booking collaborator.
pub struct ToolDispatcher {
    booking: Arc<dyn BookingService>,
}

impl ToolDispatcher {
    pub fn new(booking: Arc<dyn BookingService>) -> Self {
        Self { booking }
    }

    /// Runs one tool call to completion. Never fails and never panics on bad
    /// input; the returned outcome is always resolved or failed.
    pub async fn dispatch(&self, name: &str, arguments: &Map<String, Value>) -> ToolOutcome {
        let Some(tool) = ToolKind::from_name(name) else {
            warn!(tool = %name, "Model requested an unknown tool");
            return ToolOutcome::failed(ToolError::UnknownTool.to_string());
        };

        info!(%tool, "Executing tool");
        let result = match tool {
            ToolKind::FindAvailability => self.find_availability(arguments).await,
            ToolKind::CreateBooking => self.create_booking(arguments).await,
        };

        match result {
            Ok(value) => ToolOutcome::resolved(value),
            Err(e) => {
                let message = e.to_string();
                let error = crate::redact::redact_text(&message);
                warn!(%tool, %error, "Tool call failed");
                ToolOutcome::failed(e.to_string())
            }
        }
    }

    async fn find_availability(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let args: FindAvailabilityArgs = parse_arguments(arguments)?;
        NaiveDate::parse_from_str(&args.date, "%Y-%m-%d").map_err(|_| {
            ToolError::InvalidArguments(format!("date '{}' is not YYYY-MM-DD", args.date))
        })?;

        let slots = self
            .booking
            .find_availability(&args.service, &args.date)
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        Ok(json!({ "slots": slots }))
    }

    async fn create_booking(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let args: CreateBookingArgs = parse_arguments(arguments)?;
        let request = BookingRequest {
            name: args.name,
            phone: args.phone,
            service: args.service,
            start: args.start,
        };

        let outcome = self
            .booking
            .create_booking(&request)
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        Ok(match outcome {
            BookingOutcome::Confirmed { confirmation } => {
                json!({ "ok": true, "confirmation": confirmation })
            }
            BookingOutcome::Rejected { reason } => json!({ "ok": false, "reason": reason }),
        })
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: &Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(arguments.clone()))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{MockBookingService, TimeSlot};
    use anyhow::anyhow;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_tool_kind_names() {
        assert_eq!(ToolKind::from_name("find_availability"), Some(ToolKind::FindAvailability));
        assert_eq!(ToolKind::from_name("create_booking"), Some(ToolKind::CreateBooking));
        assert_eq!(ToolKind::from_name("cancel_booking"), None);
        assert_eq!(ToolKind::CreateBooking.to_string(), "create_booking");
    }

    #[test]
    fn test_tool_definitions_schema() {
        let tools = tool_definitions();
        assert_eq!(tools.len(), 2);

        let find = &tools[0];
        assert_eq!(find.kind, "function");
        assert_eq!(find.name, "find_availability");
        assert_eq!(find.parameters["type"], "object");
        assert!(find.parameters["properties"]["service"].is_object());
        assert!(find.parameters["properties"]["date"].is_object());
        assert!(find.parameters.get("$schema").is_none());

        let required: Vec<&str> = tools[1].parameters["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        for field in ["name", "phone", "service", "start"] {
            assert!(required.contains(&field), "missing required field {field}");
        }
    }

    #[test]
    fn test_invocation_resolves_once() {
        let mut invocation =
            ToolInvocation::new("call_1".into(), "find_availability".into(), Map::new());
        assert!(invocation.is_pending());
        assert!(!invocation.resolve(ToolStatus::Pending));
        assert!(invocation.resolve(ToolStatus::Failed));
        assert!(!invocation.resolve(ToolStatus::Resolved));
        assert_eq!(invocation.status, ToolStatus::Failed);
    }

    #[tokio::test]
    async fn test_find_availability_empty_slots() {
        let mut booking = MockBookingService::new();
        booking
            .expect_find_availability()
            .withf(|service, date| service == "massage" && date == "2024-06-01")
            .times(1)
            .returning(|_, _| Ok(vec![]));
        let dispatcher = ToolDispatcher::new(Arc::new(booking));

        let outcome = dispatcher
            .dispatch(
                "find_availability",
                &args(json!({"service": "massage", "date": "2024-06-01"})),
            )
            .await;

        assert_eq!(outcome.status, ToolStatus::Resolved);
        assert_eq!(outcome.result, json!({"slots": []}));
    }

    #[tokio::test]
    async fn test_find_availability_returns_slots() {
        let mut booking = MockBookingService::new();
        booking.expect_find_availability().returning(|_, _| {
            Ok(vec![TimeSlot {
                start_at: "2024-06-01T10:00:00-04:00".into(),
                end_at: "2024-06-01T11:00:00-04:00".into(),
                service_variation_id: Some("VAR1".into()),
            }])
        });
        let dispatcher = ToolDispatcher::new(Arc::new(booking));

        let outcome = dispatcher
            .dispatch(
                "find_availability",
                &args(json!({"service": "massage", "date": "2024-06-01"})),
            )
            .await;

        assert_eq!(outcome.result["slots"][0]["service_variation_id"], "VAR1");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dispatcher = ToolDispatcher::new(Arc::new(MockBookingService::new()));
        let outcome = dispatcher.dispatch("cancel_booking", &Map::new()).await;

        assert_eq!(outcome.status, ToolStatus::Failed);
        assert_eq!(outcome.result, json!({"error": "unknown_tool"}));
    }

    #[tokio::test]
    async fn test_collaborator_error_becomes_result() {
        let mut booking = MockBookingService::new();
        booking
            .expect_create_booking()
            .times(1)
            .returning(|_| Err(anyhow!("backend unavailable")));
        let dispatcher = ToolDispatcher::new(Arc::new(booking));

        let outcome = dispatcher
            .dispatch(
                "create_booking",
                &args(json!({
                    "name": "Ann",
                    "phone": "+1 212 555 0100",
                    "service": "massage",
                    "start": "2024-06-01T10:00:00-04:00"
                })),
            )
            .await;

        assert_eq!(outcome.status, ToolStatus::Failed);
        assert_eq!(outcome.result, json!({"error": "backend unavailable"}));
    }

    #[tokio::test]
    async fn test_create_booking_outcomes() {
        let mut booking = MockBookingService::new();
        booking
            .expect_create_booking()
            .withf(|req| req.service == "waxing" && req.start == "2024-06-01T09:00:00-04:00")
            .returning(|_| {
                Ok(BookingOutcome::Confirmed {
                    confirmation: "BK-42".into(),
                })
            });
        let dispatcher = ToolDispatcher::new(Arc::new(booking));

        let outcome = dispatcher
            .dispatch(
                "create_booking",
                &args(json!({
                    "name": "Ann",
                    "phone": "2125550100",
                    "service": "waxing",
                    "start": "2024-06-01T09:00:00-04:00"
                })),
            )
            .await;

        assert_eq!(outcome.status, ToolStatus::Resolved);
        assert_eq!(outcome.result, json!({"ok": true, "confirmation": "BK-42"}));

        let dispatcher = ToolDispatcher::new(Arc::new(crate::booking::StubBookingService));
        let outcome = dispatcher
            .dispatch(
                "create_booking",
                &args(json!({
                    "name": "Ann",
                    "phone": "2125550100",
                    "service": "waxing",
                    "start": "2024-06-01T09:00:00-04:00"
                })),
            )
            .await;
        assert_eq!(outcome.result["ok"], false);
        assert!(outcome.result["reason"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_collaborator() {
        // No expectations: any collaborator call would panic the mock.
        let dispatcher = ToolDispatcher::new(Arc::new(MockBookingService::new()));

        let missing = dispatcher
            .dispatch("find_availability", &args(json!({"service": "massage"})))
            .await;
        assert_eq!(missing.status, ToolStatus::Failed);
        assert!(
            missing.result["error"]
                .as_str()
                .unwrap()
                .starts_with("invalid_arguments")
        );

        let bad_date = dispatcher
            .dispatch(
                "find_availability",
                &args(json!({"service": "massage", "date": "June 1st"})),
            )
            .await;
        assert_eq!(bad_date.status, ToolStatus::Failed);
        assert!(bad_date.result["error"].as_str().unwrap().contains("YYYY-MM-DD"));
    }
}
