//! Booking Collaborator
//!
//! The scheduling backend lives outside this system. This module fixes the
//! contract the tool dispatcher talks to, so a real backend, a test double or
//! the built-in stub can be swapped in without touching the call bridge.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An open slot returned by an availability lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_at: String,
    pub end_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_variation_id: Option<String>,
}

/// Everything needed to place a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub name: String,
    pub phone: String,
    pub service: String,
    pub start: String,
}

/// The backend's answer to a booking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Confirmed { confirmation: String },
    Rejected { reason: String },
}

/// Defines the contract for any scheduling backend.
///
/// Errors returned here are never fatal to a call: the dispatcher converts them
/// into an `{error: ...}` tool result for the model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Lists open slots for `service` on `date` (`YYYY-MM-DD`, spa local time).
    async fn find_availability(&self, service: &str, date: &str) -> Result<Vec<TimeSlot>>;

    /// Attempts to book `request.start` (ISO 8601, spa local time).
    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingOutcome>;
}

/// A `BookingService` used when no scheduling backend is wired in.
///
/// It reports no availability and declines every booking, which lets calls run
/// end to end while the model tells the caller it cannot book right now.
pub struct StubBookingService;

#[async_trait]
impl BookingService for StubBookingService {
    async fn find_availability(&self, _service: &str, _date: &str) -> Result<Vec<TimeSlot>> {
        Ok(Vec::new())
    }

    async fn create_booking(&self, _request: &BookingRequest) -> Result<BookingOutcome> {
        Ok(BookingOutcome::Rejected {
            reason: "booking backend not configured".to_string(),
        })
    }
}
