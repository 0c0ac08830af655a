//! Audio frames exchanged between the carrier and the AI model.
//!
//! Payloads are opaque companded bytes (8 kHz mono μ-law for a typical call).
//! Nothing in this crate decodes or transforms them.

use bytes::Bytes;
use tokio::time::Instant;

/// Which way a frame is travelling relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller audio arriving from the carrier.
    Inbound,
    /// Model audio heading back to the carrier.
    Outbound,
}

/// A single chunk of audio. Frames are immutable and moved, never cloned,
/// so each one is consumed exactly once.
#[derive(Debug)]
pub struct AudioFrame {
    payload: Bytes,
    received_at: Instant,
    direction: Direction,
}

impl AudioFrame {
    pub fn new(payload: Bytes, received_at: Instant, direction: Direction) -> Self {
        Self {
            payload,
            received_at,
            direction,
        }
    }

    pub fn inbound(payload: Bytes, received_at: Instant) -> Self {
        Self::new(payload, received_at, Direction::Inbound)
    }

    pub fn outbound(payload: Bytes, received_at: Instant) -> Self {
        Self::new(payload, received_at, Direction::Outbound)
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consumes the frame, handing its payload to the next hop.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
