//! Utterance Segmenter
//!
//! Decides when the caller has finished speaking. The policy is a debounced
//! edge trigger over inbound frame arrivals: once a quiet gap of at least the
//! configured threshold follows the last forwarded frame, a single
//! [`SegmenterSignal::CommitAndRespond`] is produced, and nothing more until
//! fresh audio re-arms it.
//!
//! Two entry points feed the same state. [`UtteranceSegmenter::on_inbound_frame`]
//! is evaluated on every frame arrival; [`UtteranceSegmenter::poll`] is driven by
//! the caller's quiet timer armed at [`UtteranceSegmenter::deadline`], so a gap
//! that is never followed by another frame still gets committed.

use std::time::Duration;
use tokio::time::Instant;

/// Reference quiet threshold for telephony audio.
pub const DEFAULT_QUIET_THRESHOLD: Duration = Duration::from_millis(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterSignal {
    /// Commit the buffered input and ask the model to respond.
    CommitAndRespond,
}

#[derive(Debug, Clone)]
pub struct UtteranceSegmenter {
    quiet_threshold: Duration,
    last_frame_at: Option<Instant>,
    /// True while audio has been appended since the last commit.
    armed: bool,
}

impl UtteranceSegmenter {
    pub fn new(quiet_threshold: Duration) -> Self {
        Self {
            quiet_threshold,
            last_frame_at: None,
            armed: false,
        }
    }

    /// Records an inbound frame that is about to be forwarded.
    ///
    /// If the gap since the previous frame already reached the threshold and
    /// that utterance was never committed, the commit is returned here and must
    /// be sent before the new frame.
    pub fn on_inbound_frame(&mut self, now: Instant) -> Option<SegmenterSignal> {
        let signal = self.poll(now);
        self.last_frame_at = Some(now);
        self.armed = true;
        signal
    }

    /// Re-evaluates the quiet gap without a new frame.
    pub fn poll(&mut self, now: Instant) -> Option<SegmenterSignal> {
        match self.last_frame_at {
            Some(last)
                if self.armed && now.saturating_duration_since(last) >= self.quiet_threshold =>
            {
                self.armed = false;
                Some(SegmenterSignal::CommitAndRespond)
            }
            _ => None,
        }
    }

    /// When the quiet timer should fire, if an uncommitted utterance exists.
    pub fn deadline(&self) -> Option<Instant> {
        match self.last_frame_at {
            Some(last) if self.armed => Some(last + self.quiet_threshold),
            _ => None,
        }
    }

    /// Drops any uncommitted audio state, e.g. when the session stops forwarding.
    pub fn reset(&mut self) {
        self.armed = false;
    }
}

impl Default for UtteranceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_THRESHOLD)
    }
}
