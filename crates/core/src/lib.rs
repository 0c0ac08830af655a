//! Receptionist Core
//!
//! Transport-free building blocks of the call bridge: audio frames, the
//! utterance segmenter, the call transcript, the booking collaborator contract
//! and the tool dispatcher that fronts it, plus PII redaction for log output.

pub mod audio;
pub mod booking;
pub mod redact;
pub mod segmenter;
pub mod tools;
pub mod transcript;
