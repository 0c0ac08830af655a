//! Receptionist Gateway Library Crate
//!
//! Everything the voice gateway service runs on: configuration, the session
//! registry, shared application state, the HTTP handlers and router, and the
//! WebSocket bridge between the carrier media stream and the AI realtime
//! socket. The binaries in `bin/` are thin wrappers around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
