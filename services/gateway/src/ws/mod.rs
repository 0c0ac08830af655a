//! WebSocket bridge between the carrier and the AI model.
//!
//! - `protocol`: wire codecs for both sides.
//! - `call`: the per-call state machine.
//! - `link`: socket reader/writer tasks.
//! - `provider`: dials the AI realtime endpoint.
//! - `session`: the upgrade handler and the per-call runtime.

pub mod call;
pub mod link;
pub mod protocol;
pub mod provider;
pub mod session;

pub use session::ws_handler;
