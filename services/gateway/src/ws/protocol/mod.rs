//! Wire codecs for the two sockets a call bridges.
//!
//! - `carrier`: the telephony carrier's media-stream frames.
//! - `realtime`: the AI model's realtime client and server events.
//!
//! Both are stateless: text in, typed events out, and typed commands back to
//! text. Audio payloads cross this boundary as opaque bytes.

pub mod carrier;
pub mod realtime;
