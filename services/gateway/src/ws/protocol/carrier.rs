//! Codec for the carrier's media-stream protocol (Twilio Media Streams).
//!
//! Inbound frames are JSON text tagged by `event`. Audio payloads are base64
//! on the wire and raw bytes everywhere else; this module is the only place
//! that converts between the two.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// A decoded inbound carrier frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierEvent {
    Connected,
    Started(StreamStart),
    Media(MediaChunk),
    Stop,
    Mark { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub stream_id: String,
    pub call_id: String,
    pub account_id: Option<String>,
    pub tracks: Vec<String>,
    pub media_format: MediaFormat,
    pub custom_parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub payload: Bytes,
    pub track: Option<String>,
    pub chunk: Option<String>,
    pub timestamp: Option<String>,
}

/// Frames sent back to the carrier.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierCommand {
    Media { stream_id: String, payload: Bytes },
    Mark { stream_id: String, name: String },
    Clear { stream_id: String },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CarrierDecodeError {
    #[error("carrier frame is not a JSON object: {0}")]
    NotJson(String),
    #[error("carrier frame has no event tag")]
    MissingEvent,
    #[error("unknown carrier event '{0}'")]
    UnknownEvent(String),
    #[error("malformed '{event}' frame: {reason}")]
    Malformed { event: String, reason: String },
}

impl CarrierDecodeError {
    /// Control frames that cannot be decoded leave the call in an unknown
    /// state; everything else is dropped and the call continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CarrierDecodeError::Malformed { event, .. } if event == "start" || event == "stop"
        )
    }
}

// --- Wire Types ---

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Connected {},
    Start { start: StartBody },
    Media { media: MediaBody },
    Stop {},
    Mark { mark: MarkBody },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    stream_sid: String,
    call_sid: String,
    account_sid: Option<String>,
    #[serde(default)]
    tracks: Vec<String>,
    media_format: MediaFormat,
    #[serde(default)]
    custom_parameters: Map<String, Value>,
}

#[derive(Deserialize)]
struct MediaBody {
    payload: String,
    track: Option<String>,
    chunk: Option<String>,
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct MarkBody {
    name: String,
}

const KNOWN_EVENTS: &[&str] = &["connected", "start", "media", "stop", "mark"];

/// Decodes one text frame from the carrier.
pub fn decode(text: &str) -> Result<CarrierEvent, CarrierDecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CarrierDecodeError::NotJson(e.to_string()))?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or(CarrierDecodeError::MissingEvent)?
        .to_string();
    if !KNOWN_EVENTS.contains(&event.as_str()) {
        return Err(CarrierDecodeError::UnknownEvent(event));
    }

    let malformed = |reason: String| CarrierDecodeError::Malformed {
        event: event.clone(),
        reason,
    };
    let frame: InboundFrame = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

    Ok(match frame {
        InboundFrame::Connected {} => CarrierEvent::Connected,
        InboundFrame::Start { start } => CarrierEvent::Started(StreamStart {
            stream_id: start.stream_sid,
            call_id: start.call_sid,
            account_id: start.account_sid,
            tracks: start.tracks,
            media_format: start.media_format,
            custom_parameters: start.custom_parameters,
        }),
        InboundFrame::Media { media } => {
            let payload = STANDARD
                .decode(media.payload.as_bytes())
                .map_err(|e| malformed(format!("payload is not base64: {e}")))?;
            CarrierEvent::Media(MediaChunk {
                payload: Bytes::from(payload),
                track: media.track,
                chunk: media.chunk,
                timestamp: media.timestamp,
            })
        }
        InboundFrame::Stop {} => CarrierEvent::Stop,
        InboundFrame::Mark { mark } => CarrierEvent::Mark { name: mark.name },
    })
}

impl CarrierCommand {
    /// Serializes the command as a carrier text frame.
    pub fn encode(&self) -> String {
        let frame = match self {
            CarrierCommand::Media { stream_id, payload } => json!({
                "event": "media",
                "streamSid": stream_id,
                "media": { "payload": STANDARD.encode(payload) },
            }),
            CarrierCommand::Mark { stream_id, name } => json!({
                "event": "mark",
                "streamSid": stream_id,
                "mark": { "name": name },
            }),
            CarrierCommand::Clear { stream_id } => json!({
                "event": "clear",
                "streamSid": stream_id,
            }),
        };
        frame.to_string()
    }
}
