//! Codec for the AI model's realtime protocol.
//!
//! Server events are JSON text tagged by `type`. Only the events the call
//! bridge acts on are modelled; anything else decodes to `None` and is
//! ignored by the session.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use receptionist_core::tools::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

/// Telephony audio encodings the AI session can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum AudioFormat {
    #[default]
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    #[serde(rename = "g711_alaw")]
    G711Alaw,
}

impl AudioFormat {
    /// Maps a carrier `mediaFormat.encoding` onto the matching AI format.
    pub fn from_carrier_encoding(encoding: &str) -> Option<Self> {
        match encoding {
            "audio/x-mulaw" => Some(AudioFormat::G711Ulaw),
            "audio/x-alaw" => Some(AudioFormat::G711Alaw),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::G711Ulaw => "g711_ulaw",
            AudioFormat::G711Alaw => "g711_alaw",
        }
    }
}

/// A decoded server event the bridge cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    SessionReady,
    AudioDelta { payload: Bytes },
    ResponseCompleted,
    ToolCallRequested {
        call_id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    SpeechStarted,
    UserTranscript { text: String },
    AssistantTranscript { text: String },
    Error { message: String, code: Option<String> },
}

/// The session handshake sent once the carrier stream has started.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub audio_format: AudioFormat,
    pub tools: Vec<ToolDefinition>,
}

/// Client events sent to the AI model.
#[derive(Debug, Clone, PartialEq)]
pub enum AiCommand {
    SessionConfigure(SessionConfig),
    AudioAppend { payload: Bytes, format: AudioFormat },
    AudioCommit,
    ResponseCreate,
    ToolCallResult { call_id: String, result: Value },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AiDecodeError {
    #[error("server event is not valid JSON: {0}")]
    NotJson(String),
    #[error("malformed '{kind}' event: {reason}")]
    Malformed { kind: String, reason: String },
}

// --- Wire Types ---

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created", alias = "session.updated")]
    SessionReady {},
    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    AudioDelta {
        #[serde(alias = "delta")]
        audio: String,
    },
    #[serde(rename = "response.completed", alias = "response.done")]
    ResponseCompleted {},
    #[serde(
        rename = "response.function_call",
        alias = "response.function_call_arguments.done"
    )]
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript { transcript: String },
    #[serde(
        rename = "response.output_audio_transcript.done",
        alias = "response.audio_transcript.done"
    )]
    OutputTranscript { transcript: String },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    code: Option<String>,
}

/// Decodes one text frame from the AI model. Events outside the modelled
/// set yield `Ok(None)`.
pub fn decode(text: &str) -> Result<Option<AiEvent>, AiDecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| AiDecodeError::NotJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let malformed = |reason: String| AiDecodeError::Malformed {
        kind: kind.clone(),
        reason,
    };

    let event: ServerEvent = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    Ok(Some(match event {
        ServerEvent::SessionReady {} => AiEvent::SessionReady,
        ServerEvent::AudioDelta { audio } => {
            let payload = STANDARD
                .decode(audio.as_bytes())
                .map_err(|e| malformed(format!("audio is not base64: {e}")))?;
            AiEvent::AudioDelta {
                payload: Bytes::from(payload),
            }
        }
        ServerEvent::ResponseCompleted {} => AiEvent::ResponseCompleted,
        ServerEvent::FunctionCall {
            call_id,
            name,
            arguments,
        } => AiEvent::ToolCallRequested {
            arguments: tool_arguments(&call_id, arguments),
            call_id,
            name,
        },
        ServerEvent::SpeechStarted {} => AiEvent::SpeechStarted,
        ServerEvent::InputTranscript { transcript } => AiEvent::UserTranscript { text: transcript },
        ServerEvent::OutputTranscript { transcript } => {
            AiEvent::AssistantTranscript { text: transcript }
        }
        ServerEvent::Error { error } => AiEvent::Error {
            message: error.message,
            code: error.code,
        },
        ServerEvent::Unknown => return Ok(None),
    }))
}

/// Arguments arrive either as an object or as a JSON-encoded string. Anything
/// unusable becomes an empty map so the dispatcher reports the missing fields.
fn tool_arguments(call_id: &str, arguments: Value) -> Map<String, Value> {
    match arguments {
        Value::Object(map) => map,
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(%call_id, "Tool call arguments are not a JSON object");
                Map::new()
            }
        },
        Value::Null => Map::new(),
        _ => {
            warn!(%call_id, "Tool call arguments are not a JSON object");
            Map::new()
        }
    }
}

impl AiCommand {
    /// Serializes the command as a client event.
    pub fn encode(&self) -> String {
        let event = match self {
            AiCommand::SessionConfigure(config) => json!({
                "type": "session.update",
                "session": {
                    "instructions": config.instructions,
                    "modalities": ["audio", "text"],
                    "voice": config.voice,
                    "input_audio_format": config.audio_format,
                    "output_audio_format": config.audio_format,
                    "input_audio_transcription": { "model": "whisper-1" },
                    "tool_choice": "auto",
                    "tools": config.tools,
                }
            }),
            AiCommand::AudioAppend { payload, format } => json!({
                "type": "input_audio_buffer.append",
                "audio": STANDARD.encode(payload),
                "audio_format": format,
            }),
            AiCommand::AudioCommit => json!({ "type": "input_audio_buffer.commit" }),
            AiCommand::ResponseCreate => json!({
                "type": "response.create",
                "response": { "modalities": ["audio"] },
            }),
            AiCommand::ToolCallResult { call_id, result } => json!({
                "type": "response.function_call_result",
                "call_id": call_id,
                "result": result,
            }),
        };
        event.to_string()
    }

    /// Event type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AiCommand::SessionConfigure(_) => "session.update",
            AiCommand::AudioAppend { .. } => "input_audio_buffer.append",
            AiCommand::AudioCommit => "input_audio_buffer.commit",
            AiCommand::ResponseCreate => "response.create",
            AiCommand::ToolCallResult { .. } => "response.function_call_result",
        }
    }
}
