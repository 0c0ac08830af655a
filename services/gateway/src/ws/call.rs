//! The call-session state machine.
//!
//! A [`CallSession`] owns everything one call knows about itself and nothing
//! about sockets. The runtime feeds it [`SessionEvent`]s together with the
//! current instant and carries out the [`SessionAction`]s it returns, in
//! order. Keeping it free of I/O means every lifecycle rule below is tested
//! without a network.
//!
//! ```text
//! Idle --start--> Negotiating --ack--> Active --stop/ai close--> Draining --> Closed
//!   any state --fatal error / idle timeout / carrier close--> Closed
//! ```

use super::protocol::{
    carrier::{CarrierCommand, CarrierDecodeError, CarrierEvent, StreamStart},
    realtime::{AiCommand, AiDecodeError, AiEvent, AudioFormat, SessionConfig},
};
use crate::config::Config;
use receptionist_core::{
    audio::AudioFrame,
    redact::{partial_redact, redact_text, redact_value},
    segmenter::{SegmenterSignal, UtteranceSegmenter},
    tools::{ToolInvocation, ToolOutcome, ToolStatus, tool_definitions},
    transcript::{Role, Transcript},
};
use serde_json::Value;
use std::{collections::HashMap, fmt, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Idle,
    Negotiating,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Draining => "draining",
            CallState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything that can happen to a call.
#[derive(Debug)]
pub enum SessionEvent {
    Carrier(Result<CarrierEvent, CarrierDecodeError>),
    CarrierClosed,
    Ai(Result<Option<AiEvent>, AiDecodeError>),
    AiClosed,
    /// A control frame for the carrier could not be queued in time.
    CarrierStalled,
    /// A control frame for the AI model could not be queued in time.
    AiStalled,
    ToolResolved { call_id: String, outcome: ToolOutcome },
    QuietElapsed,
    IdleTimeout,
    DrainElapsed,
    Shutdown,
}

/// Work the runtime performs on behalf of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Carrier(CarrierCommand),
    Ai(AiCommand),
    /// Run this tool off the relay path and report back with
    /// [`SessionEvent::ToolResolved`].
    Dispatch(ToolInvocation),
}

/// Per-call tunables taken from the service configuration.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub instructions: String,
    pub voice: String,
    pub quiet_threshold: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
}

impl CallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            quiet_threshold: config.quiet_threshold,
            idle_timeout: config.idle_timeout,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Instants at which the runtime must wake the session up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub quiet: Option<Instant>,
    pub idle: Option<Instant>,
    pub drain: Option<Instant>,
}

#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    state: CallState,
    settings: CallSettings,
    stream_id: Option<String>,
    carrier_call_id: Option<String>,
    audio_format: AudioFormat,
    segmenter: UtteranceSegmenter,
    transcript: Transcript,
    pending: HashMap<String, ToolInvocation>,
    created_at: Instant,
    last_inbound_at: Instant,
    drain_deadline: Option<Instant>,
    responses: u64,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, settings: CallSettings, now: Instant) -> Self {
        Self {
            call_id: call_id.into(),
            state: CallState::Idle,
            segmenter: UtteranceSegmenter::new(settings.quiet_threshold),
            settings,
            stream_id: None,
            carrier_call_id: None,
            audio_format: AudioFormat::default(),
            transcript: Transcript::new(),
            pending: HashMap::new(),
            created_at: now,
            last_inbound_at: now,
            drain_deadline: None,
            responses: 0,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == CallState::Closed
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// The carrier's own identifier for the call, once `start` arrived.
    pub fn carrier_call_id(&self) -> Option<&str> {
        self.carrier_call_id.as_deref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn pending_tools(&self) -> usize {
        self.pending.len()
    }

    pub fn deadlines(&self) -> Deadlines {
        match self.state {
            CallState::Idle => Deadlines {
                idle: Some(self.last_inbound_at + self.settings.idle_timeout),
                ..Deadlines::default()
            },
            CallState::Negotiating | CallState::Active => Deadlines {
                quiet: self.segmenter.deadline(),
                idle: Some(self.last_inbound_at + self.settings.idle_timeout),
                drain: None,
            },
            CallState::Draining => Deadlines {
                drain: self.drain_deadline,
                ..Deadlines::default()
            },
            CallState::Closed => Deadlines::default(),
        }
    }

    /// Applies one event and returns the resulting actions in send order.
    /// Once the session is closed every event is ignored.
    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.is_closed() {
            trace!(call_id = %self.call_id, "Event after close ignored");
            return actions;
        }

        match event {
            SessionEvent::Carrier(Ok(event)) => self.on_carrier(event, now, &mut actions),
            SessionEvent::Carrier(Err(e)) if e.is_fatal() => {
                let message = e.to_string();
                let error = redact_text(&message);
                warn!(call_id = %self.call_id, %error, "Fatal carrier protocol error");
                self.close("carrier protocol error", now);
            }
            SessionEvent::Carrier(Err(e)) => {
                let message = e.to_string();
                let error = redact_text(&message);
                debug!(call_id = %self.call_id, %error, "Dropping undecodable carrier frame");
            }
            SessionEvent::CarrierClosed => self.close("carrier disconnected", now),
            SessionEvent::CarrierStalled => self.close("carrier stalled", now),
            SessionEvent::AiStalled => self.close("ai stalled", now),
            SessionEvent::Ai(Ok(Some(event))) => self.on_ai(event, now, &mut actions),
            SessionEvent::Ai(Ok(None)) => {}
            SessionEvent::Ai(Err(e)) => {
                let message = e.to_string();
                let error = redact_text(&message);
                warn!(call_id = %self.call_id, %error, "Dropping undecodable AI event");
            }
            SessionEvent::AiClosed => match self.state {
                CallState::Negotiating | CallState::Active => {
                    self.drain("ai disconnected", now);
                }
                _ => self.close("ai disconnected", now),
            },
            SessionEvent::ToolResolved { call_id, outcome } => {
                self.on_tool_resolved(call_id, outcome, &mut actions)
            }
            SessionEvent::QuietElapsed => {
                if self.forwards_inbound() && self.segmenter.poll(now).is_some() {
                    self.commit(&mut actions);
                }
            }
            SessionEvent::IdleTimeout => {
                if self.deadlines().idle.is_some_and(|deadline| now >= deadline) {
                    self.close("idle timeout", now);
                }
            }
            SessionEvent::DrainElapsed => {
                if self.deadlines().drain.is_some_and(|deadline| now >= deadline) {
                    self.close("drain timeout", now);
                }
            }
            SessionEvent::Shutdown => match self.state {
                CallState::Idle => self.close("server shutdown", now),
                CallState::Negotiating | CallState::Active => self.drain("server shutdown", now),
                _ => {}
            },
        }
        actions
    }

    fn on_carrier(&mut self, event: CarrierEvent, now: Instant, actions: &mut Vec<SessionAction>) {
        match event {
            CarrierEvent::Connected => debug!(call_id = %self.call_id, "Carrier stream connected"),
            CarrierEvent::Started(start) => self.on_start(start, now, actions),
            CarrierEvent::Media(chunk) => {
                if !self.forwards_inbound() {
                    trace!(call_id = %self.call_id, state = %self.state, "Inbound audio dropped");
                    return;
                }
                let frame = AudioFrame::inbound(chunk.payload, now);
                self.trace_frame(&frame);
                self.last_inbound_at = frame.received_at();
                if let Some(SegmenterSignal::CommitAndRespond) =
                    self.segmenter.on_inbound_frame(frame.received_at())
                {
                    self.commit(actions);
                }
                actions.push(SessionAction::Ai(AiCommand::AudioAppend {
                    payload: frame.into_payload(),
                    format: self.audio_format,
                }));
            }
            CarrierEvent::Stop => match self.state {
                CallState::Idle => self.close("carrier stop before start", now),
                CallState::Negotiating | CallState::Active => self.drain("carrier stop", now),
                _ => debug!(call_id = %self.call_id, "Duplicate carrier stop ignored"),
            },
            CarrierEvent::Mark { name } => {
                debug!(call_id = %self.call_id, mark = %name, "Carrier played mark")
            }
        }
    }

    fn on_start(&mut self, start: StreamStart, now: Instant, actions: &mut Vec<SessionAction>) {
        if self.state != CallState::Idle {
            warn!(call_id = %self.call_id, state = %self.state, "Duplicate carrier start ignored");
            return;
        }

        self.audio_format = AudioFormat::from_carrier_encoding(&start.media_format.encoding)
            .unwrap_or_else(|| {
                warn!(
                    call_id = %self.call_id,
                    encoding = %start.media_format.encoding,
                    "Unsupported carrier encoding, assuming mu-law"
                );
                AudioFormat::G711Ulaw
            });
        let parameters = redact_value(&Value::Object(start.custom_parameters));
        info!(
            call_id = %self.call_id,
            stream = %partial_redact(&start.stream_id, 4),
            carrier_call = %redact_text(&start.call_id),
            encoding = %start.media_format.encoding,
            sample_rate = start.media_format.sample_rate,
            channels = start.media_format.channels,
            %parameters,
            "Carrier stream started"
        );
        self.stream_id = Some(start.stream_id);
        self.carrier_call_id = Some(start.call_id);
        self.last_inbound_at = now;

        actions.push(SessionAction::Ai(AiCommand::SessionConfigure(SessionConfig {
            instructions: self.settings.instructions.clone(),
            voice: self.settings.voice.clone(),
            audio_format: self.audio_format,
            tools: tool_definitions(),
        })));
        self.transition(CallState::Negotiating, "carrier start", now);
    }

    fn on_ai(&mut self, event: AiEvent, now: Instant, actions: &mut Vec<SessionAction>) {
        match event {
            AiEvent::SessionReady => {
                if self.state == CallState::Negotiating {
                    self.transition(CallState::Active, "handshake acknowledged", now);
                }
            }
            AiEvent::AudioDelta { payload } => {
                let Some(stream_id) = self.outbound_stream() else {
                    trace!(call_id = %self.call_id, state = %self.state, "Outbound audio dropped");
                    return;
                };
                let frame = AudioFrame::outbound(payload, now);
                self.trace_frame(&frame);
                actions.push(SessionAction::Carrier(CarrierCommand::Media {
                    stream_id,
                    payload: frame.into_payload(),
                }));
            }
            AiEvent::ResponseCompleted => {
                if let Some(stream_id) = self.outbound_stream() {
                    self.responses += 1;
                    actions.push(SessionAction::Carrier(CarrierCommand::Mark {
                        stream_id,
                        name: format!("response-{}", self.responses),
                    }));
                }
            }
            AiEvent::SpeechStarted => {
                if self.state == CallState::Active {
                    if let Some(stream_id) = self.stream_id.clone() {
                        debug!(call_id = %self.call_id, "Caller barged in, clearing playback");
                        actions.push(SessionAction::Carrier(CarrierCommand::Clear { stream_id }));
                    }
                }
            }
            AiEvent::UserTranscript { text } => self.record(Role::User, text),
            AiEvent::AssistantTranscript { text } => self.record(Role::Assistant, text),
            AiEvent::ToolCallRequested {
                call_id,
                name,
                arguments,
            } => {
                if self.state == CallState::Idle {
                    warn!(call_id = %self.call_id, tool = %name, "Tool call before start ignored");
                    return;
                }
                if self.pending.contains_key(&call_id) {
                    warn!(
                        call_id = %self.call_id,
                        tool_call = %call_id,
                        "Duplicate tool call ignored"
                    );
                    return;
                }
                info!(
                    call_id = %self.call_id,
                    tool_call = %call_id,
                    tool = %name,
                    "Tool call requested"
                );
                let invocation = ToolInvocation::new(call_id.clone(), name, arguments);
                self.pending.insert(call_id, invocation.clone());
                actions.push(SessionAction::Dispatch(invocation));
            }
            AiEvent::Error { message, code } => {
                warn!(
                    call_id = %self.call_id,
                    code = code.as_deref().unwrap_or("unknown"),
                    message = %redact_text(&message),
                    "AI reported an error"
                );
                if self.state == CallState::Negotiating {
                    self.drain("handshake rejected", now);
                }
            }
        }
    }

    fn on_tool_resolved(
        &mut self,
        call_id: String,
        outcome: ToolOutcome,
        actions: &mut Vec<SessionAction>,
    ) {
        let Some(mut invocation) = self.pending.remove(&call_id) else {
            warn!(
                call_id = %self.call_id,
                tool_call = %call_id,
                "Result for unknown tool call dropped"
            );
            return;
        };
        invocation.resolve(outcome.status);
        info!(
            call_id = %self.call_id,
            tool_call = %call_id,
            tool = %invocation.name,
            status = ?invocation.status,
            "Tool call resolved"
        );
        actions.push(SessionAction::Ai(AiCommand::ToolCallResult {
            call_id,
            result: outcome.result,
        }));
    }

    fn commit(&mut self, actions: &mut Vec<SessionAction>) {
        debug!(call_id = %self.call_id, "Caller went quiet, committing utterance");
        actions.push(SessionAction::Ai(AiCommand::AudioCommit));
        actions.push(SessionAction::Ai(AiCommand::ResponseCreate));
    }

    fn trace_frame(&self, frame: &AudioFrame) {
        trace!(
            call_id = %self.call_id,
            direction = ?frame.direction(),
            bytes = frame.len(),
            "Relaying audio frame"
        );
    }

    fn record(&mut self, role: Role, text: String) {
        debug!(call_id = %self.call_id, %role, chars = text.chars().count(), "Transcript entry");
        self.transcript.push(role, text);
    }

    fn forwards_inbound(&self) -> bool {
        matches!(self.state, CallState::Negotiating | CallState::Active)
    }

    fn outbound_stream(&self) -> Option<String> {
        match self.state {
            CallState::Active | CallState::Draining => self.stream_id.clone(),
            _ => None,
        }
    }

    fn drain(&mut self, reason: &'static str, now: Instant) {
        self.segmenter.reset();
        self.drain_deadline = Some(now + self.settings.drain_timeout);
        self.transition(CallState::Draining, reason, now);
    }

    fn close(&mut self, reason: &'static str, now: Instant) {
        self.transition(CallState::Closed, reason, now);
    }

    fn transition(&mut self, to: CallState, reason: &'static str, now: Instant) {
        debug_assert!(to > self.state, "call state moves forward only");
        info!(call_id = %self.call_id, from = %self.state, %to, reason, "Call state transition");
        self.state = to;
        if to == CallState::Closed {
            self.finish(now);
        }
    }

    fn finish(&mut self, now: Instant) {
        self.segmenter.reset();
        self.drain_deadline = None;
        for (tool_call, mut invocation) in self.pending.drain() {
            invocation.resolve(ToolStatus::Failed);
            warn!(
                call_id = %self.call_id,
                %tool_call,
                tool = %invocation.name,
                "Tool call abandoned at close"
            );
        }
        info!(
            call_id = %self.call_id,
            entries = self.transcript.len(),
            user_turns = self.transcript.count(Role::User),
            assistant_turns = self.transcript.count(Role::Assistant),
            responses = self.responses,
            duration_ms = now.saturating_duration_since(self.created_at).as_millis() as u64,
            "Call transcript flushed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::carrier::{MediaChunk, MediaFormat};
    use bytes::Bytes;
    use serde_json::{Map, json};

    fn settings() -> CallSettings {
        CallSettings {
            instructions: "Be brief.".into(),
            voice: "verse".into(),
            quiet_threshold: Duration::from_millis(900),
            idle_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(2),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn start_event(encoding: &str) -> SessionEvent {
        SessionEvent::Carrier(Ok(CarrierEvent::Started(StreamStart {
            stream_id: "SS1".into(),
            call_id: "CA1".into(),
            account_id: None,
            tracks: vec!["inbound".into()],
            media_format: MediaFormat {
                encoding: encoding.into(),
                sample_rate: 8000,
                channels: 1,
            },
            custom_parameters: Map::new(),
        })))
    }

    fn media(byte: u8) -> SessionEvent {
        SessionEvent::Carrier(Ok(CarrierEvent::Media(MediaChunk {
            payload: Bytes::from(vec![byte; 160]),
            track: Some("inbound".into()),
            chunk: None,
            timestamp: None,
        })))
    }

    fn ai(event: AiEvent) -> SessionEvent {
        SessionEvent::Ai(Ok(Some(event)))
    }

    /// A session that has completed the handshake, plus the instant it did so.
    fn active_session() -> (CallSession, Instant) {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);
        session.handle(start_event("audio/x-mulaw"), t0);
        session.handle(ai(AiEvent::SessionReady), t0);
        assert_eq!(session.state(), CallState::Active);
        (session, t0)
    }

    fn is_commit(action: &SessionAction) -> bool {
        matches!(action, SessionAction::Ai(AiCommand::AudioCommit))
    }

    #[test]
    fn test_start_sends_handshake() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);

        let actions = session.handle(start_event("audio/x-alaw"), t0);

        assert_eq!(session.state(), CallState::Negotiating);
        assert_eq!(session.stream_id(), Some("SS1"));
        assert_eq!(actions.len(), 1);
        let SessionAction::Ai(AiCommand::SessionConfigure(config)) = &actions[0] else {
            panic!("expected the session handshake, got {:?}", actions[0]);
        };
        assert_eq!(config.audio_format, AudioFormat::G711Alaw);
        assert_eq!(config.instructions, "Be brief.");
        assert_eq!(config.tools.len(), 2);
    }

    #[test]
    fn test_unsupported_encoding_falls_back_to_mulaw() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);
        session.handle(start_event("audio/x-l16"), t0);

        let actions = session.handle(media(1), t0);
        assert!(matches!(
            actions[0],
            SessionAction::Ai(AiCommand::AudioAppend {
                format: AudioFormat::G711Ulaw,
                ..
            })
        ));
    }

    #[test]
    fn test_audio_gating_by_state() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);

        // Idle: nothing is forwarded either way.
        assert!(session.handle(media(1), t0).is_empty());
        assert!(session
            .handle(ai(AiEvent::AudioDelta { payload: Bytes::from_static(b"x") }), t0)
            .is_empty());

        // Negotiating: inbound flows to the AI, outbound is held back.
        session.handle(start_event("audio/x-mulaw"), t0);
        assert_eq!(session.handle(media(1), t0).len(), 1);
        assert!(session
            .handle(ai(AiEvent::AudioDelta { payload: Bytes::from_static(b"x") }), t0)
            .is_empty());

        // Active: both directions.
        session.handle(ai(AiEvent::SessionReady), t0);
        let delta = ai(AiEvent::AudioDelta { payload: Bytes::from_static(b"x") });
        let actions = session.handle(delta, t0);
        assert_eq!(
            actions,
            vec![SessionAction::Carrier(CarrierCommand::Media {
                stream_id: "SS1".into(),
                payload: Bytes::from_static(b"x"),
            })]
        );

        // Draining: inbound stops, outbound still flushes.
        session.handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0);
        assert_eq!(session.state(), CallState::Draining);
        assert!(session.handle(media(1), t0).is_empty());
        assert_eq!(
            session
                .handle(ai(AiEvent::AudioDelta { payload: Bytes::from_static(b"y") }), t0)
                .len(),
            1
        );
    }

    #[test]
    fn test_gap_commits_before_fourth_frame() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);
        session.handle(start_event("audio/x-mulaw"), t0);

        let mut sent = Vec::new();
        for (i, at) in [0u64, 20, 40].into_iter().enumerate() {
            sent.extend(session.handle(media(i as u8), t0 + ms(at)));
        }
        sent.extend(session.handle(media(3), t0 + ms(1_040)));

        assert_eq!(sent.iter().filter(|a| is_commit(a)).count(), 1);
        let commit_at = sent.iter().position(is_commit).unwrap();
        assert_eq!(commit_at, 3);
        assert_eq!(sent[4], SessionAction::Ai(AiCommand::ResponseCreate));
        assert!(matches!(
            &sent[5],
            SessionAction::Ai(AiCommand::AudioAppend { payload, .. }) if payload[0] == 3
        ));
    }

    #[test]
    fn test_quiet_timer_commits_once() {
        let (mut session, t0) = active_session();
        session.handle(media(1), t0);
        assert_eq!(session.deadlines().quiet, Some(t0 + ms(900)));

        // Early wake-ups do nothing.
        assert!(session.handle(SessionEvent::QuietElapsed, t0 + ms(500)).is_empty());

        let actions = session.handle(SessionEvent::QuietElapsed, t0 + ms(900));
        assert_eq!(
            actions,
            vec![
                SessionAction::Ai(AiCommand::AudioCommit),
                SessionAction::Ai(AiCommand::ResponseCreate)
            ]
        );
        assert!(session.handle(SessionEvent::QuietElapsed, t0 + ms(2_000)).is_empty());
        assert_eq!(session.deadlines().quiet, None);

        // The next frame after a timer-driven commit is appended without a second commit.
        let actions = session.handle(media(2), t0 + ms(3_000));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_continuous_audio_never_commits() {
        let (mut session, t0) = active_session();
        let mut commits = 0;
        for i in 0..100 {
            commits += session
                .handle(media(1), t0 + ms(i * 20))
                .iter()
                .filter(|a| is_commit(a))
                .count();
        }
        assert_eq!(commits, 0);
    }

    #[test]
    fn test_lifecycle_visits_each_state_once() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);
        let mut seen = vec![session.state()];
        let mut note = |s: &CallSession| {
            if seen.last() != Some(&s.state()) {
                seen.push(s.state());
            }
        };

        session.handle(SessionEvent::Carrier(Ok(CarrierEvent::Connected)), t0);
        note(&session);
        session.handle(start_event("audio/x-mulaw"), t0);
        note(&session);
        session.handle(ai(AiEvent::SessionReady), t0);
        note(&session);
        session.handle(ai(AiEvent::SessionReady), t0);
        note(&session);
        session.handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0);
        note(&session);
        session.handle(SessionEvent::CarrierClosed, t0);
        note(&session);
        session.handle(SessionEvent::AiClosed, t0);
        note(&session);

        assert_eq!(
            seen,
            vec![
                CallState::Idle,
                CallState::Negotiating,
                CallState::Active,
                CallState::Draining,
                CallState::Closed
            ]
        );
    }

    #[test]
    fn test_duplicate_stop_has_no_effect() {
        let (mut session, t0) = active_session();

        assert!(session.handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0).is_empty());
        let deadline = session.deadlines().drain;
        assert_eq!(deadline, Some(t0 + Duration::from_secs(2)));

        assert!(session
            .handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0 + ms(500))
            .is_empty());
        assert_eq!(session.state(), CallState::Draining);
        assert_eq!(session.deadlines().drain, deadline);

        session.handle(SessionEvent::DrainElapsed, t0 + Duration::from_secs(2));
        assert!(session.is_closed());
        assert!(session
            .handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0 + Duration::from_secs(3))
            .is_empty());
        assert!(session.is_closed());
    }

    #[test]
    fn test_no_events_processed_after_close() {
        let (mut session, t0) = active_session();
        session.handle(SessionEvent::CarrierClosed, t0);
        assert!(session.is_closed());

        assert!(session.handle(media(1), t0).is_empty());
        assert!(session
            .handle(ai(AiEvent::AudioDelta { payload: Bytes::from_static(b"x") }), t0)
            .is_empty());
        assert!(session
            .handle(
                ai(AiEvent::ToolCallRequested {
                    call_id: "c1".into(),
                    name: "find_availability".into(),
                    arguments: Map::new(),
                }),
                t0
            )
            .is_empty());
        assert_eq!(session.deadlines(), Deadlines::default());
    }

    #[test]
    fn test_fatal_control_frame_closes() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);

        let bad_start = CarrierDecodeError::Malformed {
            event: "start".into(),
            reason: "missing field `start`".into(),
        };
        session.handle(SessionEvent::Carrier(Err(bad_start)), t0);
        assert!(session.is_closed());
    }

    #[test]
    fn test_bad_media_is_dropped() {
        let (mut session, t0) = active_session();
        let bad_media = CarrierDecodeError::Malformed {
            event: "media".into(),
            reason: "payload is not base64".into(),
        };

        assert!(session.handle(SessionEvent::Carrier(Err(bad_media)), t0).is_empty());
        assert_eq!(session.state(), CallState::Active);
        assert!(session
            .handle(SessionEvent::Carrier(Err(CarrierDecodeError::UnknownEvent("dtmf".into()))), t0)
            .is_empty());
        assert_eq!(session.state(), CallState::Active);
    }

    #[test]
    fn test_tool_round_trip_keeps_state() {
        let (mut session, t0) = active_session();
        let mut arguments = Map::new();
        arguments.insert("service".into(), json!("massage"));
        arguments.insert("date".into(), json!("2024-06-01"));

        let actions = session.handle(
            ai(AiEvent::ToolCallRequested {
                call_id: "c1".into(),
                name: "find_availability".into(),
                arguments: arguments.clone(),
            }),
            t0,
        );
        let [SessionAction::Dispatch(invocation)] = actions.as_slice() else {
            panic!("expected a dispatch, got {actions:?}");
        };
        assert_eq!(invocation.call_id, "c1");
        assert_eq!(invocation.arguments, arguments);
        assert!(invocation.is_pending());
        assert_eq!(session.pending_tools(), 1);

        // A repeated request for the same id is not dispatched twice.
        assert!(session
            .handle(
                ai(AiEvent::ToolCallRequested {
                    call_id: "c1".into(),
                    name: "find_availability".into(),
                    arguments: arguments.clone(),
                }),
                t0
            )
            .is_empty());

        let actions = session.handle(
            SessionEvent::ToolResolved {
                call_id: "c1".into(),
                outcome: ToolOutcome {
                    status: ToolStatus::Resolved,
                    result: json!({"slots": []}),
                },
            },
            t0,
        );
        assert_eq!(
            actions,
            vec![SessionAction::Ai(AiCommand::ToolCallResult {
                call_id: "c1".into(),
                result: json!({"slots": []}),
            })]
        );
        assert_eq!(session.pending_tools(), 0);
        assert_eq!(session.state(), CallState::Active);

        // A second result for the same id is dropped.
        assert!(session
            .handle(
                SessionEvent::ToolResolved {
                    call_id: "c1".into(),
                    outcome: ToolOutcome {
                        status: ToolStatus::Failed,
                        result: json!({"error": "late"}),
                    },
                },
                t0
            )
            .is_empty());
    }

    #[test]
    fn test_tool_results_still_sent_while_draining() {
        let (mut session, t0) = active_session();
        session.handle(
            ai(AiEvent::ToolCallRequested {
                call_id: "c9".into(),
                name: "cancel_booking".into(),
                arguments: Map::new(),
            }),
            t0,
        );
        session.handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0);

        let actions = session.handle(
            SessionEvent::ToolResolved {
                call_id: "c9".into(),
                outcome: ToolOutcome {
                    status: ToolStatus::Failed,
                    result: json!({"error": "unknown_tool"}),
                },
            },
            t0,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(session.state(), CallState::Draining);
    }

    #[test]
    fn test_close_abandons_pending_tools() {
        let (mut session, t0) = active_session();
        session.handle(
            ai(AiEvent::ToolCallRequested {
                call_id: "c1".into(),
                name: "create_booking".into(),
                arguments: Map::new(),
            }),
            t0,
        );
        session.handle(SessionEvent::CarrierClosed, t0);

        assert_eq!(session.pending_tools(), 0);
    }

    #[test]
    fn test_stalled_link_closes_call() {
        for stalled in [SessionEvent::CarrierStalled, SessionEvent::AiStalled] {
            let (mut session, t0) = active_session();
            session.handle(
                ai(AiEvent::ToolCallRequested {
                    call_id: "c1".into(),
                    name: "find_availability".into(),
                    arguments: Map::new(),
                }),
                t0,
            );

            assert!(session.handle(stalled, t0).is_empty());
            assert!(session.is_closed());
            assert_eq!(session.pending_tools(), 0);
        }
    }

    #[test]
    fn test_barge_in_and_marks() {
        let (mut session, t0) = active_session();

        assert_eq!(
            session.handle(ai(AiEvent::SpeechStarted), t0),
            vec![SessionAction::Carrier(CarrierCommand::Clear {
                stream_id: "SS1".into()
            })]
        );
        assert_eq!(
            session.handle(ai(AiEvent::ResponseCompleted), t0),
            vec![SessionAction::Carrier(CarrierCommand::Mark {
                stream_id: "SS1".into(),
                name: "response-1".into(),
            })]
        );
        let second = session.handle(ai(AiEvent::ResponseCompleted), t0);
        assert!(matches!(
            &second[0],
            SessionAction::Carrier(CarrierCommand::Mark { name, .. }) if name == "response-2"
        ));
    }

    #[test]
    fn test_transcript_in_arrival_order() {
        let (mut session, t0) = active_session();
        session.handle(ai(AiEvent::UserTranscript { text: "I need a massage".into() }), t0);
        session.handle(ai(AiEvent::AssistantTranscript { text: "Which day?".into() }), t0);
        session.handle(ai(AiEvent::UserTranscript { text: "Saturday".into() }), t0);

        let roles: Vec<Role> = session.transcript().entries().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }

    #[test]
    fn test_ai_error_rejects_handshake_but_not_active_call() {
        let t0 = Instant::now();
        let mut session = CallSession::new("call_1_1", settings(), t0);
        session.handle(start_event("audio/x-mulaw"), t0);
        session.handle(
            ai(AiEvent::Error {
                message: "invalid session".into(),
                code: None,
            }),
            t0,
        );
        assert_eq!(session.state(), CallState::Draining);

        let (mut active, t0) = active_session();
        active.handle(
            ai(AiEvent::Error {
                message: "rate limited".into(),
                code: Some("rate_limit".into()),
            }),
            t0,
        );
        assert_eq!(active.state(), CallState::Active);
    }

    #[test]
    fn test_disconnects() {
        let (mut session, t0) = active_session();
        session.handle(SessionEvent::AiClosed, t0);
        assert_eq!(session.state(), CallState::Draining);
        session.handle(SessionEvent::CarrierClosed, t0);
        assert!(session.is_closed());

        let (mut session, t0) = active_session();
        session.handle(SessionEvent::CarrierClosed, t0);
        assert!(session.is_closed());

        let mut idle = CallSession::new("call_1_2", settings(), t0);
        idle.handle(SessionEvent::Carrier(Ok(CarrierEvent::Stop)), t0);
        assert!(idle.is_closed());
    }

    #[test]
    fn test_idle_timeout_counts_from_last_inbound_audio() {
        let (mut session, t0) = active_session();
        session.handle(media(1), t0 + Duration::from_secs(30));
        assert_eq!(session.deadlines().idle, Some(t0 + Duration::from_secs(90)));

        // A stale wake-up before the ceiling is ignored.
        session.handle(SessionEvent::IdleTimeout, t0 + Duration::from_secs(60));
        assert_eq!(session.state(), CallState::Active);

        session.handle(SessionEvent::IdleTimeout, t0 + Duration::from_secs(90));
        assert!(session.is_closed());
    }

    #[test]
    fn test_shutdown_drains_live_calls() {
        let (mut session, t0) = active_session();
        session.handle(SessionEvent::Shutdown, t0);
        assert_eq!(session.state(), CallState::Draining);
        session.handle(SessionEvent::Shutdown, t0);
        assert_eq!(session.state(), CallState::Draining);

        let mut idle = CallSession::new("call_1_2", settings(), t0);
        idle.handle(SessionEvent::Shutdown, t0);
        assert!(idle.is_closed());
    }
}
