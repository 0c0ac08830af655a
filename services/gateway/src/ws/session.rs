//! Runs one call from carrier upgrade to teardown.
//!
//! The runtime is a single task per call. It multiplexes both sockets, the
//! session's timers, keep-alive pings, finished tool dispatches and the
//! registry's shutdown signal into [`SessionEvent`]s, hands each one to the
//! [`CallSession`] and performs whatever it asks for.

use super::{
    call::{CallSession, CallSettings, SessionAction, SessionEvent},
    link::{Incoming, Link, Outgoing, SendError},
    protocol::{
        carrier::{self, CarrierCommand},
        realtime::{self, AiCommand},
    },
    provider,
};
use crate::{config::Config, handlers::ApiError, registry::SessionGuard, state::AppState};
use axum::{
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use receptionist_core::{
    redact::redact_text,
    tools::{ToolDispatcher, ToolInvocation, ToolOutcome, ToolStatus},
};
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    task::{Id, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace, warn};

/// Axum handler to upgrade the carrier's HTTP request to a media stream.
pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    if !state.registry.is_accepting() {
        return Err(ApiError::ServiceUnavailable(
            "gateway is shutting down".to_string(),
        ));
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let guard = state
        .registry
        .register()
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, guard)))
}

/// Timing knobs for the sockets, as opposed to the call's own timers.
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub keepalive_interval: Duration,
    pub close_grace: Duration,
}

impl LinkTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            close_grace: config.close_grace,
        }
    }
}

#[instrument(name = "call", skip_all, fields(call_id = %guard.call_id()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, guard: SessionGuard) {
    info!("Carrier media stream connected");
    let carrier = Link::spawn("carrier", socket);
    let shutdown = guard.cancellation();

    let dialed = tokio::select! {
        dialed = provider::connect(&state.config) => dialed,
        _ = shutdown.cancelled() => {
            info!("Shutdown while dialling the AI model, dropping call");
            carrier.close(state.config.close_grace).await;
            return;
        }
    };
    let ai = match dialed {
        Ok(stream) => Link::spawn("ai", stream),
        Err(e) => {
            let message = format!("{e:#}");
            let error = redact_text(&message);
            error!(%error, "AI realtime connection failed, dropping call");
            carrier.close(state.config.close_grace).await;
            return;
        }
    };

    let session = CallSession::new(
        guard.call_id(),
        CallSettings::from_config(&state.config),
        Instant::now(),
    );
    let session = run_call(
        session,
        carrier,
        ai,
        Arc::clone(&state.dispatcher),
        LinkTiming::from_config(&state.config),
        shutdown,
    )
    .await;

    info!(
        state = %session.state(),
        carrier_call = %redact_text(session.carrier_call_id().unwrap_or("-")),
        transcript_entries = session.transcript().len(),
        "Call session finished"
    );
}

/// Drives `session` until it closes, then closes both links.
///
/// Audio, pings and marks are dropped when a socket falls behind. Control
/// frames wait up to `close_grace` for queue room; if they still cannot be
/// queued the call is closed.
///
/// Returns the closed session so the caller can report on it.
pub async fn run_call(
    mut session: CallSession,
    mut carrier: Link,
    mut ai: Link,
    dispatcher: Arc<ToolDispatcher>,
    timing: LinkTiming,
    shutdown: CancellationToken,
) -> CallSession {
    let mut carrier_open = true;
    let mut ai_open = true;
    let mut shutdown_seen = false;
    let mut tools: JoinSet<ToolOutcome> = JoinSet::new();
    let mut tool_calls: HashMap<Id, String> = HashMap::new();

    let mut keepalive = tokio::time::interval_at(
        Instant::now() + timing.keepalive_interval,
        timing.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !session.is_closed() {
        let deadlines = session.deadlines();
        let event = tokio::select! {
            Some(joined) = tools.join_next_with_id() => match joined {
                Ok((id, outcome)) => match tool_calls.remove(&id) {
                    Some(call_id) => SessionEvent::ToolResolved { call_id, outcome },
                    None => continue,
                },
                Err(e) => {
                    let Some(call_id) = tool_calls.remove(&e.id()) else { continue };
                    error!(
                        call_id = %session.call_id(),
                        tool_call = %call_id,
                        error = %e,
                        "Tool task failed"
                    );
                    SessionEvent::ToolResolved {
                        call_id,
                        outcome: ToolOutcome {
                            status: ToolStatus::Failed,
                            result: json!({ "error": "tool execution failed" }),
                        },
                    }
                }
            },
            incoming = carrier.recv(), if carrier_open => match incoming {
                Incoming::Text(text) => SessionEvent::Carrier(carrier::decode(&text)),
                Incoming::Closed => {
                    carrier_open = false;
                    SessionEvent::CarrierClosed
                }
            },
            incoming = ai.recv(), if ai_open => match incoming {
                Incoming::Text(text) => SessionEvent::Ai(realtime::decode(&text)),
                Incoming::Closed => {
                    ai_open = false;
                    SessionEvent::AiClosed
                }
            },
            _ = sleep_until(deadlines.quiet) => SessionEvent::QuietElapsed,
            _ = sleep_until(deadlines.idle) => SessionEvent::IdleTimeout,
            _ = sleep_until(deadlines.drain) => SessionEvent::DrainElapsed,
            _ = shutdown.cancelled(), if !shutdown_seen => {
                shutdown_seen = true;
                SessionEvent::Shutdown
            }
            _ = keepalive.tick() => {
                trace!(call_id = %session.call_id(), "Keep-alive ping");
                for link in [&carrier, &ai] {
                    deliver(link, Outgoing::Ping, Delivery::Lossy, timing).await;
                }
                continue;
            }
        };

        let mut next = Some(event);
        while let Some(event) = next.take() {
            for action in session.handle(event, Instant::now()) {
                let stalled = match action {
                    SessionAction::Carrier(command) => {
                        let delivery = match command {
                            CarrierCommand::Clear { .. } => Delivery::Control,
                            _ => Delivery::Lossy,
                        };
                        let frame = Outgoing::Text(command.encode());
                        (!deliver(&carrier, frame, delivery, timing).await)
                            .then_some(SessionEvent::CarrierStalled)
                    }
                    SessionAction::Ai(command) => {
                        trace!(
                            call_id = %session.call_id(),
                            kind = command.kind(),
                            "Sending to AI"
                        );
                        let delivery = match command {
                            AiCommand::AudioAppend { .. } => Delivery::Lossy,
                            _ => Delivery::Control,
                        };
                        let frame = Outgoing::Text(command.encode());
                        (!deliver(&ai, frame, delivery, timing).await)
                            .then_some(SessionEvent::AiStalled)
                    }
                    SessionAction::Dispatch(invocation) => {
                        let ToolInvocation {
                            call_id,
                            name,
                            arguments,
                            ..
                        } = invocation;
                        let dispatcher = Arc::clone(&dispatcher);
                        let handle = tools
                            .spawn(async move { dispatcher.dispatch(&name, &arguments).await });
                        tool_calls.insert(handle.id(), call_id);
                        None
                    }
                };
                if stalled.is_some() {
                    next = stalled;
                    break;
                }
            }
        }
    }

    if !tools.is_empty() {
        warn!(
            call_id = %session.call_id(),
            outstanding = tools.len(),
            "Aborting unfinished tool calls"
        );
        tools.abort_all();
    }
    let (carrier_clean, ai_clean) = tokio::join!(
        carrier.close(timing.close_grace),
        ai.close(timing.close_grace)
    );
    if !(carrier_clean && ai_clean) {
        warn!(
            call_id = %session.call_id(),
            carrier_clean,
            ai_clean,
            "Forced termination of call sockets"
        );
    }
    session
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Dropped if the socket is behind.
    Lossy,
    /// Waits up to the close grace for queue room.
    Control,
}

/// Queues `frame` on `link`. Returns `false` only when a control frame could
/// not be queued in time.
async fn deliver(link: &Link, frame: Outgoing, delivery: Delivery, timing: LinkTiming) -> bool {
    let sent = match delivery {
        Delivery::Lossy => link.try_send(frame),
        Delivery::Control => link.send_within(frame, timing.close_grace).await,
    };
    match sent {
        Ok(()) => true,
        Err(SendError::Closed) => {
            trace!(link = link.name(), "Writer gone, frame dropped");
            true
        }
        Err(SendError::Full) if delivery == Delivery::Lossy => {
            trace!(link = link.name(), "Socket behind, frame dropped");
            true
        }
        Err(SendError::Full) => {
            warn!(link = link.name(), "Socket stalled on a control frame");
            false
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
