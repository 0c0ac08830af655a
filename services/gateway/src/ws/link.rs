//! Socket links.
//!
//! A [`Link`] owns one WebSocket through two tasks: a writer fed by a queue,
//! so writes to the socket are serialized, and a reader that forwards text
//! frames to the call runtime. The same link type fronts the carrier socket
//! (axum) and the AI socket (tungstenite).

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, time::Duration};
use tokio::{
    sync::mpsc::{
        self,
        error::{SendTimeoutError, TrySendError},
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

const CHANNEL_BUFFER_SIZE: usize = 256;

/// Frames queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Ping,
    Close,
}

/// What the reader task hands to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Closed,
}

/// How the reader classifies a received WebSocket message.
pub enum Received {
    Text(String),
    Close,
    /// Binary, ping and pong frames; the socket library answers pings itself.
    Ignored,
}

/// The WebSocket message types a link can drive.
pub trait WireMessage: Send + 'static {
    fn text(text: String) -> Self;
    fn ping() -> Self;
    fn close() -> Self;
    fn classify(self) -> Received;
}

impl WireMessage for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping() -> Self {
        Self::Ping(bytes::Bytes::new())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Received {
        match self {
            Self::Text(text) => Received::Text(text.to_string()),
            Self::Close(_) => Received::Close,
            _ => Received::Ignored,
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping() -> Self {
        Self::Ping(bytes::Bytes::new())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Received {
        match self {
            Self::Text(text) => Received::Text(text.to_string()),
            Self::Close(_) => Received::Close,
            _ => Received::Ignored,
        }
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The writer is not keeping up with the queue.
    Full,
    /// The writer has gone away.
    Closed,
}

pub struct Link {
    name: &'static str,
    outgoing: mpsc::Sender<Outgoing>,
    incoming: mpsc::Receiver<Incoming>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Splits `socket` and spawns its writer and reader tasks.
    pub fn spawn<S, M, E>(name: &'static str, socket: S) -> Self
    where
        S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
        <S as Sink<M>>::Error: Display + Send,
        M: WireMessage,
        E: Display + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outgoing>(CHANNEL_BUFFER_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Incoming>(CHANNEL_BUFFER_SIZE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let should_close = frame == Outgoing::Close;
                let message = match frame {
                    Outgoing::Text(text) => M::text(text),
                    Outgoing::Ping => M::ping(),
                    Outgoing::Close => M::close(),
                };
                if let Err(e) = sink.send(message).await {
                    debug!(link = name, error = %e, "Socket write failed");
                    break;
                }
                if should_close {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => match message.classify() {
                        Received::Text(text) => {
                            if incoming_tx.send(Incoming::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Received::Close => break,
                        Received::Ignored => {}
                    },
                    Err(e) => {
                        debug!(link = name, error = %e, "Socket read failed");
                        break;
                    }
                }
            }
            let _ = incoming_tx.send(Incoming::Closed).await;
        });

        Self {
            name,
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// A link over bare channels, with no socket behind it.
    pub fn from_channels(
        name: &'static str,
        outgoing: mpsc::Sender<Outgoing>,
        incoming: mpsc::Receiver<Incoming>,
    ) -> Self {
        Self {
            name,
            outgoing,
            incoming,
            writer: None,
            reader: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues a frame without waiting. Used for frames the call can afford to
    /// lose, such as audio, pings and marks.
    pub fn try_send(&self, frame: Outgoing) -> Result<(), SendError> {
        self.outgoing.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queues a frame, waiting at most `bound` for room in the queue.
    pub async fn send_within(&self, frame: Outgoing, bound: Duration) -> Result<(), SendError> {
        self.outgoing
            .send_timeout(frame, bound)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::Full,
                SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    /// Next inbound frame. A finished reader reads as [`Incoming::Closed`].
    pub async fn recv(&mut self) -> Incoming {
        self.incoming.recv().await.unwrap_or(Incoming::Closed)
    }

    /// Sends a close frame and waits up to `grace` for the writer to finish.
    /// Returns `false` if the writer had to be aborted.
    pub async fn close(self, grace: Duration) -> bool {
        let Link {
            name,
            outgoing,
            writer,
            reader,
            ..
        } = self;
        let writer_abort = writer.as_ref().map(JoinHandle::abort_handle);

        let clean = tokio::time::timeout(grace, async move {
            let _ = outgoing.send(Outgoing::Close).await;
            drop(outgoing);
            if let Some(writer) = writer {
                let _ = writer.await;
            }
        })
        .await
        .is_ok();

        if !clean {
            warn!(
                link = name,
                "Socket did not close within the grace period, forcing termination"
            );
            if let Some(writer_abort) = writer_abort {
                writer_abort.abort();
            }
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        clean
    }
}
