//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources every
//! handler and call session shares: configuration, the session registry and
//! the tool dispatcher.

use crate::{config::Config, registry::SessionRegistry};
use receptionist_core::tools::ToolDispatcher;
use std::{sync::Arc, time::Instant};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, dispatcher: ToolDispatcher) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            started_at: Instant::now(),
        }
    }
}
