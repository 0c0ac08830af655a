//! Session Registry
//!
//! Process-wide table of live calls, keyed by call id. Each accepted carrier
//! connection registers here and holds a [`SessionGuard`] for as long as its
//! call runs; the guard's drop is what removes the entry again, so a panicking
//! or aborted session task can never leak an `active` count.
//!
//! Shutdown is cooperative: [`SessionRegistry::shutdown`] refuses further
//! registrations and cancels every guard's token, which each call session
//! observes and uses to drain.

use crate::models::CallCounts;
use chrono::Utc;
use dashmap::DashMap;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("the gateway is shutting down and not accepting calls")]
    ShuttingDown,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    total: AtomicU64,
    calls: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
    idle: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new call, returning the guard that keeps it counted.
    pub fn register(self: &Arc<Self>) -> Result<SessionGuard, RegistryError> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }

        let n = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        let call_id = format!("call_{}_{}", Utc::now().timestamp_millis(), n);
        // A registration racing with shutdown gets an already-cancelled
        // child token and drains straight away.
        let cancel = self.shutdown.child_token();
        self.calls.insert(call_id.clone(), cancel.clone());
        debug!(%call_id, active = self.calls.len(), "Call registered");

        Ok(SessionGuard {
            registry: Arc::clone(self),
            call_id,
            cancel,
        })
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            total: self.total.load(Ordering::SeqCst),
            active: self.calls.len() as u64,
        }
    }

    /// Ids of the calls currently registered, sorted.
    pub fn live_calls(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_accepting(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops admitting calls and asks every live call to drain.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(calls = ?self.live_calls(), "Session registry shutting down");
            self.shutdown.cancel();
        }
    }

    /// Waits until no call is active. Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.calls.is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn release(&self, call_id: &str) {
        self.calls.remove(call_id);
        let remaining = self.calls.len();
        debug!(%call_id, active = remaining, "Call released");
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Membership of one call in the registry. Dropping it releases the call.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    call_id: String,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Cancelled when the registry shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.call_id);
    }
}
