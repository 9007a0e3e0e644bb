use std::{future::Future, time::Duration};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

const SEND_RETRY_ATTEMPTS: usize = 3;
const SEND_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionState::Online)
    }
}

/// Tracks online/offline and backend-reachable status. State changes are
/// published on a watch channel; remote calls go through `with_retry`, which
/// feeds observed successes and connectivity failures back into the state.
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connection: state changed");
        }
    }

    pub fn set_online(&self) {
        self.set_state(ConnectionState::Online);
    }

    pub fn set_offline(&self) {
        self.set_state(ConnectionState::Offline);
    }

    /// Runs a remote call with bounded backoff. A connectivity-classified
    /// failure flips the monitor offline and returns immediately; retrying a
    /// dead link only delays the caller's failure handling.
    pub async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = SEND_RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.set_online();
                    return Ok(value);
                }
                Err(err) => {
                    if crate::is_offline_error(&err) {
                        warn!(label, "connection: {label} failed while offline: {err}");
                        self.set_offline();
                        return Err(err);
                    }
                    if attempt >= SEND_RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(label, attempt, "connection: {label} failed; retrying: {err}");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}
