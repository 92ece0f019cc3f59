use std::{future::Future, time::Duration};

use shared::domain::ConnectionState;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct PendingRetry {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Connection lifecycle with a single cancellable retry timer.
///
/// A failure while `Connecting` or `Connected` moves to `Disconnected` and
/// arms one retry after the fixed delay. Further failures while a retry is
/// armed are absorbed. A fired timer must [`claim_retry`] before reconnecting
/// so a retry cancelled in the meantime never runs.
///
/// [`claim_retry`]: ReconnectSupervisor::claim_retry
pub struct ReconnectSupervisor {
    state: ConnectionState,
    delay: Duration,
    pending: Option<PendingRetry>,
    generation: u64,
    shut_down: bool,
}

impl ReconnectSupervisor {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            delay,
            pending: None,
            generation: 0,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Enters `Connecting`. Refused while an attempt is running, while
    /// connected, or after shutdown.
    pub fn begin_connect(&mut self) -> bool {
        if self.shut_down || self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_connected(&mut self) {
        self.cancel_pending();
        self.state = ConnectionState::Connected;
    }

    /// Records a failed attempt or a dropped connection and arms a retry that
    /// runs `retry(generation)` after the delay. Returns whether a new timer
    /// was armed.
    pub fn on_failure<F, Fut>(&mut self, retry: F) -> bool
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.state = ConnectionState::Disconnected;
        if self.shut_down {
            return false;
        }
        if self.pending.is_some() {
            debug!("reconnect already scheduled");
            return false;
        }

        self.generation += 1;
        let generation = self.generation;
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            retry(generation).await;
        });
        self.pending = Some(PendingRetry { generation, timer });
        info!(
            delay_secs = delay.as_secs(),
            generation, "scheduled reconnect"
        );
        true
    }

    /// Called from a fired timer. Returns true when `generation` is still the
    /// armed retry, releasing the slot without aborting the caller.
    pub fn claim_retry(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                !self.shut_down
            }
            _ => false,
        }
    }

    /// Logout: cancels any armed retry and refuses future scheduling.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.cancel_pending();
        self.state = ConnectionState::Disconnected;
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
            debug!(generation = pending.generation, "cancelled pending reconnect");
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
