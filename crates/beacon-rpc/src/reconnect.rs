// ABOUTME: Reconnect supervisor for the agent side.
// ABOUTME: Decides when a terminal state warrants a new attempt and makes release race-free.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::state::ConnectionState;
use crate::sync::lock;

/// Where the supervisor is in its retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    /// Nothing scheduled; the current connection is live or the supervisor gave up.
    Idle,
    /// A reconnect is waiting out its delay.
    Scheduled,
    /// A connect attempt is in flight.
    Attempting,
    /// Released; nothing will be scheduled again.
    Released,
}

#[derive(Debug)]
struct Progress {
    state: SupervisorState,
    /// Consecutive attempts that ended in `ConnectFailed`.
    failures: u32,
    attempts: u64,
}

/// Retry state machine owned by one client.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: RetryPolicy,
    progress: Mutex<Progress>,
    cancel: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            progress: Mutex::new(Progress {
                state: SupervisorState::Idle,
                failures: 0,
                attempts: 0,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.progress).state
    }

    pub fn is_released(&self) -> bool {
        self.state() == SupervisorState::Released
    }

    /// Consecutive failed connect attempts since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.progress).failures
    }

    /// Attempts started over the supervisor's lifetime.
    pub fn attempts(&self) -> u64 {
        lock(&self.progress).attempts
    }

    /// React to a connection's terminal state.
    ///
    /// Returns the delay before the next attempt, or None when no attempt
    /// should be made (explicit close, released, or retries exhausted).
    pub fn on_terminated(&self, terminal: ConnectionState) -> Option<Duration> {
        let mut progress = lock(&self.progress);
        if progress.state == SupervisorState::Released {
            return None;
        }

        let retry = matches!(
            terminal,
            ConnectionState::ConnectFailed
                | ConnectionState::UnexpectedCloseByClient
                | ConnectionState::UnexpectedCloseByServer
        );
        if terminal == ConnectionState::ConnectFailed {
            progress.failures = progress.failures.saturating_add(1);
        }

        if !retry {
            progress.state = SupervisorState::Idle;
            return None;
        }
        if !self.policy.allows(progress.failures) {
            tracing::warn!(
                failures = progress.failures,
                "giving up reconnecting after repeated connect failures"
            );
            progress.state = SupervisorState::Idle;
            return None;
        }

        progress.state = SupervisorState::Scheduled;
        Some(self.policy.interval)
    }

    /// Claim the next attempt. False once released.
    pub fn begin_attempt(&self) -> bool {
        let mut progress = lock(&self.progress);
        if progress.state == SupervisorState::Released {
            return false;
        }
        progress.state = SupervisorState::Attempting;
        progress.attempts += 1;
        true
    }

    /// Sleep out `delay`, then claim the attempt. False if released meanwhile.
    pub async fn wait_then_begin(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        self.begin_attempt()
    }

    /// Record the outcome of the in-flight attempt.
    ///
    /// Returns false when the supervisor was released while the attempt
    /// ran; the caller must discard whatever the attempt produced.
    pub fn finish_attempt(&self, connected: bool) -> bool {
        let mut progress = lock(&self.progress);
        if progress.state == SupervisorState::Released {
            return false;
        }
        if connected {
            progress.failures = 0;
        }
        progress.state = SupervisorState::Idle;
        true
    }

    /// Stop all future scheduling. Idempotent; returns true on the first call.
    pub fn release(&self) -> bool {
        let mut progress = lock(&self.progress);
        if progress.state == SupervisorState::Released {
            return false;
        }
        progress.state = SupervisorState::Released;
        self.cancel.cancel();
        true
    }
}
