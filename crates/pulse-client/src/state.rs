//! Reconnection state machine.
//!
//! Transitions are pure `(state, event) -> action`; the retry timer is the
//! only side-channel input, owned by the driver in `manager`. This keeps the
//! backoff arithmetic testable without a transport.

use std::time::Duration;

/// First retry delay after a failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling for the doubling delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Scheduled retries before giving up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Lifecycle of the client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Explicit user close. Terminal; no reconnection.
    Closed,
    /// Retry ceiling reached. Terminal; a fresh start is required.
    Failed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Idle => write!(f, "idle"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Open => write!(f, "open"),
            ClientState::Reconnecting => write!(f, "reconnecting"),
            ClientState::Closed => write!(f, "closed"),
            ClientState::Failed => write!(f, "failed"),
        }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    StartRequested,
    TransportOpened,
    /// Transport closed or failed to open, not caused by the user.
    TransportClosed,
    RetryTimerFired,
    CloseRequested,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    OpenTransport,
    ScheduleRetry(Duration),
}

/// Connection lifecycle with bounded exponential backoff.
///
/// Delays run 1s, 2s, 4s, 8s, 16s, then hold at 30s; after
/// [`MAX_RECONNECT_ATTEMPTS`] scheduled retries the machine is `Failed`.
/// A successful open resets the counter and delay.
#[derive(Debug)]
pub struct Reconnector {
    state: ClientState,
    attempt_count: u32,
    current_delay: Duration,
}

impl Reconnector {
    pub fn new() -> Self {
        Self {
            state: ClientState::Idle,
            attempt_count: 0,
            current_delay: INITIAL_BACKOFF,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Apply one event; returns the action the driver must perform.
    pub fn on_event(&mut self, event: ChannelEvent) -> Action {
        use ChannelEvent::*;
        use ClientState::*;

        match (self.state, event) {
            (Idle, StartRequested) => {
                self.state = Connecting;
                Action::OpenTransport
            }
            (Connecting, TransportOpened) => {
                self.state = Open;
                self.attempt_count = 0;
                self.current_delay = INITIAL_BACKOFF;
                Action::None
            }
            (Connecting | Open, TransportClosed) => self.schedule_retry(),
            (Reconnecting, RetryTimerFired) => {
                self.state = Connecting;
                Action::OpenTransport
            }
            (Connecting | Open | Reconnecting, CloseRequested) => {
                self.state = Closed;
                Action::None
            }
            // Terminal states and out-of-order events change nothing.
            _ => Action::None,
        }
    }

    fn schedule_retry(&mut self) -> Action {
        if self.attempt_count >= MAX_RECONNECT_ATTEMPTS {
            self.state = ClientState::Failed;
            return Action::None;
        }
        self.state = ClientState::Reconnecting;
        let delay = self.current_delay;
        self.attempt_count += 1;
        self.current_delay = (self.current_delay * 2).min(MAX_BACKOFF);
        Action::ScheduleRetry(delay)
    }
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new()
    }
}
