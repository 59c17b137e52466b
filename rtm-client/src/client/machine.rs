//! The supervisor transition table, as a pure function.
//!
//! The event loop owns the connection, the timer and the fail counter; this
//! module only decides where to go and what to do, so the reconnect policy
//! can be unit-tested without sockets or clocks.

use std::time::Duration;

/// Outer lifecycle of the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and no desire for one.
    Stopped,
    /// A connect attempt is in flight.
    Connecting,
    Connected,
    /// Waiting out the back-off delay before the next attempt.
    Awaiting,
    /// A user stop is waiting for the connection to wind down.
    Stopping,
    /// Terminal.
    Disposed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClientEvent {
    Start,
    Stop,
    Dispose,
    ConnectingComplete,
    ConnectingFailed,
    ConnectionClosed,
    Tick,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClientEffect {
    /// Perform a connect attempt (emits ConnectingComplete/Failed).
    Connect,
    /// Drop the current connection and disconnect all subscriptions.
    ForgetConnection,
    /// Ask the backend to wind down; closure arrives as ConnectionClosed.
    StartDisconnect,
    ScheduleReconnect,
    CancelReconnect,
    ResetFailCount,
    IncrementFailCount,
    /// Run the Connected entry sequence: auth replay, subscription
    /// restore, offline-queue drain.
    EnterConnected,
    ExitLoop,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ClientGuards {
    /// False once the fail-count threshold has been exhausted.
    pub attempts_left: bool,
}

pub(crate) fn step(
    state: ClientState,
    event: ClientEvent,
    g: ClientGuards,
) -> (ClientState, Vec<ClientEffect>) {
    use ClientEffect::*;
    use ClientState::*;

    if state == Disposed {
        return (Disposed, Vec::new());
    }

    match (state, event) {
        (_, ClientEvent::Dispose) => {
            (Disposed, vec![CancelReconnect, ForgetConnection, ExitLoop])
        }

        (Stopped, ClientEvent::Start) => (Connecting, vec![Connect]),

        (Connecting, ClientEvent::ConnectingComplete) => {
            (Connected, vec![ResetFailCount, EnterConnected])
        }
        (Connecting, ClientEvent::ConnectingFailed) => {
            if g.attempts_left {
                (Awaiting, vec![IncrementFailCount, ScheduleReconnect])
            } else {
                (Stopped, vec![IncrementFailCount])
            }
        }
        (Connecting, ClientEvent::Stop) => (Stopped, vec![ForgetConnection]),
        (Connecting, ClientEvent::ConnectionClosed) => {
            (Awaiting, vec![ForgetConnection, ScheduleReconnect])
        }

        (Connected, ClientEvent::ConnectionClosed) => {
            (Awaiting, vec![ForgetConnection, ScheduleReconnect])
        }
        (Connected, ClientEvent::Stop) => (Stopping, vec![StartDisconnect]),

        (Awaiting, ClientEvent::Tick) => (Connecting, vec![Connect]),
        (Awaiting, ClientEvent::Stop) => (Stopped, vec![CancelReconnect]),

        (Stopping, ClientEvent::ConnectionClosed) => (Stopped, vec![ForgetConnection]),

        _ => (state, Vec::new()),
    }
}

/// `min(base × 2^fail_count, max)`: the full back-off interval measured
/// from the previous connect attempt.
pub(crate) fn backoff(base: Duration, max: Duration, fail_count: u32) -> Duration {
    let factor = 2u64.saturating_pow(fail_count);
    let factor = u32::try_from(factor).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}
