//! Heartbeat keep-alive
//!
//! After login the client sends a heartbeat request at a fixed rate; the
//! server answers each request with exactly one heartbeat response.

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::protocol::{Message, MessageType};

/// Default interval between heartbeat requests
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Lifecycle of a [`HeartbeatTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Cancelled,
}

/// Fixed-rate heartbeat schedule owned by a single connection task
///
/// The timer starts at most once. It is cancelled explicitly or when it is
/// dropped, so leaving the connection loop by any path stops the ticks.
#[derive(Debug)]
pub struct HeartbeatTimer {
    period: Duration,
    interval: Option<Interval>,
    state: TimerState,
}

impl HeartbeatTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            interval: None,
            state: TimerState::Idle,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TimerState::Running
    }

    /// Start ticking now; the first tick fires immediately
    ///
    /// Returns `false` if the timer was already started or cancelled.
    pub fn start(&mut self) -> bool {
        if self.state != TimerState::Idle {
            return false;
        }

        let mut interval = tokio::time::interval_at(Instant::now(), self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        self.interval = Some(interval);
        self.state = TimerState::Running;
        tracing::debug!("Heartbeat started, every {:?}", self.period);
        true
    }

    /// Wait for the next tick and build the heartbeat request to send
    ///
    /// Never completes while the timer is not running, which makes it safe
    /// to poll from a `select!` loop at all times.
    pub async fn tick(&mut self) -> Message {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
                Message::heartbeat_req()
            }
            None => std::future::pending().await,
        }
    }

    /// Stop the timer; cancelling twice or before start is a no-op
    ///
    /// Returns `true` only for the call that actually stopped a running timer.
    pub fn cancel(&mut self) -> bool {
        if self.state == TimerState::Cancelled {
            return false;
        }

        let was_running = self.interval.take().is_some();
        self.state = TimerState::Cancelled;
        if was_running {
            tracing::debug!("Heartbeat cancelled");
        }
        was_running
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Server-side answer to a heartbeat request, if `message` is one
pub fn heartbeat_reply(message: &Message) -> Option<Message> {
    if message.message_type() != MessageType::HeartbeatReq {
        return None;
    }
    Some(Message::heartbeat_resp().with_session_id(message.header.session_id))
}
