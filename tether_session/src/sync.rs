//! Status synchronization.
//!
//! Tracks whether the displayed status has been resolved since the last
//! (re)bind, and owns the two timers that bound how long the UI can wait:
//! the bind timeout and the status-request timeout. A timer is always
//! cancelled through the [`TimerService`] as soon as its condition is
//! resolved; expiries also carry a token so an expiry already in flight
//! when the timer was cancelled is recognised as stale.

use std::time::Duration;
use tracing::debug;

/// How long a bind attempt may take before the UI is told `Disconnected`
pub const BIND_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long to wait for the answer to `RequestStatus`
pub const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Bind,
    StatusRequest,
}

/// Arms and cancels one-shot timers whose expiry comes back as an input.
pub trait TimerService: Send {
    /// Arm `kind`, replacing any earlier timer of the same kind
    fn arm(&mut self, kind: TimerKind, token: u64, after: Duration);

    /// Cancel `kind` if it is armed
    fn cancel(&mut self, kind: TimerKind);
}

#[derive(Debug)]
pub struct StatusSync {
    resolved: bool,
    next_token: u64,
    bind_timer: Option<u64>,
    status_timer: Option<u64>,
}

impl StatusSync {
    /// Starts unresolved: nothing is known about the service yet.
    pub fn new() -> Self {
        Self {
            resolved: false,
            next_token: 0,
            bind_timer: None,
            status_timer: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Arm the bind timeout, unless the status is already resolved.
    pub fn arm_bind_timeout(&mut self, timers: &mut dyn TimerService) {
        if self.resolved {
            return;
        }
        let token = self.issue_token();
        self.bind_timer = Some(token);
        timers.arm(TimerKind::Bind, token, BIND_TIMEOUT);
    }

    pub fn cancel_bind_timeout(&mut self, timers: &mut dyn TimerService) {
        if self.bind_timer.take().is_some() {
            timers.cancel(TimerKind::Bind);
        }
    }

    /// Arm the status-request timeout after `RequestStatus` went out.
    pub fn arm_status_request(&mut self, timers: &mut dyn TimerService) {
        let token = self.issue_token();
        self.status_timer = Some(token);
        timers.arm(TimerKind::StatusRequest, token, STATUS_REQUEST_TIMEOUT);
    }

    /// Mark the status resolved and cancel both timers.
    ///
    /// Returns `true` only for the call that performed the transition, which
    /// is what makes the first status report win.
    pub fn resolve(&mut self, timers: &mut dyn TimerService) -> bool {
        self.cancel_all(timers);
        if self.resolved {
            return false;
        }
        self.resolved = true;
        true
    }

    /// Forget the resolution; used whenever the bind is torn down.
    pub fn reset(&mut self, timers: &mut dyn TimerService) {
        self.cancel_all(timers);
        self.resolved = false;
    }

    /// Consume a timer expiry. Returns `false` for stale or cancelled timers.
    pub fn take_expiry(&mut self, kind: TimerKind, token: u64) -> bool {
        let slot = match kind {
            TimerKind::Bind => &mut self.bind_timer,
            TimerKind::StatusRequest => &mut self.status_timer,
        };
        if *slot == Some(token) {
            *slot = None;
            true
        } else {
            debug!(?kind, token, "ignoring stale timer expiry");
            false
        }
    }

    fn cancel_all(&mut self, timers: &mut dyn TimerService) {
        self.cancel_bind_timeout(timers);
        if self.status_timer.take().is_some() {
            timers.cancel(TimerKind::StatusRequest);
        }
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

impl Default for StatusSync {
    fn default() -> Self {
        Self::new()
    }
}
