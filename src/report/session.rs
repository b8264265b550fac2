use crate::errors::ErrorKind;
use crate::report::types::MetricsScope;
use statig::prelude::*;
use std::time::Duration;

/// Inputs observed by one polling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Submission accepted; poll `callback_url` every `interval`
    Accepted {
        callback_url: String,
        interval: Duration,
    },
    /// Callback stored, first poll about to be issued
    StartPolling,
    /// A payload complete for the session scope arrived
    Completed,
    /// A poll came back without a terminal payload
    Processing,
    TransientFailure { kind: ErrorKind },
    PermanentFailure { kind: ErrorKind },
    DeadlineExceeded,
}

/// Externally visible lifecycle position of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Submitting,
    AwaitingCallback,
    Polling,
    Succeeded,
    Failed(ErrorKind),
    TimedOut,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Succeeded | SessionPhase::Failed(_) | SessionPhase::TimedOut
        )
    }
}

/// Bookkeeping for one (date range, scope) report request
#[derive(Debug, Default)]
pub struct PollingSession {
    range: String,
    scope: Option<MetricsScope>,
    callback_url: Option<String>,
    interval: Duration,
    polls: u32,
    consecutive_failures: u32,
    transient_failures: u32,
    max_transient_failures: u32,
    failure: Option<ErrorKind>,
}

impl PollingSession {
    pub fn new(range: String, scope: MetricsScope, max_transient_failures: u32) -> Self {
        Self {
            range,
            scope: Some(scope),
            max_transient_failures,
            ..Default::default()
        }
    }

    fn record_poll(&mut self) {
        self.polls += 1;
    }
}

#[state_machine(initial = "State::submitting()", state(derive(Debug, Clone, PartialEq, Eq)))]
impl PollingSession {
    #[state]
    fn submitting(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Accepted {
                callback_url,
                interval,
            } => {
                self.callback_url = Some(callback_url.clone());
                self.interval = *interval;
                tracing::debug!(
                    range = %self.range,
                    scope = ?self.scope,
                    callback_url = %callback_url,
                    interval_ms = interval.as_millis() as u64,
                    "Report submission accepted"
                );
                Transition(State::awaiting_callback())
            }
            SessionEvent::Completed => Transition(State::succeeded()),
            // Submission is never retried
            SessionEvent::TransientFailure { kind } | SessionEvent::PermanentFailure { kind } => {
                self.failure = Some(*kind);
                Transition(State::failed())
            }
            SessionEvent::DeadlineExceeded => Transition(State::timed_out()),
            _ => Handled,
        }
    }

    #[state]
    fn awaiting_callback(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::StartPolling => Transition(State::polling()),
            SessionEvent::DeadlineExceeded => Transition(State::timed_out()),
            _ => Handled,
        }
    }

    #[state]
    fn polling(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Completed => {
                self.record_poll();
                Transition(State::succeeded())
            }
            SessionEvent::Processing => {
                self.record_poll();
                self.consecutive_failures = 0;
                Handled
            }
            SessionEvent::TransientFailure { kind } => {
                self.record_poll();
                self.consecutive_failures += 1;
                self.transient_failures += 1;
                if self.consecutive_failures > self.max_transient_failures {
                    tracing::warn!(
                        range = %self.range,
                        scope = ?self.scope,
                        failures = self.consecutive_failures,
                        last_kind = %kind,
                        "Retry budget exhausted"
                    );
                    Transition(State::timed_out())
                } else {
                    Handled
                }
            }
            SessionEvent::PermanentFailure { kind } => {
                self.record_poll();
                self.failure = Some(*kind);
                Transition(State::failed())
            }
            SessionEvent::DeadlineExceeded => Transition(State::timed_out()),
            _ => Handled,
        }
    }

    #[state]
    fn succeeded(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn timed_out(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

impl PollingSession {
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    pub fn failure(&self) -> Option<ErrorKind> {
        self.failure
    }
}

/// Current phase of a running session machine
pub fn phase_of(machine: &StateMachine<PollingSession>) -> SessionPhase {
    match machine.state() {
        State::Submitting { .. } => SessionPhase::Submitting,
        State::AwaitingCallback { .. } => SessionPhase::AwaitingCallback,
        State::Polling { .. } => SessionPhase::Polling,
        State::Succeeded { .. } => SessionPhase::Succeeded,
        State::Failed { .. } => {
            SessionPhase::Failed(machine.inner().failure().unwrap_or(ErrorKind::Unknown))
        }
        State::TimedOut { .. } => SessionPhase::TimedOut,
    }
}
