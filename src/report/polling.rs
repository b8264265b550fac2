//! One pending-report lifecycle: submit, then poll the callback until the
//! report is complete, a permanent failure is seen, or the session runs out
//! of time or retries.

use crate::config::PollingConfig;
use crate::errors::ReportError;
use crate::http::{HttpResponse, ReportTransport};
use crate::observability::PollingMetrics;
use crate::report::session::{phase_of, PollingSession, SessionEvent, SessionPhase};
use crate::report::types::{CallbackResponse, MetricsScope, ReportResponse};
use rand::Rng;
use serde_json::Value;
use statig::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies the (range, scope) pair a session works for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub key: String,
    pub scope: MetricsScope,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Succeeded(Box<ReportResponse>),
    Failed(ReportError),
    TimedOut(ReportError),
}

impl SessionOutcome {
    pub fn error(&self) -> Option<&ReportError> {
        match self {
            SessionOutcome::Succeeded(_) => None,
            SessionOutcome::Failed(error) | SessionOutcome::TimedOut(error) => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub phase: SessionPhase,
    /// Callback polls issued, successful or not
    pub polls: u32,
}

enum Step {
    Wait(Duration),
    Done(SessionOutcome),
}

/// Drives [`PollingSession`] machines against a [`ReportTransport`]
#[derive(Clone)]
pub struct PollingClient {
    transport: Arc<dyn ReportTransport>,
    config: PollingConfig,
    metrics: Arc<PollingMetrics>,
}

impl PollingClient {
    pub fn new(
        transport: Arc<dyn ReportTransport>,
        config: PollingConfig,
        metrics: Arc<PollingMetrics>,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
        }
    }

    pub fn transport(&self) -> &Arc<dyn ReportTransport> {
        &self.transport
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Run one session to a terminal state.
    ///
    /// `on_progress` sees every non-terminal report payload, in order.
    pub async fn run<F>(
        &self,
        ticket: &SessionTicket,
        submit_url: &str,
        body: Value,
        mut on_progress: F,
    ) -> SessionSummary
    where
        F: FnMut(&ReportResponse) + Send,
    {
        let mut machine = PollingSession::new(
            ticket.key.clone(),
            ticket.scope,
            self.config.max_transient_failures,
        )
        .state_machine();
        let started = Instant::now();
        let deadline = started + self.config.session_deadline();
        let mut last_status = None;

        let driven = tokio::time::timeout_at(
            deadline,
            self.drive(
                &mut machine,
                ticket,
                submit_url,
                body,
                &mut on_progress,
                &mut last_status,
            ),
        )
        .await;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(_) => {
                machine.handle(&SessionEvent::DeadlineExceeded);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(
                    range = %ticket.key,
                    scope = %ticket.scope,
                    elapsed_ms,
                    last_status = ?last_status,
                    "Report polling deadline exceeded"
                );
                SessionOutcome::TimedOut(ReportError::deadline_exceeded(elapsed_ms, last_status))
            }
        };

        let phase = phase_of(&machine);
        let polls = machine.inner().polls();
        info!(
            range = %ticket.key,
            scope = %ticket.scope,
            generation = ticket.generation,
            phase = ?phase,
            polls,
            "Report polling session finished"
        );

        SessionSummary {
            outcome,
            phase,
            polls,
        }
    }

    async fn drive<F>(
        &self,
        machine: &mut StateMachine<PollingSession>,
        ticket: &SessionTicket,
        submit_url: &str,
        body: Value,
        on_progress: &mut F,
        last_status: &mut Option<u16>,
    ) -> SessionOutcome
    where
        F: FnMut(&ReportResponse) + Send,
    {
        self.metrics.record_submission();
        debug!(range = %ticket.key, scope = %ticket.scope, url = %submit_url, "Submitting report request");

        let response = match self.transport.post(submit_url, Some(body)).await {
            Ok(response) => response,
            Err(error) => {
                let error = ReportError::from(error);
                machine.handle(&SessionEvent::TransientFailure { kind: error.kind() });
                return SessionOutcome::Failed(error);
            }
        };
        *last_status = Some(response.status);

        let callback = match self.accept_submission(machine, ticket.scope, &response) {
            Ok(callback) => callback,
            Err(outcome) => return outcome,
        };

        let interval = self.config.clamp_interval(callback.interval);
        machine.handle(&SessionEvent::Accepted {
            callback_url: callback.callback_url.clone(),
            interval,
        });
        machine.handle(&SessionEvent::StartPolling);

        loop {
            self.metrics.record_poll();
            let step = match self.transport.get(&callback.callback_url).await {
                Ok(response) => {
                    *last_status = Some(response.status);
                    self.on_poll_response(machine, ticket, &response, interval, on_progress)
                }
                Err(error) => self.on_transient(machine, ticket, ReportError::from(error)),
            };

            match step {
                Step::Wait(delay) => tokio::time::sleep(delay).await,
                Step::Done(outcome) => return outcome,
            }
        }
    }

    /// Interpret the submission response; `Err` carries a terminal outcome
    fn accept_submission(
        &self,
        machine: &mut StateMachine<PollingSession>,
        scope: MetricsScope,
        response: &HttpResponse,
    ) -> Result<CallbackResponse, SessionOutcome> {
        match response.status {
            202 => response.json::<CallbackResponse>().map_err(|e| {
                Self::permanent(machine, ReportError::malformed(response.status, &e))
            }),
            200 | 201 => match response.json::<ReportResponse>() {
                Ok(report) if scope.is_completed_in(&report) => {
                    machine.handle(&SessionEvent::Completed);
                    Err(SessionOutcome::Succeeded(Box::new(report)))
                }
                Ok(_) => Err(Self::permanent(
                    machine,
                    ReportError::Unknown {
                        status: Some(response.status),
                        message: "submission returned an incomplete report without a callback"
                            .to_string(),
                    },
                )),
                Err(e) => Err(Self::permanent(
                    machine,
                    ReportError::malformed(response.status, &e),
                )),
            },
            _ => Err(Self::permanent(machine, ReportError::from_response(response))),
        }
    }

    fn on_poll_response<F>(
        &self,
        machine: &mut StateMachine<PollingSession>,
        ticket: &SessionTicket,
        response: &HttpResponse,
        interval: Duration,
        on_progress: &mut F,
    ) -> Step
    where
        F: FnMut(&ReportResponse) + Send,
    {
        match response.status {
            200 | 201 => match response.json::<ReportResponse>() {
                Ok(report) if ticket.scope.is_completed_in(&report) => {
                    machine.handle(&SessionEvent::Completed);
                    Step::Done(SessionOutcome::Succeeded(Box::new(report)))
                }
                Ok(report) => {
                    machine.handle(&SessionEvent::Processing);
                    on_progress(&report);
                    Step::Wait(interval)
                }
                Err(e) => Step::Done(Self::permanent(
                    machine,
                    ReportError::malformed(response.status, &e),
                )),
            },
            202 => {
                machine.handle(&SessionEvent::Processing);
                Step::Wait(interval)
            }
            _ => {
                let error = ReportError::from_response(response);
                if error.kind().is_transient() {
                    self.on_transient(machine, ticket, error)
                } else {
                    Step::Done(Self::permanent(machine, error))
                }
            }
        }
    }

    fn on_transient(
        &self,
        machine: &mut StateMachine<PollingSession>,
        ticket: &SessionTicket,
        error: ReportError,
    ) -> Step {
        self.metrics.record_transient_failure();
        machine.handle(&SessionEvent::TransientFailure { kind: error.kind() });

        if phase_of(machine) == SessionPhase::TimedOut {
            return Step::Done(SessionOutcome::TimedOut(error));
        }

        let failures = machine.inner().consecutive_failures();
        let delay = self.backoff_delay(failures);
        debug!(
            range = %ticket.key,
            scope = %ticket.scope,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient polling failure, backing off"
        );
        Step::Wait(delay)
    }

    fn permanent(machine: &mut StateMachine<PollingSession>, error: ReportError) -> SessionOutcome {
        machine.handle(&SessionEvent::PermanentFailure { kind: error.kind() });
        SessionOutcome::Failed(error)
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.config.backoff(failures);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor)
    }
}
