//! Fans report polling out across date ranges and folds every session's
//! result into the [`ReportInfoStore`].
//!
//! Each (range, scope) pair has at most one live session. Starting it again
//! aborts the old task and bumps its generation; results from a stale
//! generation are dropped under the registry lock, so a superseded or stopped
//! session can never write into the store.

use crate::config::PollingConfig;
use crate::errors::{ReportError, DATA_LOADING_FAILED};
use crate::http::ReportTransport;
use crate::observability::PollingMetrics;
use crate::report::polling::{PollingClient, SessionOutcome, SessionSummary, SessionTicket};
use crate::report::request::{self, ReportConfig};
use crate::report::store::{
    ErrorSlot, LoadingStatus, MetricsFamily, ReportInfo, ReportInfoStore,
    ReportPageLoadingStatus, RequestedFamilies,
};
use crate::report::types::{DateRange, MetricsScope, ReportIdResponse, ReportResponse};
use crate::telemetry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("date range starting {0} was requested twice")]
    DuplicateDateRange(String),

    #[error("failed to obtain a report id: {0}")]
    ReportId(#[source] ReportError),

    #[error("failed to encode report request: {0}")]
    Encode(#[from] serde_json::Error),
}

type SessionKey = (String, MetricsScope);

struct LiveSession {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionRegistry {
    next_generation: u64,
    live: HashMap<SessionKey, LiveSession>,
    requested: HashMap<String, RequestedFamilies>,
    succeeded: HashSet<SessionKey>,
    /// Range keys in the order they were first requested
    order: Vec<String>,
    /// Finished sessions whose store notifications are still being delivered
    publishing: usize,
}

impl SessionRegistry {
    fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.live
            .get(&(ticket.key.clone(), ticket.scope))
            .is_some_and(|session| session.generation == ticket.generation)
    }

    fn has_pending(&self, key: &str) -> bool {
        self.live.keys().any(|(live_key, _)| live_key == key)
    }

    fn has_succeeded(&self, key: &str, scope: MetricsScope) -> bool {
        self.succeeded.contains(&(key.to_string(), scope))
            || self.succeeded.contains(&(key.to_string(), MetricsScope::All))
    }

    fn requested(&self, key: &str) -> RequestedFamilies {
        self.requested.get(key).copied().unwrap_or_default()
    }

    /// Sessions that still keep the run from being settled
    fn outstanding(&self) -> usize {
        self.live.len() + self.publishing
    }
}

struct Shared {
    client: PollingClient,
    store: Arc<ReportInfoStore>,
    registry: Mutex<SessionRegistry>,
    report_id: tokio::sync::Mutex<Option<String>>,
    live: watch::Sender<usize>,
    metrics: Arc<PollingMetrics>,
    correlation_id: String,
}

/// Multi-range report orchestrator
#[derive(Clone)]
pub struct ReportOrchestrator {
    shared: Arc<Shared>,
}

impl ReportOrchestrator {
    pub fn new(transport: Arc<dyn ReportTransport>, config: PollingConfig) -> Self {
        Self::with_store(transport, config, Arc::new(ReportInfoStore::new()))
    }

    pub fn with_store(
        transport: Arc<dyn ReportTransport>,
        config: PollingConfig,
        store: Arc<ReportInfoStore>,
    ) -> Self {
        let metrics = Arc::new(PollingMetrics::new());
        let (live, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                client: PollingClient::new(transport, config, Arc::clone(&metrics)),
                store,
                registry: Mutex::new(SessionRegistry::default()),
                report_id: tokio::sync::Mutex::new(None),
                live,
                metrics,
                correlation_id: telemetry::generate_correlation_id(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ReportInfoStore> {
        &self.shared.store
    }

    pub fn metrics(&self) -> &Arc<PollingMetrics> {
        &self.shared.metrics
    }

    pub fn correlation_id(&self) -> &str {
        &self.shared.correlation_id
    }

    /// Request `scope` for every range that has not already succeeded for it.
    ///
    /// Ranges are polled concurrently; this returns once every session has
    /// been started. Use [`wait_until_settled`](Self::wait_until_settled) to
    /// wait for the results.
    pub async fn start_to_request_data(
        &self,
        scope: MetricsScope,
        date_ranges: &[DateRange],
        config: &ReportConfig,
    ) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();
        for range in date_ranges {
            if !seen.insert(range.key()) {
                return Err(OrchestratorError::DuplicateDateRange(range.key()));
            }
        }

        let pending: Vec<&DateRange> = {
            let registry = self.shared.registry();
            date_ranges
                .iter()
                .filter(|range| !registry.has_succeeded(&range.key(), scope))
                .collect()
        };
        if pending.is_empty() {
            debug!(scope = %scope, "Every requested range already succeeded");
            return Ok(());
        }

        let report_id = self.report_id().await?;
        let submit_url = format!("/reports/{report_id}");

        for range in pending {
            let body = serde_json::to_value(request::build(scope, config, range))?;
            self.start_session(scope, range.key(), &submit_url, body);
        }

        info!(
            scope = %scope,
            ranges = date_ranges.len(),
            correlation_id = %self.shared.correlation_id,
            "Report polling started"
        );
        Ok(())
    }

    fn start_session(&self, scope: MetricsScope, key: String, submit_url: &str, body: serde_json::Value) {
        let shared = &self.shared;
        let mut registry = shared.registry();

        if !registry.order.contains(&key) {
            registry.order.push(key.clone());
        }
        registry.requested.entry(key.clone()).or_default().include(scope);
        registry.succeeded.remove(&(key.clone(), scope));

        registry.next_generation += 1;
        let generation = registry.next_generation;
        if let Some(previous) = registry.live.remove(&(key.clone(), scope)) {
            previous.handle.abort();
            shared.metrics.record_superseded();
            debug!(range = %key, scope = %scope, generation = previous.generation, "Superseded polling session");
        }

        // Subscribers may call back into the orchestrator, so they are only
        // notified once the registry lock is released
        let ((), notice) = shared.store.update_deferred(&key, |info| {
            for slot in ErrorSlot::cleared_by(scope) {
                info.clear_error(*slot);
            }
        });
        shared.store.update_loading_status(&key, |status| {
            status.gain_polling_url = LoadingStatus::loading();
            status.polling = LoadingStatus::loading();
            for family in MetricsFamily::ALL {
                if family.is_covered_by(scope) {
                    *status.family_mut(family) = LoadingStatus::loading();
                }
            }
        });

        let ticket = SessionTicket {
            key: key.clone(),
            scope,
            generation,
        };
        let span = telemetry::create_polling_span(
            &key,
            &scope.to_string(),
            generation,
            &shared.correlation_id,
        );
        let task_shared = Arc::clone(shared);
        let submit_url = submit_url.to_string();
        let handle = tokio::spawn(
            async move {
                let progress_shared = Arc::clone(&task_shared);
                let progress_ticket = ticket.clone();
                let summary = task_shared
                    .client
                    .run(&ticket, &submit_url, body, move |report| {
                        progress_shared.apply_progress(&progress_ticket, report)
                    })
                    .await;
                task_shared.finish(&ticket, summary);
            }
            .instrument(span),
        );

        registry.live.insert((key, scope), LiveSession { generation, handle });
        shared.live.send_replace(registry.outstanding());
        drop(registry);

        shared.store.publish([notice]);
    }

    async fn report_id(&self) -> Result<String, OrchestratorError> {
        let mut cached = self.shared.report_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let response = self
            .shared
            .client
            .transport()
            .post("/reports", None)
            .await
            .map_err(|e| OrchestratorError::ReportId(e.into()))?;
        if !response.is_success() {
            return Err(OrchestratorError::ReportId(ReportError::from_response(&response)));
        }
        let ReportIdResponse { report_id } = response
            .json()
            .map_err(|e| OrchestratorError::ReportId(ReportError::malformed(response.status, &e)))?;

        debug!(report_id = %report_id, "Obtained report id");
        *cached = Some(report_id.clone());
        Ok(report_id)
    }

    /// Cancel every live session; resolved records are kept and the loading
    /// indicators of the cancelled ranges are cleared
    pub fn stop_polling_reports(&self) {
        let mut registry = self.shared.registry();
        let stopped = registry.live.len();
        for ((key, scope), session) in registry.live.drain() {
            session.handle.abort();
            self.shared
                .store
                .update_loading_status(&key, |status| clear_loading(status, scope));
        }
        self.shared.live.send_replace(registry.outstanding());
        if stopped > 0 {
            info!(stopped, "Stopped report polling");
        }
    }

    /// Whether any session is still live
    pub fn has_polling_started(&self) -> bool {
        *self.shared.live.borrow() > 0
    }

    /// Number of sessions keeping the run unsettled, as a watch
    pub fn live_sessions(&self) -> watch::Receiver<usize> {
        self.shared.live.subscribe()
    }

    /// Resolve once no session is live
    pub async fn wait_until_settled(&self) {
        let mut live = self.shared.live.subscribe();
        // The sender lives in `shared`, which `self` keeps alive
        let _ = live.wait_for(|count| *count == 0).await;
    }

    /// Records of every requested range, in request order
    pub fn report_infos(&self) -> Vec<ReportInfo> {
        let order = self.shared.registry().order.clone();
        order
            .iter()
            .filter_map(|key| self.shared.store.find(key))
            .collect()
    }

    /// Forget all sessions, records and the cached report id
    pub async fn reset(&self) {
        self.stop_polling_reports();
        {
            let mut registry = self.shared.registry();
            let publishing = registry.publishing;
            *registry = SessionRegistry {
                publishing,
                ..Default::default()
            };
        }
        self.shared.store.reset();
        *self.shared.report_id.lock().await = None;
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_progress(&self, ticket: &SessionTicket, report: &ReportResponse) {
        let registry = self.registry();
        if !registry.is_current(ticket) {
            return;
        }
        let requested = registry.requested(&ticket.key);
        let (_, notice) = self.store.update_deferred(&ticket.key, |info| {
            info.merge_report(ticket.scope, report.clone(), requested, true)
        });
        self.store.update_loading_status(&ticket.key, |status| {
            status.gain_polling_url = LoadingStatus::loaded();
        });
        drop(registry);

        self.store.publish([notice]);
    }

    fn finish(&self, ticket: &SessionTicket, summary: SessionSummary) {
        let mut registry = self.registry();
        if !registry.is_current(ticket) {
            debug!(
                range = %ticket.key,
                scope = %ticket.scope,
                generation = ticket.generation,
                "Dropping result of stale polling session"
            );
            return;
        }
        registry.live.remove(&(ticket.key.clone(), ticket.scope));
        let pending = registry.has_pending(&ticket.key);
        let requested = registry.requested(&ticket.key);
        let scope = ticket.scope;
        let mut notices = Vec::new();

        match summary.outcome {
            SessionOutcome::Succeeded(report) => {
                self.metrics.record_success();
                registry.succeeded.insert((ticket.key.clone(), scope));
                let (info, notice) = self.store.update_deferred(&ticket.key, |info| {
                    info.merge_report(scope, *report, requested, pending);
                    info.clone()
                });
                notices.push(notice);
                self.store.update_loading_status(&ticket.key, |status| {
                    status.gain_polling_url = LoadingStatus::loaded();
                    status.polling = LoadingStatus::loaded();
                    for family in MetricsFamily::ALL {
                        if family.is_covered_by(scope) {
                            *status.family_mut(family) = if info.family_error(family).is_some() {
                                LoadingStatus::loaded_with_error()
                            } else {
                                LoadingStatus::loaded()
                            };
                        }
                    }
                });
            }
            SessionOutcome::Failed(ref error) | SessionOutcome::TimedOut(ref error) => {
                if matches!(summary.outcome, SessionOutcome::TimedOut(_)) {
                    self.metrics.record_timeout();
                } else {
                    self.metrics.record_failure();
                }
                let slot = ErrorSlot::for_outcome(scope, error.kind());
                info!(
                    range = %ticket.key,
                    scope = %scope,
                    slot = %slot,
                    status = ?error.status(),
                    error = %error,
                    "Report polling failed"
                );
                let ((), notice) = self.store.update_deferred(&ticket.key, |info| {
                    info.set_error(slot, DATA_LOADING_FAILED);
                    info.refresh_completion(requested, pending);
                });
                notices.push(notice);
                let submitted = summary.polls > 0;
                self.store.update_loading_status(&ticket.key, |status| {
                    status.gain_polling_url = if submitted {
                        LoadingStatus::loaded()
                    } else {
                        LoadingStatus::loaded_with_error()
                    };
                    status.polling = LoadingStatus::loaded_with_error();
                    for family in MetricsFamily::ALL {
                        if family.is_covered_by(scope) {
                            *status.family_mut(family) = LoadingStatus::loaded_with_error();
                        }
                    }
                });
            }
        }

        // Hold the run open until subscribers have seen the outcome
        registry.publishing += 1;
        self.live.send_replace(registry.outstanding());
        drop(registry);

        self.store.publish(notices);

        let mut registry = self.registry();
        registry.publishing -= 1;
        self.live.send_replace(registry.outstanding());
    }
}

/// Drop the "loading" state a cancelled `scope` session left behind
fn clear_loading(status: &mut ReportPageLoadingStatus, scope: MetricsScope) {
    for step in [&mut status.gain_polling_url, &mut status.polling] {
        if step.is_loading {
            *step = LoadingStatus::default();
        }
    }
    for family in MetricsFamily::ALL {
        if family.is_covered_by(scope) && status.family_mut(family).is_loading {
            *status.family_mut(family) = LoadingStatus::default();
        }
    }
}
