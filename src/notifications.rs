//! Turns store transitions into queued, de-duplicated user notifications.

use crate::report::orchestrator::ReportOrchestrator;
use crate::report::store::{ErrorSlot, MetricsFamily, ReportInfo, ReportInfoStore, SubscriptionId};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Minutes of export validity left when the reminder is shown
pub const EXPORT_REMINDER_MINUTES: u64 = 5;

pub const REQUEST_FAILED: &str = "Failed to request!";

pub fn timeout_message(label: &str) -> String {
    format!("{label} loading timeout, please click \"Retry\"!")
}

pub fn failed_to_get_data(label: &str) -> String {
    format!("Failed to get {label} data, please click \"retry\"!")
}

pub fn export_expiry_message(minutes: u64) -> String {
    format!("The file will expire in {minutes} minutes, please download it in time.")
}

/// Page of the report screen currently in front of the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReportView {
    #[default]
    Summary,
    BoardDetail,
    DoraDetail,
    BoardChart,
    DoraChart,
}

impl ReportView {
    pub fn permits_notifications(self) -> bool {
        matches!(
            self,
            ReportView::Summary | ReportView::BoardChart | ReportView::DoraChart
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    /// Range key the notification was raised for
    pub range: String,
    pub message: String,
    pub level: NotificationLevel,
}

impl Notification {
    fn new(range: &str, message: String, level: NotificationLevel) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            range: range.to_string(),
            message,
            level,
        }
    }
}

#[derive(Debug, Default)]
struct DispatcherState {
    queue: VecDeque<Notification>,
    displayed: Vec<Notification>,
    view: ReportView,
    selected: Option<String>,
    export_announced: bool,
    reminder_announced: bool,
}

/// Watches a [`ReportInfoStore`] and queues one notification per raised slot
/// or per-family gate, closing it in the store as soon as it is queued.
#[derive(Debug)]
pub struct NotificationDispatcher {
    store: Weak<ReportInfoStore>,
    state: Mutex<DispatcherState>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher observing every range of `store`
    pub fn attach(store: &Arc<ReportInfoStore>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            store: Arc::downgrade(store),
            state: Mutex::new(DispatcherState::default()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&dispatcher);
        let id = store.subscribe(
            |_| true,
            move |info| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.observe(info);
                }
            },
        );
        *dispatcher
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        // Records raised before attaching are surfaced too
        for info in store.all() {
            dispatcher.observe(&info);
        }
        dispatcher
    }

    /// Stop observing the store; queued notifications are kept
    pub fn detach(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(id), Some(store)) = (id, self.store.upgrade()) {
            store.unsubscribe(id);
        }
    }

    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, snapshot: &ReportInfo) {
        if !has_raised_condition(snapshot) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };

        // Re-check against the live record so concurrent observers of the
        // same transition cannot both enqueue it
        let raised = store.update(&snapshot.id, |info| {
            let mut raised = Vec::new();
            for slot in ErrorSlot::ALL {
                if info.slot(slot).is_pending() {
                    raised.push(slot_notification(&info.id, slot));
                    info.close_error(slot);
                }
            }
            for family in MetricsFamily::ALL {
                if info.gate(family) {
                    if info.family_error(family).is_some() {
                        raised.push(Notification::new(
                            &info.id,
                            failed_to_get_data(family.label()),
                            NotificationLevel::Error,
                        ));
                    }
                    info.set_gate(family, false);
                }
            }
            raised
        });

        if !raised.is_empty() {
            debug!(range = %snapshot.id, count = raised.len(), "Queued report notifications");
            self.state().queue.extend(raised);
        }
    }

    /// Announce export expiry for a run whose polling has settled.
    ///
    /// The validity comes from the first range holding a report, and a CSV
    /// file generated for any range makes the export available. Returns the
    /// announced range and minutes when the notice was queued by this call.
    pub fn on_polling_settled(&self) -> Option<(String, u64)> {
        let store = self.store.upgrade()?;
        let infos = store.all();
        let first = infos.iter().find(|info| info.report_data.is_some())?;
        let minutes = first.report_data.as_ref()?.export_validity_time?;
        let csv_generated = infos.iter().any(|info| {
            info.report_data
                .as_ref()
                .is_some_and(|data| data.is_successful_create_csv_file)
        });
        if !csv_generated || !self.announce_export_validity(&first.id, minutes) {
            return None;
        }
        Some((first.id.clone(), minutes))
    }

    /// Queue the export-expiry notice; only the first call has an effect
    pub fn announce_export_validity(&self, range: &str, minutes: u64) -> bool {
        let mut state = self.state();
        if state.export_announced {
            return false;
        }
        state.export_announced = true;
        state.queue.push_back(Notification::new(
            range,
            export_expiry_message(minutes),
            NotificationLevel::Warning,
        ));
        true
    }

    /// Queue the "about to expire" reminder; only the first call has an effect
    pub fn remind_export_expiry(&self, range: &str) {
        let mut state = self.state();
        if state.reminder_announced {
            return;
        }
        state.reminder_announced = true;
        state.queue.push_back(Notification::new(
            range,
            export_expiry_message(EXPORT_REMINDER_MINUTES),
            NotificationLevel::Warning,
        ));
    }

    /// Announce export expiry each time `orchestrator` settles, then remind
    /// the user shortly before the file expires.
    ///
    /// The task ends after the reminder, or when either side is dropped.
    pub fn follow_polling(self: &Arc<Self>, orchestrator: &ReportOrchestrator) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        let mut live = orchestrator.live_sessions();
        tokio::spawn(async move {
            loop {
                if live.wait_for(|count| *count == 0).await.is_err() {
                    return;
                }
                let announced = match dispatcher.upgrade() {
                    Some(dispatcher) => dispatcher.on_polling_settled(),
                    None => return,
                };
                if let Some((range, minutes)) = announced {
                    info!(range = %range, minutes, "Export file validity announced");
                    let remaining = minutes.saturating_sub(EXPORT_REMINDER_MINUTES);
                    tokio::time::sleep(Duration::from_secs(remaining * 60)).await;
                    if let Some(dispatcher) = dispatcher.upgrade() {
                        dispatcher.remind_export_expiry(&range);
                    }
                    return;
                }
                if live.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    pub fn view(&self) -> ReportView {
        self.state().view
    }

    /// Switching to a detail view closes what is currently displayed; the
    /// queue itself is untouched
    pub fn set_view(&self, view: ReportView) {
        let mut state = self.state();
        state.view = view;
        if matches!(view, ReportView::BoardDetail | ReportView::DoraDetail) {
            state.displayed.clear();
        }
    }

    /// Selecting another range closes the displayed errors of every other range
    pub fn select_range(&self, key: &str) {
        let mut state = self.state();
        if state.selected.as_deref() == Some(key) {
            return;
        }
        state.selected = Some(key.to_string());
        state.displayed.retain(|notification| {
            notification.level != NotificationLevel::Error || notification.range == key
        });
    }

    /// Display the oldest queued notification if the current view allows it
    pub fn next_notification(&self) -> Option<Notification> {
        let mut state = self.state();
        if !state.view.permits_notifications() {
            return None;
        }
        let notification = state.queue.pop_front()?;
        state.displayed.push(notification.clone());
        Some(notification)
    }

    pub fn drain_ready(&self) -> Vec<Notification> {
        std::iter::from_fn(|| self.next_notification()).collect()
    }

    pub fn pending(&self) -> Vec<Notification> {
        self.state().queue.iter().cloned().collect()
    }

    pub fn displayed(&self) -> Vec<Notification> {
        self.state().displayed.clone()
    }

    pub fn dismiss(&self, id: &str) -> bool {
        let mut state = self.state();
        let before = state.displayed.len();
        state.displayed.retain(|notification| notification.id != id);
        state.displayed.len() != before
    }
}

fn has_raised_condition(info: &ReportInfo) -> bool {
    ErrorSlot::ALL.iter().any(|slot| info.slot(*slot).is_pending())
        || MetricsFamily::ALL.iter().any(|family| info.gate(*family))
}

fn slot_notification(range: &str, slot: ErrorSlot) -> Notification {
    let message = if slot.is_timeout() {
        timeout_message(slot.family_label())
    } else {
        REQUEST_FAILED.to_string()
    };
    Notification::new(range, message, NotificationLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use crate::errors::DATA_LOADING_FAILED;
    use crate::report::request::ReportConfig;
    use crate::report::testing::{Reply, ScriptedTransport};
    use crate::report::types::{
        DateRange, MetricsFamilyError, MetricsScope, ReportMetricsError, ReportResponse,
    };
    use serde_json::{json, Value};

    const KEY: &str = "2024-01-01T00:00:00+00:00";

    fn setup() -> (Arc<ReportInfoStore>, Arc<NotificationDispatcher>) {
        let store = Arc::new(ReportInfoStore::new());
        let dispatcher = NotificationDispatcher::attach(&store);
        (store, dispatcher)
    }

    fn messages(notifications: &[Notification]) -> Vec<&str> {
        notifications.iter().map(|n| n.message.as_str()).collect()
    }

    #[test]
    fn test_raised_slot_is_notified_exactly_once() {
        let (store, dispatcher) = setup();

        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutBoard, DATA_LOADING_FAILED));
        store.update(KEY, |_| ());

        let queued = dispatcher.pending();
        assert_eq!(
            messages(&queued),
            vec!["Board metrics loading timeout, please click \"Retry\"!"]
        );
        let info = store.get(KEY);
        assert!(!info.timeout4_board.should_show);
        assert_eq!(info.timeout4_board.message, DATA_LOADING_FAILED);
    }

    #[test]
    fn test_general_errors_use_request_failed_text() {
        let (store, dispatcher) = setup();

        store.update(KEY, |info| {
            info.set_error(ErrorSlot::GeneralErrorReport, DATA_LOADING_FAILED)
        });

        assert_eq!(messages(&dispatcher.pending()), vec![REQUEST_FAILED]);
    }

    #[test]
    fn test_gates_notify_only_when_the_family_error_exists() {
        let (store, dispatcher) = setup();

        store.update(KEY, |info| {
            info.report_data = Some(ReportResponse {
                report_metrics_error: ReportMetricsError {
                    pipeline_metrics_error: Some(MetricsFamilyError {
                        status: 401,
                        message: None,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            });
            for family in MetricsFamily::ALL {
                info.set_gate(family, true);
            }
        });

        assert_eq!(
            messages(&dispatcher.pending()),
            vec!["Failed to get Buildkite data, please click \"retry\"!"]
        );
        let info = store.get(KEY);
        assert!(MetricsFamily::ALL.iter().all(|family| !info.gate(*family)));
    }

    #[test]
    fn test_queue_drains_only_on_permitted_views() {
        let (store, dispatcher) = setup();
        dispatcher.set_view(ReportView::BoardDetail);

        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutDora, DATA_LOADING_FAILED));
        store.update("2024-01-08T00:00:00+00:00", |info| {
            info.set_error(ErrorSlot::TimeoutReport, DATA_LOADING_FAILED)
        });

        assert_eq!(dispatcher.next_notification(), None);
        assert_eq!(dispatcher.pending().len(), 2);

        dispatcher.set_view(ReportView::DoraChart);
        let first = dispatcher.next_notification().unwrap();
        assert_eq!(first.message, "DORA metrics loading timeout, please click \"Retry\"!");
        assert_eq!(first.range, KEY);

        dispatcher.set_view(ReportView::Summary);
        let rest = dispatcher.drain_ready();
        assert_eq!(messages(&rest), vec!["Report loading timeout, please click \"Retry\"!"]);
        assert_eq!(dispatcher.displayed().len(), 2);

        dispatcher.set_view(ReportView::DoraDetail);
        assert!(dispatcher.displayed().is_empty());
    }

    #[test]
    fn test_dismiss_removes_displayed_notification() {
        let (store, dispatcher) = setup();
        store.update(KEY, |info| info.set_error(ErrorSlot::GeneralErrorDora, DATA_LOADING_FAILED));

        let shown = dispatcher.next_notification().unwrap();

        assert!(dispatcher.dismiss(&shown.id));
        assert!(!dispatcher.dismiss(&shown.id));
        assert!(dispatcher.displayed().is_empty());
    }

    #[test]
    fn test_export_expiry_is_announced_once_after_settling() {
        let (store, dispatcher) = setup();
        let ready = ReportResponse {
            all_metrics_completed: true,
            is_successful_create_csv_file: true,
            export_validity_time: Some(30),
            ..Default::default()
        };

        store.update(KEY, |info| info.report_data = Some(ready.clone()));
        store.update("2024-01-08T00:00:00+00:00", |info| info.report_data = Some(ready));
        assert!(dispatcher.pending().is_empty());

        assert_eq!(dispatcher.on_polling_settled(), Some((KEY.to_string(), 30)));
        assert_eq!(dispatcher.on_polling_settled(), None);
        assert_eq!(
            messages(&dispatcher.pending()),
            vec!["The file will expire in 30 minutes, please download it in time."]
        );
    }

    #[test]
    fn test_no_export_notice_without_a_csv_file() {
        let (store, dispatcher) = setup();
        store.update(KEY, |info| {
            info.report_data = Some(ReportResponse {
                export_validity_time: Some(30),
                ..Default::default()
            })
        });

        assert_eq!(dispatcher.on_polling_settled(), None);
        assert!(dispatcher.pending().is_empty());
    }

    #[test]
    fn test_selecting_a_range_closes_errors_of_other_ranges() {
        let (store, dispatcher) = setup();
        let other = "2024-01-08T00:00:00+00:00";
        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutBoard, DATA_LOADING_FAILED));
        store.update(other, |info| info.set_error(ErrorSlot::TimeoutDora, DATA_LOADING_FAILED));
        dispatcher.announce_export_validity(KEY, 30);
        assert_eq!(dispatcher.drain_ready().len(), 3);

        dispatcher.select_range(other);

        let displayed = dispatcher.displayed();
        assert_eq!(displayed.len(), 2);
        assert!(displayed
            .iter()
            .all(|n| n.range == other || n.level == NotificationLevel::Warning));

        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutReport, DATA_LOADING_FAILED));
        dispatcher.select_range(other);
        assert_eq!(dispatcher.pending().len(), 1);
    }

    #[test]
    fn test_detached_dispatcher_ignores_new_transitions() {
        let (store, dispatcher) = setup();
        dispatcher.detach();

        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutReport, DATA_LOADING_FAILED));

        assert!(dispatcher.pending().is_empty());
        assert!(store.get(KEY).timeout4_report.should_show);
    }

    fn ready_with_export() -> Value {
        json!({
            "velocity": {"velocityForSP": 5},
            "boardMetricsCompleted": true,
            "doraMetricsCompleted": true,
            "allMetricsCompleted": true,
            "isSuccessfulCreateCsvFile": true,
            "exportValidityTime": 30
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_notice_waits_for_polling_to_settle_then_reminds() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(ReportInfoStore::new());
        let dispatcher = NotificationDispatcher::attach(&store);
        let orchestrator = ReportOrchestrator::with_store(
            transport.clone(),
            PollingConfig {
                jitter: false,
                ..Default::default()
            },
            Arc::clone(&store),
        );
        let follower = dispatcher.follow_polling(&orchestrator);
        let fast: DateRange = "2024-01-01..2024-01-07".parse().unwrap();
        let slow: DateRange = "2024-01-08..2024-01-14".parse().unwrap();
        transport.script(
            "GET",
            &ScriptedTransport::callback_for(&fast, MetricsScope::All),
            vec![Reply::Respond(200, ready_with_export())],
        );
        transport.script(
            "GET",
            &ScriptedTransport::callback_for(&slow, MetricsScope::All),
            vec![Reply::after(
                Duration::from_secs(60),
                Reply::Respond(200, ready_with_export()),
            )],
        );
        let config = ReportConfig {
            metrics: vec!["Velocity".to_string(), "Deployment frequency".to_string()],
            board: Some(json!({})),
            pipeline: Some(json!({})),
            ..Default::default()
        };

        orchestrator
            .start_to_request_data(MetricsScope::All, &[fast.clone(), slow], &config)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(orchestrator.has_polling_started());
        assert!(store.get(&fast.key()).is_export_ready());
        assert!(dispatcher.pending().is_empty());

        orchestrator.wait_until_settled().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            messages(&dispatcher.pending()),
            vec!["The file will expire in 30 minutes, please download it in time."]
        );

        tokio::time::sleep(Duration::from_secs(24 * 60)).await;
        assert_eq!(dispatcher.pending().len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            messages(&dispatcher.pending())[1],
            "The file will expire in 5 minutes, please download it in time."
        );
        assert!(follower.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_timeout_reaches_the_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(ReportInfoStore::new());
        let dispatcher = NotificationDispatcher::attach(&store);
        let orchestrator = ReportOrchestrator::with_store(
            transport.clone(),
            PollingConfig {
                session_deadline_secs: 20,
                max_transient_failures: 2,
                jitter: false,
                ..Default::default()
            },
            Arc::clone(&store),
        );
        let range: DateRange = "2024-01-01..2024-01-07".parse().unwrap();
        transport.script(
            "GET",
            &ScriptedTransport::callback_for(&range, MetricsScope::All),
            vec![Reply::Respond(503, Value::Null)],
        );
        let config = ReportConfig {
            metrics: vec!["Velocity".to_string(), "Lead time for changes".to_string()],
            board: Some(json!({})),
            pipeline: Some(json!({})),
            ..Default::default()
        };

        orchestrator
            .start_to_request_data(MetricsScope::All, &[range], &config)
            .await
            .unwrap();
        orchestrator.wait_until_settled().await;

        assert_eq!(
            messages(&dispatcher.drain_ready()),
            vec!["Report loading timeout, please click \"Retry\"!"]
        );
        assert!(dispatcher.pending().is_empty());
    }
}
