//! Per-range report records shared between the orchestrator, the notification
//! dispatcher and whoever renders results.

use crate::errors::ErrorKind;
use crate::report::types::{MetricsFamilyError, MetricsScope, ReportResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatus {
    pub message: String,
    pub should_show: bool,
}

impl ErrorStatus {
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            should_show: true,
        }
    }

    /// Raised and not yet surfaced
    pub fn is_pending(&self) -> bool {
        self.should_show && !self.message.is_empty()
    }
}

/// The six timeout / general-error slots of a [`ReportInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSlot {
    TimeoutBoard,
    TimeoutDora,
    TimeoutReport,
    GeneralErrorBoard,
    GeneralErrorDora,
    GeneralErrorReport,
}

impl ErrorSlot {
    pub const ALL: [ErrorSlot; 6] = [
        ErrorSlot::TimeoutBoard,
        ErrorSlot::TimeoutDora,
        ErrorSlot::TimeoutReport,
        ErrorSlot::GeneralErrorBoard,
        ErrorSlot::GeneralErrorDora,
        ErrorSlot::GeneralErrorReport,
    ];

    /// Slot a surfaced session error of `kind` lands in.
    ///
    /// Timeouts and network failures go to the timeout slots, which carry the
    /// retry affordance; everything else is a general error.
    pub fn for_outcome(scope: MetricsScope, kind: ErrorKind) -> Self {
        let timeout = matches!(kind, ErrorKind::Timeout | ErrorKind::Network);
        match (scope, timeout) {
            (MetricsScope::Board, true) => ErrorSlot::TimeoutBoard,
            (MetricsScope::Dora, true) => ErrorSlot::TimeoutDora,
            (MetricsScope::All, true) => ErrorSlot::TimeoutReport,
            (MetricsScope::Board, false) => ErrorSlot::GeneralErrorBoard,
            (MetricsScope::Dora, false) => ErrorSlot::GeneralErrorDora,
            (MetricsScope::All, false) => ErrorSlot::GeneralErrorReport,
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ErrorSlot::TimeoutBoard | ErrorSlot::TimeoutDora | ErrorSlot::TimeoutReport
        )
    }

    /// Display name of the family the slot belongs to
    pub fn family_label(self) -> &'static str {
        match self {
            ErrorSlot::TimeoutBoard | ErrorSlot::GeneralErrorBoard => "Board metrics",
            ErrorSlot::TimeoutDora | ErrorSlot::GeneralErrorDora => "DORA metrics",
            ErrorSlot::TimeoutReport | ErrorSlot::GeneralErrorReport => "Report",
        }
    }

    /// Slots whose stale contents a new request for `scope` clears
    pub fn cleared_by(scope: MetricsScope) -> &'static [ErrorSlot] {
        match scope {
            MetricsScope::All => &ErrorSlot::ALL,
            MetricsScope::Board => &[
                ErrorSlot::TimeoutBoard,
                ErrorSlot::GeneralErrorBoard,
                ErrorSlot::TimeoutReport,
                ErrorSlot::GeneralErrorReport,
            ],
            MetricsScope::Dora => &[
                ErrorSlot::TimeoutDora,
                ErrorSlot::GeneralErrorDora,
                ErrorSlot::TimeoutReport,
                ErrorSlot::GeneralErrorReport,
            ],
        }
    }
}

impl fmt::Display for ErrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSlot::TimeoutBoard => "timeout4Board",
            ErrorSlot::TimeoutDora => "timeout4Dora",
            ErrorSlot::TimeoutReport => "timeout4Report",
            ErrorSlot::GeneralErrorBoard => "generalError4Board",
            ErrorSlot::GeneralErrorDora => "generalError4Dora",
            ErrorSlot::GeneralErrorReport => "generalError4Report",
        };
        f.write_str(name)
    }
}

/// Source systems whose failures are reported inside a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricsFamily {
    Board,
    Pipeline,
    SourceControl,
}

impl MetricsFamily {
    pub const ALL: [MetricsFamily; 3] = [
        MetricsFamily::Board,
        MetricsFamily::Pipeline,
        MetricsFamily::SourceControl,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MetricsFamily::Board => "Board Metrics",
            MetricsFamily::Pipeline => "Buildkite",
            MetricsFamily::SourceControl => "GitHub",
        }
    }

    pub fn is_covered_by(self, scope: MetricsScope) -> bool {
        match self {
            MetricsFamily::Board => scope.covers_board(),
            MetricsFamily::Pipeline | MetricsFamily::SourceControl => scope.covers_dora(),
        }
    }
}

/// Families a range has been asked for during the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedFamilies {
    pub board: bool,
    pub dora: bool,
}

impl RequestedFamilies {
    pub fn include(&mut self, scope: MetricsScope) {
        self.board |= scope.covers_board();
        self.dora |= scope.covers_dora();
    }
}

/// Result record of one date range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInfo {
    pub id: String,
    pub report_data: Option<ReportResponse>,
    pub timeout4_board: ErrorStatus,
    pub timeout4_dora: ErrorStatus,
    pub timeout4_report: ErrorStatus,
    pub general_error4_board: ErrorStatus,
    pub general_error4_dora: ErrorStatus,
    pub general_error4_report: ErrorStatus,
    pub should_show_board_metrics_error: bool,
    pub should_show_pipeline_metrics_error: bool,
    pub should_show_source_control_metrics_error: bool,
}

impl ReportInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn slot(&self, slot: ErrorSlot) -> &ErrorStatus {
        match slot {
            ErrorSlot::TimeoutBoard => &self.timeout4_board,
            ErrorSlot::TimeoutDora => &self.timeout4_dora,
            ErrorSlot::TimeoutReport => &self.timeout4_report,
            ErrorSlot::GeneralErrorBoard => &self.general_error4_board,
            ErrorSlot::GeneralErrorDora => &self.general_error4_dora,
            ErrorSlot::GeneralErrorReport => &self.general_error4_report,
        }
    }

    fn slot_mut(&mut self, slot: ErrorSlot) -> &mut ErrorStatus {
        match slot {
            ErrorSlot::TimeoutBoard => &mut self.timeout4_board,
            ErrorSlot::TimeoutDora => &mut self.timeout4_dora,
            ErrorSlot::TimeoutReport => &mut self.timeout4_report,
            ErrorSlot::GeneralErrorBoard => &mut self.general_error4_board,
            ErrorSlot::GeneralErrorDora => &mut self.general_error4_dora,
            ErrorSlot::GeneralErrorReport => &mut self.general_error4_report,
        }
    }

    /// Raise `slot`; the sibling slot of the same family is cleared so at
    /// most one of timeout / general error is active per family
    pub fn set_error(&mut self, slot: ErrorSlot, message: impl Into<String>) {
        let sibling = match slot {
            ErrorSlot::TimeoutBoard => ErrorSlot::GeneralErrorBoard,
            ErrorSlot::TimeoutDora => ErrorSlot::GeneralErrorDora,
            ErrorSlot::TimeoutReport => ErrorSlot::GeneralErrorReport,
            ErrorSlot::GeneralErrorBoard => ErrorSlot::TimeoutBoard,
            ErrorSlot::GeneralErrorDora => ErrorSlot::TimeoutDora,
            ErrorSlot::GeneralErrorReport => ErrorSlot::TimeoutReport,
        };
        *self.slot_mut(sibling) = ErrorStatus::default();
        *self.slot_mut(slot) = ErrorStatus::raised(message);
    }

    /// Mark a slot as surfaced; its message stays for the summary view
    pub fn close_error(&mut self, slot: ErrorSlot) {
        self.slot_mut(slot).should_show = false;
    }

    pub fn clear_error(&mut self, slot: ErrorSlot) {
        *self.slot_mut(slot) = ErrorStatus::default();
    }

    pub fn gate(&self, family: MetricsFamily) -> bool {
        match family {
            MetricsFamily::Board => self.should_show_board_metrics_error,
            MetricsFamily::Pipeline => self.should_show_pipeline_metrics_error,
            MetricsFamily::SourceControl => self.should_show_source_control_metrics_error,
        }
    }

    pub fn set_gate(&mut self, family: MetricsFamily, value: bool) {
        match family {
            MetricsFamily::Board => self.should_show_board_metrics_error = value,
            MetricsFamily::Pipeline => self.should_show_pipeline_metrics_error = value,
            MetricsFamily::SourceControl => self.should_show_source_control_metrics_error = value,
        }
    }

    pub fn family_error(&self, family: MetricsFamily) -> Option<&MetricsFamilyError> {
        let errors = &self.report_data.as_ref()?.report_metrics_error;
        match family {
            MetricsFamily::Board => errors.board_metrics_error.as_ref(),
            MetricsFamily::Pipeline => errors.pipeline_metrics_error.as_ref(),
            MetricsFamily::SourceControl => errors.source_control_metrics_error.as_ref(),
        }
    }

    /// Merge a payload produced by a `scope` session into `report_data`.
    ///
    /// Only the families `scope` covers are taken from `incoming`; absent
    /// fields never erase stored ones and completion flags only ever turn on.
    /// The payload's aggregate flags only describe the families its request
    /// covered, so they are taken as-is from a settled `All` session and
    /// derived through [`refresh_completion`](Self::refresh_completion)
    /// otherwise. Returns the families whose metric error newly appeared,
    /// with their gates already raised.
    pub fn merge_report(
        &mut self,
        scope: MetricsScope,
        incoming: ReportResponse,
        requested: RequestedFamilies,
        pending: bool,
    ) -> Vec<MetricsFamily> {
        let before: Vec<Option<MetricsFamilyError>> = MetricsFamily::ALL
            .iter()
            .map(|family| self.family_error(*family).cloned())
            .collect();

        let mut merged = self.report_data.take().unwrap_or_default();
        let ReportResponse {
            velocity,
            cycle_time,
            rework,
            classification_list,
            deployment_frequency,
            lead_time_for_changes,
            dev_change_failure_rate,
            dev_mean_time_to_recovery,
            report_metrics_error,
            export_validity_time,
            board_metrics_completed,
            dora_metrics_completed,
            overall_metrics_completed,
            all_metrics_completed,
            is_successful_create_csv_file,
        } = incoming;

        if scope.covers_board() {
            replace_present(&mut merged.velocity, velocity);
            replace_present(&mut merged.cycle_time, cycle_time);
            replace_present(&mut merged.rework, rework);
            replace_present(&mut merged.classification_list, classification_list);
            merged.report_metrics_error.board_metrics_error = report_metrics_error.board_metrics_error;
        }
        if scope.covers_dora() {
            replace_present(&mut merged.deployment_frequency, deployment_frequency);
            replace_present(&mut merged.lead_time_for_changes, lead_time_for_changes);
            replace_present(&mut merged.dev_change_failure_rate, dev_change_failure_rate);
            replace_present(&mut merged.dev_mean_time_to_recovery, dev_mean_time_to_recovery);
            merged.report_metrics_error.pipeline_metrics_error =
                report_metrics_error.pipeline_metrics_error;
            merged.report_metrics_error.source_control_metrics_error =
                report_metrics_error.source_control_metrics_error;
        }

        replace_present(&mut merged.export_validity_time, export_validity_time);
        merged.board_metrics_completed |= board_metrics_completed;
        merged.dora_metrics_completed |= dora_metrics_completed;
        if scope == MetricsScope::All && !pending {
            merged.all_metrics_completed |= all_metrics_completed;
            merged.overall_metrics_completed |= overall_metrics_completed;
        }
        merged.is_successful_create_csv_file |= is_successful_create_csv_file;
        self.report_data = Some(merged);
        self.refresh_completion(requested, pending);

        let mut raised = Vec::new();
        for (family, previous) in MetricsFamily::ALL.iter().zip(before) {
            let current = self.family_error(*family).cloned();
            if current.is_some() && current != previous {
                self.set_gate(*family, true);
                raised.push(*family);
            }
        }
        raised
    }

    /// Recompute the aggregate flags once every requested family resolved
    pub fn refresh_completion(&mut self, requested: RequestedFamilies, pending: bool) {
        let Some(data) = self.report_data.as_mut() else {
            return;
        };
        let families_done = (!requested.board || data.board_metrics_completed)
            && (!requested.dora || data.dora_metrics_completed);
        if !pending && families_done && (requested.board || requested.dora) {
            data.all_metrics_completed = true;
        }
        if data.all_metrics_completed && data.is_successful_create_csv_file {
            data.overall_metrics_completed = true;
        }
    }

    /// Text shown on the board summary card, if any
    pub fn error_message_for_board(&self) -> Option<String> {
        if let Some(error) = self.family_error(MetricsFamily::Board) {
            return Some(format!("Failed to get Jira info, status: {}", error.status));
        }
        first_message(&[
            &self.timeout4_board,
            &self.timeout4_report,
            &self.general_error4_board,
            &self.general_error4_report,
        ])
    }

    /// Text shown on the DORA summary card, if any
    pub fn error_message_for_dora(&self) -> Option<String> {
        first_message(&[
            &self.timeout4_dora,
            &self.timeout4_report,
            &self.general_error4_dora,
            &self.general_error4_report,
        ])
    }

    pub fn is_all_metrics_completed(&self) -> bool {
        self.report_data
            .as_ref()
            .is_some_and(|data| data.all_metrics_completed)
    }

    /// Whether the export trigger may offer a download for this range
    pub fn is_export_ready(&self) -> bool {
        self.report_data.as_ref().is_some_and(|data| {
            data.all_metrics_completed && data.is_successful_create_csv_file
        })
    }
}

fn replace_present<T>(stored: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *stored = incoming;
    }
}

fn first_message(slots: &[&ErrorStatus]) -> Option<String> {
    slots
        .iter()
        .find(|slot| !slot.message.is_empty())
        .map(|slot| slot.message.clone())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingStatus {
    pub is_loading: bool,
    pub is_loaded: bool,
    pub is_loaded_with_error: bool,
}

impl LoadingStatus {
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Default::default()
        }
    }

    pub fn loaded() -> Self {
        Self {
            is_loaded: true,
            ..Default::default()
        }
    }

    pub fn loaded_with_error() -> Self {
        Self {
            is_loaded: true,
            is_loaded_with_error: true,
            ..Default::default()
        }
    }
}

/// Step-by-step progress of one range, as shown by a loading indicator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPageLoadingStatus {
    pub gain_polling_url: LoadingStatus,
    pub polling: LoadingStatus,
    pub board_metrics: LoadingStatus,
    pub pipeline_metrics: LoadingStatus,
    pub source_control_metrics: LoadingStatus,
}

impl ReportPageLoadingStatus {
    pub fn family_mut(&mut self, family: MetricsFamily) -> &mut LoadingStatus {
        match family {
            MetricsFamily::Board => &mut self.board_metrics,
            MetricsFamily::Pipeline => &mut self.pipeline_metrics,
            MetricsFamily::SourceControl => &mut self.source_control_metrics,
        }
    }
}

pub type SubscriptionId = u64;

type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type Listener = Arc<dyn Fn(&ReportInfo) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    predicate: KeyPredicate,
    listener: Listener,
}

#[derive(Default)]
struct Records {
    infos: Vec<ReportInfo>,
    loading: HashMap<String, ReportPageLoadingStatus>,
}

impl Records {
    fn position(&self, key: &str) -> Option<usize> {
        self.infos.iter().position(|info| info.id == key)
    }

    fn entry(&mut self, key: &str) -> &mut ReportInfo {
        let index = match self.position(key) {
            Some(index) => index,
            None => {
                self.infos.push(ReportInfo::new(key));
                self.infos.len() - 1
            }
        };
        &mut self.infos[index]
    }
}

/// Snapshot of a patched record whose subscribers have not been told yet
#[derive(Debug)]
#[must_use = "pass the notice to ReportInfoStore::publish"]
pub struct ChangeNotice(ReportInfo);

/// Keyed [`ReportInfo`] records with change subscriptions.
///
/// Listeners run after the store lock is released and receive a snapshot, so
/// they are free to call back into the store.
#[derive(Default)]
pub struct ReportInfoStore {
    records: Mutex<Records>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for ReportInfoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportInfoStore")
            .field("records", &self.records().infos.len())
            .field("subscribers", &self.subscribers().len())
            .finish()
    }
}

impl ReportInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record for `key`, or the initial record if none exists yet
    pub fn get(&self, key: &str) -> ReportInfo {
        self.find(key).unwrap_or_else(|| ReportInfo::new(key))
    }

    pub fn find(&self, key: &str) -> Option<ReportInfo> {
        let records = self.records();
        records.position(key).map(|index| records.infos[index].clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records().position(key).is_some()
    }

    /// Create the initial record for `key` if it does not exist
    pub fn ensure(&self, key: &str) {
        let mut records = self.records();
        records.entry(key);
        records.loading.entry(key.to_string()).or_default();
    }

    /// Apply `patch` to the record for `key`, creating it when missing,
    /// then notify matching subscribers with the resulting snapshot
    pub fn update<R>(&self, key: &str, patch: impl FnOnce(&mut ReportInfo) -> R) -> R {
        let (result, notice) = self.update_deferred(key, patch);
        self.publish([notice]);
        result
    }

    /// Like [`update`](Self::update), but subscribers are only told once the
    /// returned notice is passed to [`publish`](Self::publish). Lets a caller
    /// patch records while holding its own lock and notify after releasing it.
    pub fn update_deferred<R>(
        &self,
        key: &str,
        patch: impl FnOnce(&mut ReportInfo) -> R,
    ) -> (R, ChangeNotice) {
        let mut records = self.records();
        let info = records.entry(key);
        let result = patch(info);
        (result, ChangeNotice(info.clone()))
    }

    pub fn publish(&self, notices: impl IntoIterator<Item = ChangeNotice>) {
        for ChangeNotice(snapshot) in notices {
            self.notify(&snapshot);
        }
    }

    /// All records, in insertion order
    pub fn all(&self) -> Vec<ReportInfo> {
        self.records().infos.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records().infos.iter().map(|info| info.id.clone()).collect()
    }

    pub fn loading_status(&self, key: &str) -> ReportPageLoadingStatus {
        self.records().loading.get(key).copied().unwrap_or_default()
    }

    pub fn update_loading_status(&self, key: &str, patch: impl FnOnce(&mut ReportPageLoadingStatus)) {
        let mut records = self.records();
        patch(records.loading.entry(key.to_string()).or_default());
    }

    pub fn subscribe<P, L>(&self, predicate: P, listener: L) -> SubscriptionId
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        L: Fn(&ReportInfo) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers().push(Subscriber {
            id,
            predicate: Arc::new(predicate),
            listener: Arc::new(listener),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    /// Drop every record; subscriptions stay
    pub fn reset(&self) {
        let mut records = self.records();
        records.infos.clear();
        records.loading.clear();
    }

    fn notify(&self, snapshot: &ReportInfo) {
        let listeners: Vec<Listener> = self
            .subscribers()
            .iter()
            .filter(|subscriber| (subscriber.predicate)(&snapshot.id))
            .map(|subscriber| Arc::clone(&subscriber.listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::types::ReportMetricsError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const KEY: &str = "2024-01-01T00:00:00+00:00";

    fn both() -> RequestedFamilies {
        RequestedFamilies {
            board: true,
            dora: true,
        }
    }

    fn dora_payload() -> ReportResponse {
        ReportResponse {
            deployment_frequency: Some(json!({"avgDeploymentFrequency": {"deploymentFrequency": 0.4}})),
            lead_time_for_changes: Some(json!({"avgLeadTimeForChanges": {"totalDelayTime": 12.5}})),
            dora_metrics_completed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_record_is_empty() {
        let store = ReportInfoStore::new();
        let info = store.get(KEY);

        assert_eq!(info.id, KEY);
        assert!(info.report_data.is_none());
        assert!(ErrorSlot::ALL.iter().all(|slot| *info.slot(*slot) == ErrorStatus::default()));
        assert!(MetricsFamily::ALL.iter().all(|family| !info.gate(*family)));
        assert!(!store.contains(KEY));
    }

    #[test]
    fn test_board_merge_keeps_dora_portion() {
        let mut info = ReportInfo::new(KEY);
        info.merge_report(MetricsScope::Dora, dora_payload(), both(), true);

        let board = ReportResponse {
            velocity: Some(json!({"velocityForSP": 20})),
            // A board-scoped response never carries authoritative DORA data
            deployment_frequency: Some(json!(null)),
            board_metrics_completed: true,
            ..Default::default()
        };
        info.merge_report(MetricsScope::Board, board, both(), false);

        let data = info.report_data.as_ref().unwrap();
        assert_eq!(data.deployment_frequency, dora_payload().deployment_frequency);
        assert_eq!(data.lead_time_for_changes, dora_payload().lead_time_for_changes);
        assert!(data.velocity.is_some());
        assert!(data.dora_metrics_completed);
        assert!(data.board_metrics_completed);
        assert!(data.all_metrics_completed);
    }

    #[test]
    fn test_completion_flags_are_never_cleared() {
        let mut info = ReportInfo::new(KEY);
        info.merge_report(MetricsScope::Dora, dora_payload(), both(), true);
        info.merge_report(MetricsScope::Board, ReportResponse::default(), both(), true);

        let data = info.report_data.as_ref().unwrap();
        assert!(data.dora_metrics_completed);
        assert!(!data.all_metrics_completed);
    }

    #[test]
    fn test_scoped_payload_cannot_claim_aggregate_completion() {
        let mut info = ReportInfo::new(KEY);
        let board = ReportResponse {
            velocity: Some(json!({"velocityForSP": 20})),
            board_metrics_completed: true,
            all_metrics_completed: true,
            overall_metrics_completed: true,
            is_successful_create_csv_file: true,
            ..Default::default()
        };

        info.merge_report(MetricsScope::Board, board, both(), true);
        assert!(!info.is_all_metrics_completed());
        assert!(!info.is_export_ready());

        let all = ReportResponse {
            all_metrics_completed: true,
            ..Default::default()
        };
        info.merge_report(MetricsScope::All, all.clone(), both(), true);
        assert!(!info.is_all_metrics_completed());

        info.merge_report(MetricsScope::All, all, both(), false);
        assert!(info.is_all_metrics_completed());
        assert!(info.is_export_ready());
    }

    #[test]
    fn test_new_family_error_raises_gate_once() {
        let mut info = ReportInfo::new(KEY);
        let failing = ReportResponse {
            report_metrics_error: ReportMetricsError {
                pipeline_metrics_error: Some(MetricsFamilyError {
                    status: 401,
                    message: Some("Unauthorized".to_string()),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let raised = info.merge_report(MetricsScope::All, failing.clone(), both(), true);
        assert_eq!(raised, vec![MetricsFamily::Pipeline]);
        assert!(info.gate(MetricsFamily::Pipeline));

        info.set_gate(MetricsFamily::Pipeline, false);
        let raised = info.merge_report(MetricsScope::All, failing, both(), true);
        assert!(raised.is_empty());
        assert!(!info.gate(MetricsFamily::Pipeline));
    }

    #[test]
    fn test_board_scope_does_not_touch_dora_errors() {
        let mut info = ReportInfo::new(KEY);
        let mut dora = dora_payload();
        dora.report_metrics_error.source_control_metrics_error = Some(MetricsFamilyError {
            status: 500,
            message: None,
        });
        info.merge_report(MetricsScope::Dora, dora, both(), true);

        info.merge_report(MetricsScope::Board, ReportResponse::default(), both(), true);

        assert_eq!(
            info.family_error(MetricsFamily::SourceControl).map(|e| e.status),
            Some(500)
        );
    }

    #[test]
    fn test_slots_are_exclusive_per_family_and_close_keeps_message() {
        let mut info = ReportInfo::new(KEY);
        info.set_error(ErrorSlot::TimeoutBoard, "Data loading failed");
        info.set_error(ErrorSlot::GeneralErrorBoard, "Data loading failed");

        assert_eq!(info.timeout4_board, ErrorStatus::default());
        assert!(info.general_error4_board.is_pending());

        info.close_error(ErrorSlot::GeneralErrorBoard);
        assert!(!info.general_error4_board.is_pending());
        assert_eq!(
            info.error_message_for_board().as_deref(),
            Some("Data loading failed")
        );
        assert_eq!(info.error_message_for_dora(), None);
    }

    #[test]
    fn test_board_family_error_message_wins() {
        let mut info = ReportInfo::new(KEY);
        info.set_error(ErrorSlot::TimeoutReport, "Data loading failed");
        info.report_data = Some(ReportResponse {
            report_metrics_error: ReportMetricsError {
                board_metrics_error: Some(MetricsFamilyError {
                    status: 401,
                    message: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(
            info.error_message_for_board().as_deref(),
            Some("Failed to get Jira info, status: 401")
        );
        assert_eq!(
            info.error_message_for_dora().as_deref(),
            Some("Data loading failed")
        );
    }

    #[test]
    fn test_export_ready_needs_csv_and_completion() {
        let mut info = ReportInfo::new(KEY);
        let payload = ReportResponse {
            all_metrics_completed: true,
            is_successful_create_csv_file: true,
            ..Default::default()
        };
        info.merge_report(MetricsScope::All, payload, both(), false);

        assert!(info.is_export_ready());
        assert!(info.report_data.as_ref().unwrap().overall_metrics_completed);
    }

    #[test]
    fn test_outcome_slots() {
        assert_eq!(
            ErrorSlot::for_outcome(MetricsScope::Board, ErrorKind::NotFound),
            ErrorSlot::GeneralErrorBoard
        );
        assert_eq!(
            ErrorSlot::for_outcome(MetricsScope::All, ErrorKind::Network),
            ErrorSlot::TimeoutReport
        );
        assert_eq!(
            ErrorSlot::for_outcome(MetricsScope::Dora, ErrorKind::Timeout),
            ErrorSlot::TimeoutDora
        );
        assert!(!ErrorSlot::cleared_by(MetricsScope::Board).contains(&ErrorSlot::TimeoutDora));
    }

    #[test]
    fn test_subscribers_filter_by_key_and_may_reenter() {
        let store = Arc::new(ReportInfoStore::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let reentrant = Arc::clone(&store);
        let counter = Arc::clone(&seen);
        let id = store.subscribe(
            |key| key == KEY,
            move |info| {
                counter.fetch_add(1, Ordering::SeqCst);
                if info.timeout4_report.is_pending() {
                    reentrant.update(&info.id, |info| info.close_error(ErrorSlot::TimeoutReport));
                }
            },
        );

        store.update("2024-02-01T00:00:00+00:00", |info| {
            info.set_error(ErrorSlot::TimeoutReport, "Data loading failed")
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        store.update(KEY, |info| info.set_error(ErrorSlot::TimeoutReport, "Data loading failed"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!store.get(KEY).timeout4_report.should_show);

        assert!(store.unsubscribe(id));
        store.update(KEY, |_| ());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deferred_updates_notify_only_when_published() {
        let store = ReportInfoStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        store.subscribe(|_| true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ((), notice) = store.update_deferred(KEY, |info| {
            info.set_error(ErrorSlot::TimeoutDora, "Data loading failed")
        });
        assert!(store.get(KEY).timeout4_dora.is_pending());
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        store.publish([notice]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_records_keep_insertion_order_and_reset() {
        let store = ReportInfoStore::new();
        store.ensure("b");
        store.ensure("a");
        store.update("b", |_| ());

        assert_eq!(store.keys(), vec!["b".to_string(), "a".to_string()]);

        store.update_loading_status("a", |status| status.polling = LoadingStatus::loading());
        assert!(store.loading_status("a").polling.is_loading);

        store.reset();
        assert!(store.all().is_empty());
        assert_eq!(store.loading_status("a"), ReportPageLoadingStatus::default());
    }
}
