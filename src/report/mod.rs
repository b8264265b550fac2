pub mod orchestrator;
pub mod polling;
pub mod request;
pub mod session;
pub mod share;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{OrchestratorError, ReportOrchestrator};
pub use polling::{PollingClient, SessionOutcome, SessionSummary, SessionTicket};
pub use request::{build as build_request, CalendarType, ReportConfig, ReportRequestBody};
pub use session::{PollingSession, SessionEvent, SessionPhase};
pub use share::{date_range_from_url, ShareReportLoader, SharedReport};
pub use store::{
    ChangeNotice, ErrorSlot, ErrorStatus, LoadingStatus, MetricsFamily, ReportInfo, ReportInfoStore,
    ReportPageLoadingStatus,
};
pub use types::{DateRange, MetricsScope, ReportMetricsError, ReportResponse};
