// Report Engine Library - multi-range report polling and aggregation
// This exposes the core components for testing and integration

pub mod config;
pub mod errors;
pub mod http;
pub mod notifications;
pub mod observability;
pub mod report;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{ObservabilityConfig, PollingConfig, ReportEngineConfig, ServerConfig};
pub use errors::{ErrorKind, ReportError, DATA_LOADING_FAILED};
pub use http::{HttpResponse, RateLimitedHttpClient, ReportTransport, TransportError};
pub use notifications::{Notification, NotificationDispatcher, NotificationLevel, ReportView};
pub use observability::{OperationTimer, PollingMetrics, PollingStats};
pub use report::{
    DateRange, MetricsScope, OrchestratorError, ReportConfig, ReportInfo, ReportInfoStore,
    ReportOrchestrator, ShareReportLoader, SharedReport,
};
pub use telemetry::{create_polling_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
