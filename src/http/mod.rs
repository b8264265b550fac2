pub mod client;
pub mod transport;


pub use client::RateLimitedHttpClient;
#[cfg(any(test, feature = "testing"))]
pub use transport::MockReportTransport;
pub use transport::{HttpResponse, ReportTransport, TransportError};
