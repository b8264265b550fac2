//! Read path for a shared report link.

use crate::errors::{ReportError, DATA_LOADING_FAILED};
use crate::http::{HttpResponse, ReportTransport, TransportError};
use crate::report::store::{ErrorSlot, LoadingStatus, MetricsFamily, ReportInfo, ReportInfoStore};
use crate::report::types::{DateRange, MetricsScope, ReportResponse, ReportUrlsResponse};
use chrono::NaiveDate;
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

static START_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]startTime=(\d{8})").expect("valid regex"));
static END_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]endTime=(\d{8})").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedReport {
    pub is_expired: bool,
    pub metrics: Vec<String>,
    pub date_ranges: Vec<DateRange>,
    pub report_infos: Vec<ReportInfo>,
}

impl SharedReport {
    fn expired() -> Self {
        Self {
            is_expired: true,
            ..Default::default()
        }
    }
}

/// Whole-day range encoded in a report detail URL
pub fn date_range_from_url(url: &str) -> Result<DateRange, ReportError> {
    let day = |pattern: &Regex, name: &str| {
        pattern
            .captures(url)
            .and_then(|captures| captures.get(1))
            .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%Y%m%d").ok())
            .ok_or_else(|| ReportError::Unknown {
                status: None,
                message: format!("report URL {url} has no valid {name}"),
            })
    };
    Ok(DateRange::whole_days(
        day(&START_TIME, "startTime")?,
        day(&END_TIME, "endTime")?,
    ))
}

pub struct ShareReportLoader {
    transport: Arc<dyn ReportTransport>,
    store: Arc<ReportInfoStore>,
}

impl ShareReportLoader {
    pub fn new(transport: Arc<dyn ReportTransport>) -> Self {
        Self::with_store(transport, Arc::new(ReportInfoStore::new()))
    }

    /// Load into `store` so a dispatcher attached to it sees the results
    pub fn with_store(transport: Arc<dyn ReportTransport>, store: Arc<ReportInfoStore>) -> Self {
        Self { transport, store }
    }

    pub fn store(&self) -> &Arc<ReportInfoStore> {
        &self.store
    }

    /// Resolve a shared report id into per-range records.
    ///
    /// An unknown or expired id yields `is_expired` rather than an error. A
    /// failed detail fetch only affects its own range.
    pub async fn load(&self, report_id: &str) -> Result<SharedReport, ReportError> {
        let lookup = self.transport.get(&format!("/reports/{report_id}")).await?;
        if lookup.status == 404 {
            info!(report_id = %report_id, "Shared report has expired");
            return Ok(SharedReport::expired());
        }
        if !lookup.is_success() {
            return Err(ReportError::from_response(&lookup));
        }
        let urls: ReportUrlsResponse = lookup
            .json()
            .map_err(|e| ReportError::malformed(lookup.status, &e))?;

        let date_ranges = urls
            .report_urls
            .iter()
            .map(|url| date_range_from_url(url))
            .collect::<Result<Vec<_>, _>>()?;

        for range in &date_ranges {
            self.store.ensure(&range.key());
            self.store.update_loading_status(&range.key(), |status| {
                status.polling = LoadingStatus::loading();
                for family in MetricsFamily::ALL {
                    *status.family_mut(family) = LoadingStatus::loading();
                }
            });
        }

        let details = join_all(urls.report_urls.iter().map(|url| self.transport.get(url))).await;

        for (range, detail) in date_ranges.iter().zip(details) {
            let key = range.key();
            let result = Self::report_detail(detail);
            let loaded = if result.is_ok() {
                LoadingStatus::loaded()
            } else {
                LoadingStatus::loaded_with_error()
            };
            match result {
                Ok(report) => self.store.update(&key, |info| {
                    info.report_data = Some(report);
                    for family in MetricsFamily::ALL {
                        info.set_gate(family, true);
                    }
                }),
                Err(error) => {
                    warn!(range = %key, error = %error, "Failed to load shared report detail");
                    let slot = ErrorSlot::for_outcome(MetricsScope::All, error.kind());
                    self.store.update(&key, |info| info.set_error(slot, DATA_LOADING_FAILED));
                }
            }
            self.store.update_loading_status(&key, |status| {
                status.polling = loaded;
                for family in MetricsFamily::ALL {
                    *status.family_mut(family) = loaded;
                }
            });
        }

        let report_infos = date_ranges
            .iter()
            .map(|range| self.store.get(&range.key()))
            .collect();

        Ok(SharedReport {
            is_expired: false,
            metrics: urls.metrics,
            date_ranges,
            report_infos,
        })
    }

    fn report_detail(
        detail: Result<HttpResponse, TransportError>,
    ) -> Result<ReportResponse, ReportError> {
        let response = detail?;
        if !response.is_success() {
            return Err(ReportError::from_response(&response));
        }
        response
            .json()
            .map_err(|e| ReportError::malformed(response.status, &e))
    }
}
