//! In-memory report service for unit tests.

use crate::http::{HttpResponse, ReportTransport, TransportError};
use crate::report::types::{DateRange, MetricsScope};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const REPORT_ID: &str = "r-1";

#[derive(Debug, Clone)]
pub enum Reply {
    Respond(u16, Value),
    Fail(TransportError),
    /// Resolve `reply` after `delay`
    Delay(Duration, Box<Reply>),
    /// Never resolve
    Hang,
}

impl Reply {
    pub fn after(delay: Duration, reply: Reply) -> Self {
        Reply::Delay(delay, Box::new(reply))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
}

/// Replies per `METHOD url` route; the last scripted reply repeats.
///
/// Unscripted `POST /reports` hands out [`REPORT_ID`], and an unscripted
/// submission is accepted with a callback that encodes the submitted range
/// and metric types (see [`ScriptedTransport::callback_for`]).
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, method: &str, url: &str, replies: Vec<Reply>) {
        self.routes
            .lock()
            .unwrap()
            .insert(route(method, url), replies.into());
    }

    /// Callback URL handed out for an unscripted submission
    pub fn callback_for(range: &DateRange, scope: MetricsScope) -> String {
        let types = match scope {
            MetricsScope::All => "BOARD,DORA",
            MetricsScope::Board => "BOARD",
            MetricsScope::Dora => "DORA",
        };
        callback_url(range.start_millis(), range.end_millis(), types)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.url == url)
            .count()
    }

    fn next_reply(&self, method: &str, url: &str, body: Option<&Value>) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        if let Some(queue) = routes.get_mut(&route(method, url)) {
            if queue.len() > 1 {
                if let Some(reply) = queue.pop_front() {
                    return reply;
                }
            }
            if let Some(reply) = queue.front() {
                return reply.clone();
            }
        }
        drop(routes);
        default_reply(method, url, body)
    }

    async fn respond(&self, method: &str, url: &str, body: Option<Value>) -> Result<HttpResponse, TransportError> {
        let mut reply = self.next_reply(method, url, body.as_ref());
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.to_string(),
            url: url.to_string(),
            body,
        });
        loop {
            match reply {
                Reply::Respond(status, body) => return Ok(HttpResponse::new(status, body)),
                Reply::Fail(error) => return Err(error),
                Reply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                Reply::Hang => std::future::pending::<()>().await,
            }
        }
    }
}

fn route(method: &str, url: &str) -> String {
    format!("{method} {url}")
}

fn callback_url(start_millis: i64, end_millis: i64, metric_types: &str) -> String {
    let day = |millis: i64| {
        DateTime::from_timestamp_millis(millis)
            .map(|instant| instant.format("%Y%m%d").to_string())
            .unwrap_or_default()
    };
    format!(
        "/reports/{REPORT_ID}/detail?startTime={}&endTime={}&metricTypes={metric_types}",
        day(start_millis),
        day(end_millis)
    )
}

fn default_reply(method: &str, url: &str, body: Option<&Value>) -> Reply {
    if method == "POST" && url == "/reports" {
        return Reply::Respond(200, json!({ "reportId": REPORT_ID }));
    }
    if method == "POST" && url.starts_with("/reports/") {
        let millis = |field: &str| {
            body.and_then(|b| b.get(field))
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or_default()
        };
        let types = body
            .and_then(|b| b.get("metricTypes"))
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let callback = callback_url(millis("startTime"), millis("endTime"), &types);
        return Reply::Respond(202, json!({ "callbackUrl": callback, "interval": 1 }));
    }
    Reply::Respond(202, Value::Null)
}

#[async_trait]
impl ReportTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.respond("GET", url, None).await
    }

    async fn post(&self, url: &str, body: Option<Value>) -> Result<HttpResponse, TransportError> {
        self.respond("POST", url, body).await
    }
}
