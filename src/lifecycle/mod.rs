//! Transaction Lifecycle Manager
//!
//! Owns `start` and `finish`. Every completion path (synchronous return,
//! asynchronous callback, error) funnels through [`finish`], which takes
//! effect at most once per transaction: the first caller claims the finish,
//! records the outcome and ends the transaction; every later caller is a
//! no-op.

pub mod adapter;

pub use adapter::{LifecycleAdapter, RequestEntry, RouteTarget};

use crate::config::Config;
use crate::metrics;
use crate::request::InboundRequest;
use crate::tracer::{StartHint, Tracer};
use crate::transaction::{
    override_name, result_for_status, NamePriority, Outcome, ResponseStatus, Transaction,
};
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transaction type assigned to every inbound request
pub const REQUEST_TYPE: &str = "request";

/// Framework name used when none is configured
pub const DEFAULT_FRAMEWORK_NAME: &str = "hyper";

/// Starts transactions for inbound requests
pub struct LifecycleManager {
    tracer: Arc<dyn Tracer>,
    framework_name: String,
    capture_headers: bool,
}

impl LifecycleManager {
    /// Create a manager backed by `tracer`
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer,
            framework_name: DEFAULT_FRAMEWORK_NAME.to_string(),
            capture_headers: false,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &Config, tracer: Arc<dyn Tracer>) -> Self {
        Self::new(tracer)
            .with_framework_name(&config.agent.framework_name)
            .with_capture_headers(config.transactions.capture_headers)
    }

    /// Override the framework name tagged on every transaction
    pub fn with_framework_name(mut self, framework_name: &str) -> Self {
        self.framework_name = framework_name.to_string();
        self
    }

    /// Copy request headers into the transaction's request metadata
    pub fn with_capture_headers(mut self, capture_headers: bool) -> Self {
        self.capture_headers = capture_headers;
        self
    }

    pub fn framework_name(&self) -> &str {
        &self.framework_name
    }

    /// Start a transaction for `request`.
    ///
    /// Returns `None` when the tracer declines. The new transaction is named
    /// `METHOD /path` at low-level-framework priority and carries the
    /// request metadata. It is not bound to the request; see
    /// [`crate::correlation::attach`].
    pub fn start(&self, request: &dyn InboundRequest) -> Option<Arc<Transaction>> {
        let hint = StartHint {
            method: request.method(),
            path: request.path(),
        };

        let transaction = self
            .tracer
            .start_child_transaction(request.headers(), hint)?;

        transaction
            .set_framework_name(&self.framework_name)
            .with_type(REQUEST_TYPE);

        let named = override_name(
            Some(&transaction),
            NamePriority::LOW_LEVEL_FRAMEWORK,
            |name| {
                name.push_str(request.method());
                name.push(' ');
                name.push_str(request.path());
            },
        );

        if !named {
            warn!(
                trace_id = %transaction.trace_id(),
                "fresh transaction refused its base name, ending it"
            );
            transaction.end();
            return None;
        }

        let remote_address = request.remote_address().map(|addr| addr.to_string());

        transaction.with_request(|meta| {
            meta.remote_address = remote_address.clone();
            meta.http_version = Some(request.http_version().to_string());
            meta.method = Some(request.method().to_string());
            meta.url.protocol = Some(request.scheme().to_string());
            meta.url.hostname = request.host().map(str::to_string).or(remote_address);
            meta.url.port = request.server_port();
            meta.url.pathname = Some(request.path().to_string());
            meta.url.search = request.query().map(str::to_string);

            if self.capture_headers {
                let headers = request.headers();
                for name in headers.header_names() {
                    if let Some(value) = headers.first_header(name) {
                        meta.headers
                            .entry(name.to_ascii_lowercase())
                            .or_insert_with(|| value.to_string());
                    }
                }
            }
        });

        Some(transaction)
    }
}

/// Finish `transaction` with whatever completion data is available.
///
/// Absent or already-finished transactions are a no-op. Returns whether
/// this call finished the transaction.
pub fn finish(
    transaction: Option<&Transaction>,
    response: Option<&dyn ResponseStatus>,
    error: Option<&(dyn Error + 'static)>,
) -> bool {
    let Some(transaction) = transaction else {
        return false;
    };

    if !transaction.try_claim_finish() {
        debug!(
            trace_id = %transaction.trace_id(),
            "transaction already finished, ignoring"
        );
        metrics::record_anomaly("duplicate_finish");
        return false;
    }

    if let Some(error) = error {
        transaction.capture_exception(error);
    }

    match response {
        Some(response) => {
            let status = response.status_code();
            debug!(
                trace_id = %transaction.trace_id(),
                status_code = status,
                "finishing transaction"
            );

            if let Some(result) = result_for_status(status) {
                transaction.with_result_if_unset(result);
            }
            transaction
                .with_outcome_if_unset(Outcome::from_status(status))
                .with_response(|meta| {
                    meta.finished = true;
                    meta.status_code = Some(status);
                });
        }
        None if error.is_some() => {
            transaction.with_outcome_if_unset(Outcome::Failure);
        }
        None => {
            debug!(
                trace_id = %transaction.trace_id(),
                "finish called with neither response nor error"
            );
            metrics::record_anomaly("no_outcome");
        }
    }

    transaction.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::StaticRequest;
    use crate::tracer::{AgentTracer, ChannelReporter, NoopReporter};
    use std::net::{IpAddr, Ipv4Addr};

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Arc::new(AgentTracer::new("test", Arc::new(NoopReporter))))
    }

    #[test]
    fn test_start_names_and_tags() {
        let request = StaticRequest::new("GET", "/orders/42?x=1")
            .remote_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .server("shop.local", 8080);

        let transaction = manager().with_framework_name("axum").start(&request).unwrap();

        assert_eq!(transaction.name(), "GET /orders/42");
        assert_eq!(
            transaction.name_priority(),
            Some(NamePriority::LOW_LEVEL_FRAMEWORK)
        );
        assert_eq!(transaction.transaction_type().as_deref(), Some(REQUEST_TYPE));
        assert_eq!(transaction.framework_name().as_deref(), Some("axum"));

        let meta = transaction.request();
        assert_eq!(meta.method.as_deref(), Some("GET"));
        assert_eq!(meta.http_version.as_deref(), Some("1.1"));
        assert_eq!(meta.remote_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(meta.url.protocol.as_deref(), Some("http"));
        assert_eq!(meta.url.hostname.as_deref(), Some("shop.local"));
        assert_eq!(meta.url.port, Some(8080));
        assert_eq!(meta.url.pathname.as_deref(), Some("/orders/42"));
        assert_eq!(meta.url.search.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_headers_captured_only_when_enabled() {
        let request = StaticRequest::new("GET", "/").header("X-Tenant", "acme");

        let plain = manager().start(&request).unwrap();
        assert!(plain.request().headers.is_empty());

        let captured = manager().with_capture_headers(true).start(&request).unwrap();
        assert_eq!(
            captured.request().headers.get("x-tenant").map(String::as_str),
            Some("acme")
        );
    }

    #[test]
    fn test_finish_absent_is_noop() {
        assert!(!finish(None, Some(&200u16), None));
    }

    #[test]
    fn test_finish_with_response() {
        let request = StaticRequest::new("GET", "/");
        let transaction = manager().start(&request).unwrap();

        assert!(finish(Some(&transaction), Some(&404u16), None));

        assert_eq!(transaction.result().as_deref(), Some("HTTP 4xx"));
        assert_eq!(transaction.outcome(), Outcome::Success);
        let response = transaction.response();
        assert!(response.finished);
        assert_eq!(response.status_code, Some(404));
        assert!(transaction.is_ended());
    }

    #[test]
    fn test_finish_with_error_only() {
        let request = StaticRequest::new("POST", "/orders");
        let transaction = manager().start(&request).unwrap();
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");

        assert!(finish(Some(&transaction), None, Some(&error)));

        assert_eq!(transaction.outcome(), Outcome::Failure);
        assert_eq!(transaction.error().unwrap().message, "boom");
        assert!(!transaction.response().finished);
    }

    #[test]
    fn test_finish_with_nothing_still_ends() {
        let (reporter, mut rx) = ChannelReporter::new();
        let manager =
            LifecycleManager::new(Arc::new(AgentTracer::new("test", Arc::new(reporter))));
        let transaction = manager.start(&StaticRequest::new("GET", "/")).unwrap();

        assert!(finish(Some(&transaction), None, None));
        assert!(transaction.is_ended());
        assert_eq!(rx.try_recv().unwrap().outcome, Outcome::Unknown);
    }

    #[test]
    fn test_second_finish_is_noop() {
        let transaction = manager().start(&StaticRequest::new("GET", "/")).unwrap();
        let error = std::io::Error::new(std::io::ErrorKind::Other, "late");

        assert!(finish(Some(&transaction), Some(&200u16), None));
        assert!(!finish(Some(&transaction), Some(&500u16), Some(&error)));

        assert_eq!(transaction.response().status_code, Some(200));
        assert!(transaction.error().is_none());
    }
}
