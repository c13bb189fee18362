//! Transaction record
//!
//! One [`Transaction`] per inbound request. It is created by the tracing
//! runtime, shared as `Arc<Transaction>` between the request pipeline, the
//! correlation store and the propagation context, and handed to the
//! [`Reporter`] exactly once when it ends.
//!
//! # State machine
//!
//! ```text
//! Unstarted --activate--> Active --end--> Ended
//! ```
//!
//! Transitions are compare-and-set on an atomic; every transition after the
//! first `end` is a no-op. No lock is held while the reporter runs.

pub mod metadata;
pub mod name;

pub use metadata::{
    result_for_status, CapturedError, Outcome, RequestMeta, ResponseMeta, ResponseStatus, UrlMeta,
};
pub use name::{override_name, NameBuffer, NamePriority};

use crate::metrics;
use crate::tracer::Reporter;
use chrono::{DateTime, Utc};
use name::NameSlot;
use opentelemetry::trace::{SpanId, TraceId};
use parking_lot::Mutex;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Unstarted = 0,
    Active = 1,
    Ended = 2,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Unstarted,
            1 => TransactionState::Active,
            _ => TransactionState::Ended,
        }
    }
}

/// Identity assigned to a transaction at creation
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionIds {
    pub trace_id: TraceId,
    pub id: SpanId,
    /// Remote parent, when the trace was continued from headers
    pub parent_id: Option<SpanId>,
    pub sampled: bool,
    pub tracestate: Option<String>,
}

#[derive(Debug, Default)]
struct Details {
    transaction_type: Option<String>,
    framework_name: Option<String>,
    result: Option<String>,
    outcome: Outcome,
    request: RequestMeta,
    response: ResponseMeta,
    error: Option<CapturedError>,
}

/// Root tracing record for one inbound request
pub struct Transaction {
    ids: TransactionIds,
    timestamp: DateTime<Utc>,
    started: Instant,
    state: AtomicU8,
    finish_claimed: AtomicBool,
    pub(crate) name: Mutex<NameSlot>,
    details: Mutex<Details>,
    reporter: Arc<dyn Reporter>,
}

/// Immutable snapshot handed to the reporter when a transaction ends
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub trace_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub name_priority: Option<NamePriority>,
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
    pub framework: Option<String>,
    pub result: Option<String>,
    pub outcome: Outcome,
    pub sampled: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
    pub request: RequestMeta,
    pub response: ResponseMeta,
    pub error: Option<CapturedError>,
}

impl Transaction {
    /// Create an unstarted transaction
    pub fn new(ids: TransactionIds, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            ids,
            timestamp: Utc::now(),
            started: Instant::now(),
            state: AtomicU8::new(TransactionState::Unstarted as u8),
            finish_claimed: AtomicBool::new(false),
            name: Mutex::new(NameSlot::default()),
            details: Mutex::new(Details::default()),
            reporter,
        }
    }

    /// `Unstarted -> Active`. Returns whether this call made the transition.
    pub fn activate(&self) -> bool {
        self.transition(TransactionState::Unstarted, TransactionState::Active)
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.state() == TransactionState::Ended
    }

    pub fn trace_id(&self) -> TraceId {
        self.ids.trace_id
    }

    pub fn id(&self) -> SpanId {
        self.ids.id
    }

    pub fn parent_id(&self) -> Option<SpanId> {
        self.ids.parent_id
    }

    pub fn is_sampled(&self) -> bool {
        self.ids.sampled
    }

    pub fn tracestate(&self) -> Option<&str> {
        self.ids.tracestate.as_deref()
    }

    /// Set the transaction type, e.g. `request`
    pub fn with_type(&self, transaction_type: &str) -> &Self {
        self.details.lock().transaction_type = Some(transaction_type.to_string());
        self
    }

    /// Tag the framework that produced this transaction
    pub fn set_framework_name(&self, framework_name: &str) -> &Self {
        self.details.lock().framework_name = Some(framework_name.to_string());
        self
    }

    /// Set the result code unless one is already set
    pub fn with_result_if_unset(&self, result: &str) -> &Self {
        let mut details = self.details.lock();
        if details.result.is_none() {
            details.result = Some(result.to_string());
        }
        self
    }

    /// Set the outcome unless one is already determined
    pub fn with_outcome_if_unset(&self, outcome: Outcome) -> &Self {
        let mut details = self.details.lock();
        if details.outcome == Outcome::Unknown {
            details.outcome = outcome;
        }
        self
    }

    /// Record an application error. Only the first capture is retained.
    pub fn capture_exception(&self, error: &(dyn Error + 'static)) -> &Self {
        let mut details = self.details.lock();
        if details.error.is_none() {
            details.error = Some(CapturedError::from_error(error));
        } else {
            debug!(
                trace_id = %self.ids.trace_id,
                error = %error,
                "transaction already holds an error, ignoring later capture"
            );
        }
        self
    }

    /// Mutate request metadata
    pub fn with_request<F: FnOnce(&mut RequestMeta)>(&self, f: F) -> &Self {
        f(&mut self.details.lock().request);
        self
    }

    /// Mutate response metadata
    pub fn with_response<F: FnOnce(&mut ResponseMeta)>(&self, f: F) -> &Self {
        f(&mut self.details.lock().response);
        self
    }

    pub fn transaction_type(&self) -> Option<String> {
        self.details.lock().transaction_type.clone()
    }

    pub fn framework_name(&self) -> Option<String> {
        self.details.lock().framework_name.clone()
    }

    pub fn result(&self) -> Option<String> {
        self.details.lock().result.clone()
    }

    pub fn outcome(&self) -> Outcome {
        self.details.lock().outcome
    }

    pub fn error(&self) -> Option<CapturedError> {
        self.details.lock().error.clone()
    }

    pub fn request(&self) -> RequestMeta {
        self.details.lock().request.clone()
    }

    pub fn response(&self) -> ResponseMeta {
        self.details.lock().response.clone()
    }

    /// Claim the right to finish this transaction.
    ///
    /// Only an active transaction can be claimed, and exactly one caller
    /// ever gets `true`; it is then expected to record the outcome and call
    /// [`Transaction::end`].
    pub fn try_claim_finish(&self) -> bool {
        self.is_active()
            && self
                .finish_claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// `Active -> Ended`, then hand the record to the reporter.
    ///
    /// Returns whether this call ended the transaction; later calls are no-ops.
    pub fn end(&self) -> bool {
        if !self.transition(TransactionState::Active, TransactionState::Ended) {
            debug!(
                trace_id = %self.ids.trace_id,
                state = ?self.state(),
                "end ignored, transaction is not active"
            );
            return false;
        }

        let record = self.record();
        metrics::record_transaction_ended(record.outcome.as_str(), record.duration_ms / 1000.0);
        self.reporter.report(record);
        true
    }

    /// `Active -> Ended` without reporting.
    ///
    /// Used for a transaction that lost a race to be bound to its request.
    pub fn discard(&self) -> bool {
        let discarded = self.transition(TransactionState::Active, TransactionState::Ended);
        if discarded {
            debug!(trace_id = %self.ids.trace_id, "transaction discarded");
            metrics::record_anomaly("discarded");
        }
        discarded
    }

    /// Snapshot the transaction as it stands
    pub fn record(&self) -> TransactionRecord {
        let (name, name_priority) = {
            let slot = self.name.lock();
            (slot.value.clone(), slot.priority)
        };
        let details = self.details.lock();

        TransactionRecord {
            trace_id: self.ids.trace_id.to_string(),
            id: self.ids.id.to_string(),
            parent_id: self.ids.parent_id.map(|id| id.to_string()),
            name,
            name_priority,
            transaction_type: details.transaction_type.clone(),
            framework: details.framework_name.clone(),
            result: details.result.clone(),
            outcome: details.outcome,
            sampled: self.ids.sampled,
            timestamp: self.timestamp,
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            request: details.request.clone(),
            response: details.response.clone(),
            error: details.error.clone(),
        }
    }

    fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("trace_id", &self.ids.trace_id)
            .field("id", &self.ids.id)
            .field("state", &self.state())
            .field("name", &self.name())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{active_transaction, ids};
    use super::*;
    use crate::tracer::ChannelReporter;

    #[test]
    fn test_state_machine() {
        let transaction = Transaction::new(ids(), Arc::new(crate::tracer::NoopReporter));
        assert_eq!(transaction.state(), TransactionState::Unstarted);
        assert!(!transaction.end());

        assert!(transaction.activate());
        assert!(!transaction.activate());
        assert!(transaction.is_active());

        assert!(transaction.end());
        assert!(transaction.is_ended());
        assert!(!transaction.end());
        assert!(!transaction.activate());
    }

    #[test]
    fn test_end_reports_once() {
        let (reporter, mut rx) = ChannelReporter::new();
        let transaction = Transaction::new(ids(), Arc::new(reporter));
        transaction.activate();

        assert!(transaction.end());
        assert!(!transaction.end());

        let record = rx.try_recv().unwrap();
        assert_eq!(record.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_discard_does_not_report() {
        let (reporter, mut rx) = ChannelReporter::new();
        let transaction = Transaction::new(ids(), Arc::new(reporter));
        transaction.activate();

        assert!(transaction.discard());
        assert!(!transaction.end());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_result_and_outcome_set_once() {
        let transaction = active_transaction();
        transaction
            .with_result_if_unset("HTTP 2xx")
            .with_result_if_unset("HTTP 5xx")
            .with_outcome_if_unset(Outcome::Success)
            .with_outcome_if_unset(Outcome::Failure);

        assert_eq!(transaction.result().as_deref(), Some("HTTP 2xx"));
        assert_eq!(transaction.outcome(), Outcome::Success);
    }

    #[test]
    fn test_first_captured_error_retained() {
        let transaction = active_transaction();
        let first = std::io::Error::new(std::io::ErrorKind::Other, "first");
        let second = std::io::Error::new(std::io::ErrorKind::Other, "second");

        transaction.capture_exception(&first).capture_exception(&second);

        assert_eq!(transaction.error().unwrap().message, "first");
    }

    #[test]
    fn test_finish_claim_is_exclusive() {
        let transaction = active_transaction();
        assert!(transaction.try_claim_finish());
        assert!(!transaction.try_claim_finish());
    }

    #[test]
    fn test_unstarted_transaction_claimable_after_activation() {
        let (reporter, mut rx) = ChannelReporter::new();
        let transaction = Transaction::new(ids(), Arc::new(reporter));

        assert!(!transaction.try_claim_finish());
        assert!(!crate::lifecycle::finish(Some(&transaction), Some(&200u16), None));

        assert!(transaction.activate());
        assert!(crate::lifecycle::finish(Some(&transaction), Some(&200u16), None));

        let record = rx.try_recv().unwrap();
        assert_eq!(record.response.status_code, Some(200));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_record_serializes() {
        let transaction = active_transaction();
        transaction.with_type("request");
        transaction.with_request(|request| request.method = Some("GET".into()));

        let json = serde_json::to_value(transaction.record()).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["request"]["method"], "GET");
        assert_eq!(json["outcome"], "unknown");
    }
}
