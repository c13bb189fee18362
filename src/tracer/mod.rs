//! Tracing runtime
//!
//! The [`Tracer`] decides whether an inbound request gets a transaction at
//! all and, when it does, creates it as a child of the inbound trace context
//! or as a fresh root.
//!
//! A tracer may decline for three reasons, each counted in
//! `reqtrace_transactions_declined_total{reason}`:
//!
//! | Reason | Cause |
//! |--------|-------|
//! | `disabled` | the agent is switched off |
//! | `ignored_url` | the path matches `transactions.ignore_urls` |
//! | `sampler` | the sampler dropped the trace |

pub mod reporter;
pub mod sampling;

pub use reporter::{ChannelReporter, LogReporter, NoopReporter, Reporter};
pub use sampling::{SamplingDecision, SamplingRule, SamplingStrategy, TransactionSampler};

use crate::carrier::{extract_header_context, HeaderCarrier};
use crate::config::Config;
use crate::metrics;
use crate::transaction::{Transaction, TransactionIds};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use sampling::PathPattern;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the runtime knows about the request starting a transaction
#[derive(Debug, Clone, Copy)]
pub struct StartHint<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

/// Tracing runtime collaborator
pub trait Tracer: Send + Sync {
    /// Start a transaction continuing the trace found in `headers`, or a new
    /// root trace. `None` means the runtime declined.
    fn start_child_transaction(
        &self,
        headers: &dyn HeaderCarrier,
        hint: StartHint<'_>,
    ) -> Option<Arc<Transaction>>;
}

/// Default tracing runtime
pub struct AgentTracer {
    enabled: AtomicBool,
    service_name: String,
    ignore_urls: Vec<PathPattern>,
    sampler: TransactionSampler,
    ids: RandomIdGenerator,
    reporter: Arc<dyn Reporter>,
}

impl AgentTracer {
    /// Create an enabled tracer that samples everything
    pub fn new(service_name: &str, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            service_name: service_name.to_string(),
            ignore_urls: Vec::new(),
            sampler: TransactionSampler::always(),
            ids: RandomIdGenerator::default(),
            reporter,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &Config, reporter: Arc<dyn Reporter>) -> Self {
        let tracer = Self::new(&config.agent.service_name, reporter)
            .with_sampler(TransactionSampler::from_config(&config.sampling))
            .with_ignore_urls(&config.transactions.ignore_urls);
        tracer.set_enabled(config.agent.enabled);
        tracer
    }

    /// Replace the sampler
    pub fn with_sampler(mut self, sampler: TransactionSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Paths that never get a transaction (`/*` suffix for prefixes)
    pub fn with_ignore_urls<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.ignore_urls = patterns
            .iter()
            .map(|p| PathPattern::new(p.as_ref()))
            .collect();
        self
    }

    /// Switch the agent on or off at runtime
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn decline(&self, reason: &'static str, hint: StartHint<'_>) -> Option<Arc<Transaction>> {
        debug!(
            reason,
            method = hint.method,
            path = hint.path,
            "transaction not started"
        );
        metrics::record_transaction_declined(reason);
        None
    }
}

impl Tracer for AgentTracer {
    fn start_child_transaction(
        &self,
        headers: &dyn HeaderCarrier,
        hint: StartHint<'_>,
    ) -> Option<Arc<Transaction>> {
        if !self.is_enabled() {
            return self.decline("disabled", hint);
        }

        if self.ignore_urls.iter().any(|p| p.matches(hint.path)) {
            return self.decline("ignored_url", hint);
        }

        let parent = extract_header_context(headers);
        let trace_id = parent
            .as_ref()
            .map(|p| p.trace_id)
            .unwrap_or_else(|| self.ids.new_trace_id());

        if self
            .sampler
            .should_sample(parent.as_ref(), hint.method, hint.path, trace_id)
            == SamplingDecision::Drop
        {
            return self.decline("sampler", hint);
        }

        let ids = TransactionIds {
            trace_id,
            id: self.ids.new_span_id(),
            parent_id: parent.as_ref().map(|p| p.parent_span_id),
            sampled: true,
            tracestate: parent.and_then(|p| p.tracestate),
        };

        let transaction = Arc::new(Transaction::new(ids, Arc::clone(&self.reporter)));
        transaction.activate();
        metrics::record_transaction_started();

        debug!(
            service = %self.service_name,
            trace_id = %transaction.trace_id(),
            parent_id = ?transaction.parent_id(),
            "transaction started"
        );

        Some(transaction)
    }
}
