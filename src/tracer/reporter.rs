//! Transport hand-off for ended transactions
//!
//! The engine never serializes or ships transactions itself; it hands each
//! ended [`TransactionRecord`] to a [`Reporter`] exactly once.

use crate::transaction::TransactionRecord;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives every ended transaction exactly once
pub trait Reporter: Send + Sync {
    fn report(&self, record: TransactionRecord);
}

/// Writes ended transactions to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, record: TransactionRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(
                target: "reqtrace::reporter",
                trace_id = %record.trace_id,
                transaction = %record.name,
                outcome = record.outcome.as_str(),
                "{}",
                json
            ),
            Err(e) => warn!(
                target: "reqtrace::reporter",
                trace_id = %record.trace_id,
                error = %e,
                "failed to serialize transaction"
            ),
        }
    }
}

/// Drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _record: TransactionRecord) {}
}

/// Forwards ended transactions over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<TransactionRecord>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransactionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, record: TransactionRecord) {
        if let Err(e) = self.tx.send(record) {
            warn!(
                target: "reqtrace::reporter",
                trace_id = %e.0.trace_id,
                "transaction receiver dropped, record lost"
            );
        }
    }
}
