//! Transaction Correlation Store
//!
//! Binds a request to at most one transaction through the request's own
//! attribute store. Binding is first-writer-wins: when two instrumentation
//! points race to attach, both observe the same transaction and the loser's
//! freshly started one is discarded unreported.

use crate::lifecycle::LifecycleManager;
use crate::request::{AttributeValue, InboundRequest};
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::debug;

/// Request attribute holding the bound transaction
pub const REQUEST_ATTRIBUTE: &str = "reqtrace.transaction";

/// Transaction bound to `request`, if any. Never creates.
pub fn find(request: &dyn InboundRequest) -> Option<Arc<Transaction>> {
    match request.attributes().get(REQUEST_ATTRIBUTE)? {
        AttributeValue::Transaction(transaction) => Some(transaction),
        _ => None,
    }
}

/// Bind a transaction to `request`, starting one if none is bound yet.
///
/// Returns the bound transaction, or `None` when the lifecycle manager
/// declined to start one (in which case nothing is bound).
pub fn attach(request: &dyn InboundRequest, lifecycle: &LifecycleManager) -> Option<Arc<Transaction>> {
    if let Some(existing) = find(request) {
        return Some(existing);
    }

    let started = lifecycle.start(request)?;

    // A foreign text value in the slot is overwritten, but only once: a
    // concurrent attach that already replaced it wins.
    let (bound, stored) = request.attributes().replace_if(
        REQUEST_ATTRIBUTE,
        |current| matches!(current, AttributeValue::Text(_)),
        AttributeValue::Transaction(Arc::clone(&started)),
    );

    if stored {
        return Some(started);
    }

    match bound {
        AttributeValue::Transaction(winner) => {
            debug!(
                trace_id = %winner.trace_id(),
                "request already correlated by a concurrent attach"
            );
            started.discard();
            Some(winner)
        }
        AttributeValue::Text(_) => {
            started.discard();
            None
        }
    }
}
