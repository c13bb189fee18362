//! Context Propagation Bridge
//!
//! Moves the active transaction in and out of the ambient propagation
//! context so code that no longer holds the request (a spawned task, a
//! callback on another worker) can still find it.

use super::{PropagatedContext, PropagatedElement, Scope};
use crate::correlation;
use crate::request::InboundRequest;
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::debug;

/// Make `transaction` current until the returned scope is released
pub fn push(transaction: &Arc<Transaction>) -> Scope {
    PropagatedContext::current()
        .plus(PropagatedElement::Transaction(Arc::clone(transaction)))
        .attach()
}

/// Transaction carried by the current context
pub fn current() -> Option<Arc<Transaction>> {
    PropagatedContext::current().transaction().cloned()
}

/// Keep the transaction in a context that is being rebuilt from `elements`.
///
/// When no element carries a transaction but one is correlated with
/// `related` (or with the `ServerRequest` element when `related` is absent),
/// returns `elements` plus that transaction. Returns `None` when nothing
/// needs to change.
pub fn ensure(
    elements: &[PropagatedElement],
    related: Option<&dyn InboundRequest>,
) -> Option<Vec<PropagatedElement>> {
    if elements
        .iter()
        .any(|element| matches!(element, PropagatedElement::Transaction(_)))
    {
        return None;
    }

    let transaction = match related {
        Some(request) => correlation::find(request),
        None => elements.iter().find_map(|element| match element {
            PropagatedElement::ServerRequest(request) => correlation::find(request.as_ref()),
            _ => None,
        }),
    }?;

    debug!(
        trace_id = %transaction.trace_id(),
        "restoring transaction into rebuilt propagation context"
    );

    let mut merged = elements.to_vec();
    merged.push(PropagatedElement::Transaction(transaction));
    Some(merged)
}
