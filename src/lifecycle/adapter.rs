//! Request lifecycle hooks
//!
//! Servers expose their request pipeline in one of two shapes, and each
//! shape gets one [`LifecycleAdapter`] variant. Both route every completion
//! path into [`finish`]; they differ only in how they reach the transaction
//! and the continuation.
//!
//! | Variant | Enter | Exit |
//! |---------|-------|------|
//! | `ScopedLifecycle` | attach, push propagation scope | close scope, finish on error or when the flow settles |
//! | `MappedFlow` | attach | look the transaction up, finish on error or through the returned flow |

use super::{finish, LifecycleManager};
use crate::correlation;
use crate::flow::{attach_finalizer, CompletionFlow, FlowError};
use crate::propagation::{bridge, PropagatedElement, Scope};
use crate::request::InboundRequest;
use crate::transaction::{override_name, NamePriority, ResponseStatus, Transaction};
use std::error::Error;
use std::sync::Arc;
use tracing::debug;

/// Marker the framework appends to generated proxy type names
const INTERCEPTED_MARKER: &str = "$Intercepted";

/// Shape of the host pipeline's request hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAdapter {
    /// Enter/exit pair around the whole pipeline; the transaction is
    /// propagated for the duration of the call
    ScopedLifecycle,
    /// Exit hook that may replace the returned continuation
    MappedFlow,
}

/// State carried from `on_enter` to `on_exit`.
///
/// Holds the propagation scope for `ScopedLifecycle`, so it must be passed
/// to `on_exit` on the thread that created it.
#[derive(Debug)]
pub struct RequestEntry {
    scope: Option<Scope>,
    transaction: Option<Arc<Transaction>>,
}

impl RequestEntry {
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }
}

/// Handler method a route resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Simple name of the type declaring the handler
    pub declaring_type: String,
    /// Simple name of the type it was generated from, when known
    pub declared_parent: Option<String>,
    pub method_name: String,
}

impl RouteTarget {
    pub fn new(declaring_type: &str, method_name: &str) -> Self {
        Self {
            declaring_type: declaring_type.to_string(),
            declared_parent: None,
            method_name: method_name.to_string(),
        }
    }

    pub fn with_declared_parent(mut self, parent: &str) -> Self {
        self.declared_parent = Some(parent.to_string());
        self
    }

    /// Controller name with generated proxy types resolved to their parent
    pub fn controller_name(&self) -> &str {
        if !self.declaring_type.contains(INTERCEPTED_MARKER) {
            return &self.declaring_type;
        }

        match self.declared_parent.as_deref() {
            Some(parent) => {
                debug!(parent, "intercepted type detected, resolving to parent");
                parent
            }
            None => {
                debug!(
                    declaring_type = %self.declaring_type,
                    "intercepted type detected, parent unknown"
                );
                &self.declaring_type
            }
        }
    }
}

impl LifecycleAdapter {
    /// Request entered the pipeline
    pub fn on_enter(
        &self,
        request: &dyn InboundRequest,
        lifecycle: &LifecycleManager,
    ) -> RequestEntry {
        let transaction = correlation::attach(request, lifecycle);

        let scope = match self {
            LifecycleAdapter::ScopedLifecycle => transaction.as_ref().map(bridge::push),
            LifecycleAdapter::MappedFlow => None,
        };

        RequestEntry { scope, transaction }
    }

    /// Request left the pipeline.
    ///
    /// `result` is either the continuation the pipeline returned (possibly
    /// none) or the error it raised synchronously. Returns the continuation
    /// the caller should hand on, or `None` when there is none.
    pub fn on_exit<T>(
        &self,
        entry: RequestEntry,
        request: &dyn InboundRequest,
        result: Result<Option<CompletionFlow<T>>, &(dyn Error + 'static)>,
    ) -> Option<CompletionFlow<T>>
    where
        T: ResponseStatus + Send + Sync + 'static,
    {
        let RequestEntry { scope, transaction } = entry;
        if let Some(scope) = scope {
            scope.close();
        }

        let transaction = match self {
            LifecycleAdapter::ScopedLifecycle => transaction,
            LifecycleAdapter::MappedFlow => correlation::find(request),
        };

        let Some(transaction) = transaction else {
            return result.ok().flatten();
        };

        let flow = match result {
            Ok(flow) => flow,
            Err(error) => {
                finish(Some(&transaction), None, Some(error));
                return None;
            }
        };

        match self {
            LifecycleAdapter::ScopedLifecycle => {
                attach_finalizer(flow.as_ref(), move |response, error| {
                    finish_with(&transaction, response, error);
                })
            }
            LifecycleAdapter::MappedFlow => flow.map(|flow| {
                flow.inspect(move |response, error| {
                    finish_with(&transaction, response, error);
                })
            }),
        }
    }

    /// The router resolved the request to a handler method.
    ///
    /// Renames the transaction `Controller#method`, beating the generic
    /// method+path name.
    pub fn on_route_resolved(&self, request: &dyn InboundRequest, target: Option<&RouteTarget>) {
        let Some(target) = target else {
            return;
        };
        let transaction = correlation::find(request);

        override_name(
            transaction.as_deref(),
            NamePriority::HIGH_LEVEL_FRAMEWORK,
            |name| {
                name.push_str(target.controller_name());
                name.push('#');
                name.push_str(&target.method_name);
            },
        );
    }

    /// The host is installing a propagation context built from `elements`.
    ///
    /// Returns the elements to install instead, or `None` to keep them.
    pub fn on_context_install(
        &self,
        elements: &[PropagatedElement],
    ) -> Option<Vec<PropagatedElement>> {
        bridge::ensure(elements, None)
    }
}

fn finish_with<T: ResponseStatus>(
    transaction: &Transaction,
    response: Option<&T>,
    error: Option<&FlowError>,
) {
    let response = response.map(|r| r as &dyn ResponseStatus);
    let error = error.map(|e| &**e as &(dyn Error + 'static));
    finish(Some(transaction), response, error);
}
