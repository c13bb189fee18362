//! Ambient propagation context
//!
//! A [`PropagatedContext`] is an immutable, cheaply cloned set of
//! [`PropagatedElement`]s. Extending it with [`PropagatedContext::plus`]
//! produces a new context and leaves the original untouched, so a context
//! captured by one continuation is never mutated by another.
//!
//! The "current" context lives in a per-thread slot. Installing a context
//! returns a [`Scope`] that restores the previous one when released. Futures
//! carry their context across worker threads with
//! [`PropagateExt::in_current_context`], which reinstalls it on every poll.
//!
//! ```
//! use reqtrace::propagation::{PropagatedContext, PropagatedElement};
//!
//! let context = PropagatedContext::current().plus(PropagatedElement::attribute("tenant", "acme"));
//! {
//!     let _scope = context.attach();
//!     assert_eq!(PropagatedContext::current().len(), 1);
//! }
//! assert!(PropagatedContext::current().is_empty());
//! ```

pub mod bridge;
pub mod future;

pub use future::{PropagateExt, Propagated};

use crate::request::InboundRequest;
use crate::transaction::Transaction;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Closed set of values carried by a propagation context
#[derive(Debug, Clone)]
pub enum PropagatedElement {
    /// The active transaction
    Transaction(Arc<Transaction>),
    /// The server request being processed, installed by the server itself
    ServerRequest(Arc<dyn InboundRequest>),
    /// Free-form key/value
    Attribute { key: String, value: String },
}

/// Identifies the slot an element occupies; a context holds at most one
/// element per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind<'a> {
    Transaction,
    ServerRequest,
    Attribute(&'a str),
}

impl PropagatedElement {
    /// Attribute element
    pub fn attribute(key: &str, value: &str) -> Self {
        PropagatedElement::Attribute {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn kind(&self) -> ElementKind<'_> {
        match self {
            PropagatedElement::Transaction(_) => ElementKind::Transaction,
            PropagatedElement::ServerRequest(_) => ElementKind::ServerRequest,
            PropagatedElement::Attribute { key, .. } => ElementKind::Attribute(key),
        }
    }
}

/// Immutable set of propagated elements
#[derive(Debug, Clone)]
pub struct PropagatedContext {
    elements: Arc<[PropagatedElement]>,
}

thread_local! {
    static CURRENT: RefCell<PropagatedContext> = RefCell::new(PropagatedContext::empty());
}

impl PropagatedContext {
    /// Context with no elements
    pub fn empty() -> Self {
        Self {
            elements: Arc::from(Vec::new()),
        }
    }

    /// Context holding `elements`. Later elements replace earlier ones of
    /// the same kind.
    pub fn from_elements<I: IntoIterator<Item = PropagatedElement>>(elements: I) -> Self {
        elements
            .into_iter()
            .fold(Self::empty(), |context, element| context.plus(element))
    }

    /// The context installed on this thread, or an empty one
    pub fn current() -> Self {
        CURRENT
            .try_with(|slot| slot.borrow().clone())
            .unwrap_or_else(|_| Self::empty())
    }

    /// A new context equal to this one plus `element`, which replaces any
    /// element of the same kind
    pub fn plus(&self, element: PropagatedElement) -> Self {
        let mut elements: Vec<PropagatedElement> = self
            .elements
            .iter()
            .filter(|existing| existing.kind() != element.kind())
            .cloned()
            .collect();
        elements.push(element);

        Self {
            elements: Arc::from(elements),
        }
    }

    /// Element of the given kind
    pub fn get(&self, kind: ElementKind<'_>) -> Option<&PropagatedElement> {
        self.elements.iter().find(|element| element.kind() == kind)
    }

    /// Transaction carried by this context
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        match self.get(ElementKind::Transaction)? {
            PropagatedElement::Transaction(transaction) => Some(transaction),
            _ => None,
        }
    }

    /// Server request carried by this context
    pub fn server_request(&self) -> Option<&Arc<dyn InboundRequest>> {
        match self.get(ElementKind::ServerRequest)? {
            PropagatedElement::ServerRequest(request) => Some(request),
            _ => None,
        }
    }

    pub fn elements(&self) -> &[PropagatedElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Install this context as current on this thread until the returned
    /// scope is released
    pub fn attach(self) -> Scope {
        let previous = CURRENT.try_with(|slot| slot.replace(self)).ok();
        Scope {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context installed
    pub fn in_scope<R, F: FnOnce() -> R>(&self, f: F) -> R {
        let _scope = self.clone().attach();
        f()
    }
}

impl Default for PropagatedContext {
    fn default() -> Self {
        Self::empty()
    }
}

/// Restores the previously current context when released.
///
/// Released exactly once, either explicitly with [`Scope::close`] or on
/// drop. Tied to the thread that created it.
#[must_use = "dropping the scope immediately restores the previous context"]
#[derive(Debug)]
pub struct Scope {
    previous: Option<PropagatedContext>,
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    /// Release the scope now
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = previous);
        }
    }
}
