//! Carry a propagation context through a future
//!
//! The context is reinstalled for the duration of every poll, so the
//! future observes it no matter which worker thread polls it.

use super::PropagatedContext;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project_lite::pin_project! {
    /// Future that polls `inner` with `context` installed
    #[derive(Debug)]
    pub struct Propagated<F> {
        #[pin]
        inner: F,
        context: PropagatedContext,
    }
}

impl<F> Propagated<F> {
    pub fn new(inner: F, context: PropagatedContext) -> Self {
        Self { inner, context }
    }

    pub fn context(&self) -> &PropagatedContext {
        &self.context
    }
}

impl<F: Future> Future for Propagated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _scope = this.context.clone().attach();
        this.inner.poll(cx)
    }
}

/// Extension methods for carrying a context through a future
pub trait PropagateExt: Future + Sized {
    /// Poll with `context` installed
    fn propagated(self, context: PropagatedContext) -> Propagated<Self> {
        Propagated::new(self, context)
    }

    /// Poll with the context that is current right now installed
    fn in_current_context(self) -> Propagated<Self> {
        Propagated::new(self, PropagatedContext::current())
    }
}

impl<F: Future> PropagateExt for F {}
