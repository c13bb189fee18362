//! Async Completion Adapter
//!
//! Attaches a single finalize callback to a continuation. However many times
//! the instrumented code is entered and however many times the same
//! [`Finalizer`] is attached, the callback runs at most once, when the first
//! attached continuation settles.
//!
//! Two continuation shapes are supported: [`CompletionFlow`] (callback
//! registration) and plain futures via [`Finalize`].

use super::{CompletionFlow, FlowError};
use crate::metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error};

type FinalizeFn<T> = Box<dyn FnOnce(Option<&T>, Option<&FlowError>) + Send>;

/// Run-once finalize callback that can be attached to several flows
pub struct Finalizer<T> {
    callback: Arc<Mutex<Option<FinalizeFn<T>>>>,
}

impl<T> Clone for Finalizer<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T: Send + Sync + 'static> Finalizer<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Option<&T>, Option<&FlowError>) + Send + 'static,
    {
        Self {
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Register on `flow`.
    ///
    /// Returns the flow to hand back to the caller, or `None` when there is
    /// no flow. In that case nothing is registered and the caller finishes
    /// synchronously with whatever error it holds.
    pub fn attach(&self, flow: Option<&CompletionFlow<T>>) -> Option<CompletionFlow<T>> {
        let flow = flow?;
        let finalizer = self.clone();
        flow.on_complete(move |value, error| {
            finalizer.fire(value, error);
        });
        Some(flow.clone())
    }

    /// Run the callback now unless it already ran. Returns whether it ran.
    pub fn fire(&self, value: Option<&T>, error: Option<&FlowError>) -> bool {
        // Taken before the call so the callback never runs under the lock
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(value, error);
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Attach `on_complete` to `flow`, see [`Finalizer::attach`]
pub fn attach_finalizer<T, F>(flow: Option<&CompletionFlow<T>>, on_complete: F) -> Option<CompletionFlow<T>>
where
    T: Send + Sync + 'static,
    F: FnOnce(Option<&T>, Option<&FlowError>) + Send + 'static,
{
    Finalizer::new(on_complete).attach(flow)
}

pin_project_lite::pin_project! {
    /// Future that hands its output to `callback` before returning it.
    ///
    /// Dropping it before completion counts an `abandoned_flow` anomaly; the
    /// callback does not run in that case.
    pub struct Finalize<F, C> {
        #[pin]
        inner: F,
        callback: Option<C>,
    }

    impl<F, C> PinnedDrop for Finalize<F, C> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if this.callback.is_some() {
                debug!("flow dropped before completion, finalizer not run");
                metrics::record_anomaly("abandoned_flow");
            }
        }
    }
}

impl<F, C> Finalize<F, C>
where
    F: Future,
    C: FnOnce(&F::Output),
{
    pub fn new(inner: F, callback: C) -> Self {
        Self {
            inner,
            callback: Some(callback),
        }
    }
}

impl<F, C> Future for Finalize<F, C>
where
    F: Future,
    C: FnOnce(&F::Output),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = match this.inner.poll(cx) {
            Poll::Ready(output) => output,
            Poll::Pending => return Poll::Pending,
        };

        if let Some(callback) = this.callback.take() {
            if catch_unwind(AssertUnwindSafe(|| callback(&output))).is_err() {
                error!("finalizer panicked, output returned unchanged");
                metrics::record_anomaly("finalizer_panic");
            }
        }
        Poll::Ready(output)
    }
}
