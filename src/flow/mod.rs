//! Asynchronous completion flow
//!
//! A [`CompletionFlow`] is a settle-once continuation: it is completed with a
//! value or failed with an error exactly once, possibly on another thread,
//! and every callback registered with it runs exactly once with that
//! outcome. Registering after settlement runs the callback immediately, so
//! there is no missed-completion window.
//!
//! Callbacks are always invoked outside the internal lock. A panicking
//! callback is caught, logged and counted; it never reaches the thread that
//! settled the flow.
//!
//! Work that settles a flow from another task should hold a
//! [`FlowProducer`]: if the last producer drops while the flow is pending
//! (the task panicked or was cancelled), the flow fails with
//! [`FlowFailure::Abandoned`] instead of leaving its waiters hanging.

pub mod finalizer;

pub use finalizer::{attach_finalizer, Finalize, Finalizer};

use crate::metrics;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Error a flow settled with
pub type FlowError = Arc<dyn Error + Send + Sync>;

/// Outcome of a settled flow
pub type Settled<T> = Result<Arc<T>, FlowError>;

type Callback<T> = Box<dyn FnOnce(&Settled<T>) + Send>;

/// Failures produced by the flow machinery itself
#[derive(Debug, Error)]
pub enum FlowFailure {
    #[error("map function panicked: {0}")]
    MapPanicked(String),

    #[error("flow dropped before it settled")]
    Abandoned,
}

enum FlowState<T> {
    Pending(Vec<Callback<T>>),
    Settled(Settled<T>),
}

/// Settle-once continuation shared between producer and consumers
pub struct CompletionFlow<T> {
    state: Arc<Mutex<FlowState<T>>>,
}

impl<T> Clone for CompletionFlow<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for CompletionFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFlow")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> CompletionFlow<T> {
    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock(), FlowState::Settled(_))
    }
}

impl<T: Send + Sync + 'static> Default for CompletionFlow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> CompletionFlow<T> {
    /// Pending flow
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlowState::Pending(Vec::new()))),
        }
    }

    /// Flow already completed with `value`
    pub fn completed(value: T) -> Self {
        Self::settled(Ok(Arc::new(value)))
    }

    /// Flow already failed with `error`
    pub fn failed<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self::settled(Err(Arc::new(error)))
    }

    fn settled(outcome: Settled<T>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlowState::Settled(outcome))),
        }
    }

    /// Complete with `value`. Returns `false` if the flow had already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(Arc::new(value)))
    }

    /// Fail with `error`. Returns `false` if the flow had already settled.
    pub fn fail<E: Error + Send + Sync + 'static>(&self, error: E) -> bool {
        self.settle(Err(Arc::new(error)))
    }

    /// Settle with an already shared outcome
    pub fn settle(&self, outcome: Settled<T>) -> bool {
        let settled = self.settle_if_pending(outcome);
        if !settled {
            warn!("flow already settled, ignoring second outcome");
        }
        settled
    }

    fn settle_if_pending(&self, outcome: Settled<T>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, FlowState::Settled(outcome.clone())) {
                FlowState::Pending(callbacks) => callbacks,
                previous @ FlowState::Settled(_) => {
                    *state = previous;
                    return false;
                }
            }
        };

        for callback in callbacks {
            run_callback(callback, &outcome);
        }
        true
    }

    /// Producing handle for this flow. See [`FlowProducer`].
    pub fn producer(&self) -> FlowProducer<T> {
        FlowProducer {
            guard: Arc::new(ProducerGuard { flow: self.clone() }),
        }
    }

    /// Run `callback` once with the value or the error, now if settled,
    /// otherwise on the settling thread
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Option<&T>, Option<&FlowError>) + Send + 'static,
    {
        self.register(Box::new(move |outcome| match outcome {
            Ok(value) => callback(Some(&**value), None),
            Err(e) => callback(None, Some(e)),
        }));
    }

    /// Flow settled with `f` applied to this flow's value.
    ///
    /// Errors pass through unchanged; a panic in `f` fails the new flow with
    /// [`FlowFailure::MapPanicked`].
    pub fn map<U, F>(&self, f: F) -> CompletionFlow<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let mapped = CompletionFlow::new();
        let downstream = mapped.clone();

        self.register(Box::new(move |outcome| {
            let next = match outcome {
                Ok(value) => match catch_unwind(AssertUnwindSafe(|| f(&**value))) {
                    Ok(mapped_value) => Ok(Arc::new(mapped_value)),
                    Err(panic) => {
                        let failure = FlowFailure::MapPanicked(panic_message(&*panic));
                        Err(Arc::new(failure) as FlowError)
                    }
                },
                Err(e) => Err(Arc::clone(e)),
            };
            downstream.settle(next);
        }));

        mapped
    }

    /// Flow settled with this flow's outcome after `f` observed it
    pub fn inspect<F>(&self, f: F) -> CompletionFlow<T>
    where
        F: FnOnce(Option<&T>, Option<&FlowError>) + Send + 'static,
    {
        let inspected = CompletionFlow::new();
        let downstream = inspected.clone();

        self.register(Box::new(move |outcome| {
            let observed = catch_unwind(AssertUnwindSafe(|| match outcome {
                Ok(value) => f(Some(&**value), None),
                Err(e) => f(None, Some(e)),
            }));
            if observed.is_err() {
                error!("flow inspector panicked, outcome forwarded unchanged");
                metrics::record_anomaly("finalizer_panic");
            }
            downstream.settle(outcome.clone());
        }));

        inspected
    }

    /// Wait for the flow to settle.
    ///
    /// Resolves to [`FlowFailure::Abandoned`] when every [`FlowProducer`]
    /// dropped without settling.
    pub async fn wait(&self) -> Settled<T> {
        let (tx, rx) = oneshot::channel();
        self.register(Box::new(move |outcome| {
            let _ = tx.send(outcome.clone());
        }));

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Arc::new(FlowFailure::Abandoned)),
        }
    }

    fn register(&self, callback: Callback<T>) {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                FlowState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                FlowState::Settled(outcome) => outcome.clone(),
            }
        };

        run_callback(callback, &outcome);
    }
}

/// Producing side of a [`CompletionFlow`].
///
/// Clones share one slot. When the last clone drops while the flow is still
/// pending, the flow fails with [`FlowFailure::Abandoned`].
pub struct FlowProducer<T: Send + Sync + 'static> {
    guard: Arc<ProducerGuard<T>>,
}

struct ProducerGuard<T: Send + Sync + 'static> {
    flow: CompletionFlow<T>,
}

impl<T: Send + Sync + 'static> Clone for FlowProducer<T> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for FlowProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowProducer")
            .field("flow", &self.guard.flow)
            .finish()
    }
}

impl<T: Send + Sync + 'static> FlowProducer<T> {
    /// Complete with `value`. Returns `false` if the flow had already settled.
    pub fn complete(&self, value: T) -> bool {
        self.guard.flow.complete(value)
    }

    /// Fail with `error`. Returns `false` if the flow had already settled.
    pub fn fail<E: Error + Send + Sync + 'static>(&self, error: E) -> bool {
        self.guard.flow.fail(error)
    }

    /// Settle with an already shared outcome
    pub fn settle(&self, outcome: Settled<T>) -> bool {
        self.guard.flow.settle(outcome)
    }
}

impl<T: Send + Sync + 'static> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        if self
            .flow
            .settle_if_pending(Err(Arc::new(FlowFailure::Abandoned)))
        {
            debug!("last flow producer dropped before settling");
            metrics::record_anomaly("abandoned_flow");
        }
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Settled<T>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        error!(
            panic = %panic_message(&*panic),
            "flow callback panicked"
        );
        metrics::record_anomaly("finalizer_panic");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Error)]
    #[error("upstream timed out")]
    struct Timeout;

    #[test]
    fn test_callback_after_settlement_runs_immediately() {
        let flow = CompletionFlow::completed(7u32);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        flow.on_complete(move |value, error| {
            assert!(error.is_none());
            counter.store(*value.unwrap() as usize, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_settles_once() {
        let flow = CompletionFlow::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        flow.on_complete(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(flow.complete(1u8));
        assert!(!flow.complete(2u8));
        assert!(!flow.fail(Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_map_passes_errors_through() {
        let flow: CompletionFlow<u32> = CompletionFlow::new();
        let mapped = flow.map(|v| v * 2);

        flow.fail(Timeout);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        mapped.on_complete(move |value, error| {
            assert!(value.is_none());
            *slot.lock() = error.map(|e| e.to_string());
        });
        assert_eq!(seen.lock().as_deref(), Some("upstream timed out"));
    }

    #[test]
    fn test_map_panic_fails_downstream() {
        let flow = CompletionFlow::completed(1u32);
        let mapped: CompletionFlow<u32> = flow.map(|_| panic!("bad mapper"));

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        mapped.on_complete(move |_, error| *slot.lock() = error.map(|e| e.to_string()));

        assert_eq!(
            seen.lock().as_deref(),
            Some("map function panicked: bad mapper")
        );
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let flow = CompletionFlow::new();
        let calls = Arc::new(AtomicUsize::new(0));

        flow.on_complete(|_, _| panic!("finalizer blew up"));
        let counter = Arc::clone(&calls);
        flow.on_complete(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(flow.complete("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_across_threads() {
        let flow: CompletionFlow<String> = CompletionFlow::new();
        let producer = flow.clone();

        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            producer.complete("ready".to_string());
        });

        let value = flow.wait().await.unwrap();
        assert_eq!(value.as_str(), "ready");
    }

    #[test]
    fn test_debug_reports_settlement() {
        struct Opaque;

        let flow: CompletionFlow<Opaque> = CompletionFlow::new();
        assert_eq!(format!("{:?}", flow), "CompletionFlow { settled: false }");

        flow.complete(Opaque);
        assert_eq!(format!("{:?}", flow), "CompletionFlow { settled: true }");
    }

    #[tokio::test]
    async fn test_panicking_producer_abandons_flow() {
        let flow: CompletionFlow<u32> = CompletionFlow::new();
        let producer = flow.producer();

        let task = tokio::spawn(async move {
            let _producer = producer;
            panic!("handler crashed");
        });
        assert!(task.await.unwrap_err().is_panic());

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(500), flow.wait())
            .await
            .expect("waiter must not hang");
        let error = outcome.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<FlowFailure>(),
            Some(FlowFailure::Abandoned)
        ));
    }

    #[test]
    fn test_producer_clones_share_one_slot() {
        let flow: CompletionFlow<u32> = CompletionFlow::new();
        let producer = flow.producer();
        let second = producer.clone();

        drop(producer);
        assert!(!flow.is_settled());

        assert!(second.complete(9));
        drop(second);

        let seen = Arc::new(AtomicUsize::new(0));
        let slot = Arc::clone(&seen);
        flow.on_complete(move |value, error| {
            assert!(error.is_none());
            slot.store(*value.unwrap() as usize, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_inspect_forwards_same_value() {
        let flow = CompletionFlow::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let inspected = flow.inspect(move |value, _| {
            counter.store(*value.unwrap(), Ordering::SeqCst);
        });
        flow.complete(5usize);

        assert_eq!(*inspected.wait().await.unwrap(), 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
