//! Transaction Lifecycle Integration Tests
//!
//! start → finish scenarios, exactly-once finish under concurrency, and the
//! disabled-runtime path.

use reqtrace::correlation;
use reqtrace::lifecycle::{finish, LifecycleManager};
use reqtrace::propagation::bridge;
use reqtrace::request::{InboundRequest, StaticRequest};
use reqtrace::tracer::{AgentTracer, ChannelReporter, NoopReporter, TransactionSampler};
use reqtrace::tracer::SamplingStrategy;
use reqtrace::transaction::{override_name, NamePriority, Outcome, ResponseStatus};
use std::error::Error;
use std::sync::{Arc, Barrier};
use std::thread;

const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

#[test]
fn test_get_order_scenario() {
    let (reporter, mut rx) = ChannelReporter::new();
    let lifecycle =
        LifecycleManager::new(Arc::new(AgentTracer::new("orders", Arc::new(reporter))));
    let request = StaticRequest::new("GET", "/orders/42?x=1");

    let transaction = correlation::attach(&request, &lifecycle).unwrap();
    assert_eq!(transaction.name(), "GET /orders/42");

    let meta = transaction.request();
    assert_eq!(meta.method.as_deref(), Some("GET"));
    assert_eq!(meta.url.pathname.as_deref(), Some("/orders/42"));
    assert_eq!(meta.url.search.as_deref(), Some("x=1"));
    assert!(transaction.parent_id().is_none());

    assert!(finish(Some(&transaction), Some(&200u16), None));
    assert_eq!(transaction.outcome(), Outcome::Success);
    let response = transaction.response();
    assert!(response.finished);
    assert_eq!(response.status_code, Some(200));
    assert!(transaction.is_ended());

    assert!(!finish(Some(&transaction), Some(&500u16), None));

    let record = rx.try_recv().unwrap();
    assert_eq!(record.name, "GET /orders/42");
    assert_eq!(record.result.as_deref(), Some("HTTP 2xx"));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_traceparent_continues_trace() {
    let lifecycle =
        LifecycleManager::new(Arc::new(AgentTracer::new("orders", Arc::new(NoopReporter))));
    let request = StaticRequest::new("GET", "/orders").header("traceparent", TRACEPARENT);

    let transaction = lifecycle.start(&request).unwrap();

    assert_eq!(
        transaction.trace_id().to_string(),
        "0af7651916cd43dd8448eb211c80319c"
    );
    assert_eq!(
        transaction.parent_id().unwrap().to_string(),
        "b7ad6b7169203331"
    );
}

#[test]
fn test_malformed_traceparent_starts_fresh_trace() {
    let lifecycle =
        LifecycleManager::new(Arc::new(AgentTracer::new("orders", Arc::new(NoopReporter))));
    let request = StaticRequest::new("GET", "/orders").header("traceparent", "garbage");

    let transaction = lifecycle.start(&request).unwrap();
    assert!(transaction.parent_id().is_none());
}

#[test]
fn test_concurrent_finish_records_one_outcome() {
    const THREADS: usize = 16;

    let (reporter, mut rx) = ChannelReporter::new();
    let lifecycle =
        LifecycleManager::new(Arc::new(AgentTracer::new("orders", Arc::new(reporter))));
    let transaction = lifecycle.start(&StaticRequest::new("GET", "/orders/42")).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let transaction = Arc::clone(&transaction);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let status = 200 + i as u16;
                let error = std::io::Error::new(std::io::ErrorKind::Other, format!("e{}", i));
                barrier.wait();

                let response = (i % 2 == 0).then_some(&status as &dyn ResponseStatus);
                let error = (i % 3 == 0).then_some(&error as &(dyn Error + 'static));
                finish(Some(&transaction), response, error)
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert!(transaction.is_ended());
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_disabled_runtime_makes_everything_noop() {
    let tracer = AgentTracer::new("orders", Arc::new(NoopReporter));
    tracer.set_enabled(false);
    let lifecycle = LifecycleManager::new(Arc::new(tracer));
    let request = StaticRequest::new("GET", "/orders/42");

    let transaction = correlation::attach(&request, &lifecycle);
    assert!(transaction.is_none());

    assert!(!override_name(
        transaction.as_deref(),
        NamePriority::USER_SUPPLIED,
        |name| name.push_str("ignored"),
    ));
    assert!(!finish(transaction.as_deref(), Some(&200u16), None));
    assert!(bridge::current().is_none());
    assert!(bridge::ensure(&[], Some(&request as &dyn InboundRequest)).is_none());
}

#[test]
fn test_sampler_drop_yields_no_transaction() {
    let tracer = AgentTracer::new("orders", Arc::new(NoopReporter))
        .with_sampler(TransactionSampler::new(SamplingStrategy::ParentBased, 1.0));
    let lifecycle = LifecycleManager::new(Arc::new(tracer));

    let unsampled = StaticRequest::new("GET", "/orders")
        .header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00");
    assert!(lifecycle.start(&unsampled).is_none());

    let sampled = StaticRequest::new("GET", "/orders").header("traceparent", TRACEPARENT);
    assert!(lifecycle.start(&sampled).is_some());
}

#[test]
fn test_error_then_late_response_keeps_error() {
    let lifecycle =
        LifecycleManager::new(Arc::new(AgentTracer::new("orders", Arc::new(NoopReporter))));
    let transaction = lifecycle.start(&StaticRequest::new("GET", "/orders/42")).unwrap();
    let error = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");

    assert!(finish(Some(&transaction), None, Some(&error)));
    assert!(!finish(Some(&transaction), Some(&200u16), None));

    assert_eq!(transaction.outcome(), Outcome::Failure);
    assert_eq!(transaction.error().unwrap().message, "upstream timed out");
    assert_eq!(transaction.response().status_code, None);
}
