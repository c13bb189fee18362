//! Lifecycle Performance Benchmarks
//!
//! Measures the per-request overhead the engine adds on the hot path:
//! header extraction, correlation, naming, propagation and finish.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reqtrace::carrier::extract_header_context;
use reqtrace::correlation;
use reqtrace::flow::CompletionFlow;
use reqtrace::lifecycle::{finish, LifecycleAdapter, LifecycleManager, RouteTarget};
use reqtrace::propagation::{bridge, PropagateExt, PropagatedContext, PropagatedElement};
use reqtrace::request::StaticRequest;
use reqtrace::tracer::{AgentTracer, NoopReporter};
use reqtrace::transaction::{override_name, NamePriority};
use std::collections::HashMap;
use std::sync::Arc;

const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

fn lifecycle() -> LifecycleManager {
    LifecycleManager::new(Arc::new(AgentTracer::new("bench", Arc::new(NoopReporter))))
}

/// Benchmark trace context extraction from headers
fn bench_extract_header_context(c: &mut Criterion) {
    let mut headers = HashMap::new();
    headers.insert("traceparent".to_string(), TRACEPARENT.to_string());
    headers.insert("tracestate".to_string(), "congo=t61rcWkgMzE".to_string());

    c.bench_function("extract_header_context", |b| {
        b.iter(|| {
            let _ = black_box(extract_header_context(&headers));
        });
    });
}

/// Benchmark attach followed by finish, the minimum per-request cost
fn bench_attach_finish(c: &mut Criterion) {
    let lifecycle = lifecycle();

    let mut group = c.benchmark_group("attach_finish");

    group.bench_function("root", |b| {
        b.iter(|| {
            let request = StaticRequest::new("GET", "/orders/42?x=1");
            let transaction = correlation::attach(&request, &lifecycle);
            black_box(finish(transaction.as_deref(), Some(&200u16), None));
        });
    });

    group.bench_function("continued", |b| {
        b.iter(|| {
            let request = StaticRequest::new("GET", "/orders/42").header("traceparent", TRACEPARENT);
            let transaction = correlation::attach(&request, &lifecycle);
            black_box(finish(transaction.as_deref(), Some(&200u16), None));
        });
    });

    group.finish();
}

/// Benchmark priority naming, accepted and refused writes
fn bench_override_name(c: &mut Criterion) {
    let lifecycle = lifecycle();
    let request = StaticRequest::new("GET", "/orders/42");
    let transaction = correlation::attach(&request, &lifecycle);

    let mut group = c.benchmark_group("override_name");

    for (label, priority) in [
        ("accepted", NamePriority::HIGH_LEVEL_FRAMEWORK),
        ("refused", NamePriority::DEFAULT),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(label), &priority, |b, priority| {
            b.iter(|| {
                black_box(override_name(transaction.as_deref(), *priority, |name| {
                    name.push_str("OrdersController#show")
                }));
            });
        });
    }

    group.finish();
}

/// Benchmark pushing the transaction and reading it back
fn bench_push_current(c: &mut Criterion) {
    let lifecycle = lifecycle();
    let request = StaticRequest::new("GET", "/orders/42");
    let Some(transaction) = correlation::attach(&request, &lifecycle) else {
        return;
    };

    c.bench_function("push_current", |b| {
        b.iter(|| {
            let _scope = bridge::push(&transaction);
            black_box(bridge::current());
        });
    });
}

/// Benchmark a full scoped request with an async completion
fn bench_scoped_request(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let lifecycle = lifecycle();
    let adapter = LifecycleAdapter::ScopedLifecycle;
    let target = RouteTarget::new("OrdersController", "show");

    c.bench_function("scoped_request", |b| {
        b.to_async(&runtime).iter(|| async {
            let request = StaticRequest::new("GET", "/orders/42");
            let flow = {
                let entry = adapter.on_enter(&request, &lifecycle);
                adapter.on_route_resolved(&request, Some(&target));

                let flow = CompletionFlow::<u16>::new();
                let producer = flow.producer();
                let context = PropagatedContext::current()
                    .plus(PropagatedElement::attribute("tenant", "acme"));
                tokio::spawn(async move { producer.complete(200) }.propagated(context));

                adapter.on_exit(entry, &request, Ok(Some(flow)))
            };

            if let Some(flow) = flow {
                black_box(flow.wait().await.ok());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_extract_header_context,
    bench_attach_finish,
    bench_override_name,
    bench_push_current,
    bench_scoped_request,
);

criterion_main!(benches);
