//! Instrumented demo HTTP server
//!
//! A small hyper server wired through the engine end to end: every request
//! enters through a [`LifecycleAdapter`], handlers answer with a
//! [`CompletionFlow`], and the transaction is finished when that flow
//! settles (or immediately when a handler fails synchronously).
//!
//! | Route | Behaviour |
//! |-------|-----------|
//! | `GET /health` | completes immediately |
//! | `GET /orders/{id}` | resolves to `OrdersController#show` |
//! | `GET /slow` | completes from a spawned task that reads the propagated transaction |
//! | `GET /fail` | handler error raised synchronously |
//! | `GET /async-fail` | flow fails from a spawned task |
//! | `GET /crash` | spawned task panics, the flow fails as abandoned |

use crate::correlation;
use crate::flow::{CompletionFlow, Finalize, FlowProducer};
use crate::lifecycle::{LifecycleAdapter, LifecycleManager, RouteTarget};
use crate::propagation::{bridge, PropagateExt, PropagatedContext, PropagatedElement};
use crate::request::{HttpRequest, InboundRequest};
use crate::transaction::ResponseStatus;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::error::Error;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Response header carrying the trace id of the request's transaction
pub const TRACE_ID_HEADER: &str = "x-reqtrace-trace-id";

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),
}

/// Errors raised by demo handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(&'static str),
}

/// Response produced by a demo handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoResponse {
    pub status: StatusCode,
    pub body: String,
}

impl DemoResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    fn to_http(&self, trace_id: Option<String>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body.clone())));
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(value) = trace_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            response.headers_mut().insert(TRACE_ID_HEADER, value);
        }
        response
    }
}

impl ResponseStatus for DemoResponse {
    fn status_code(&self) -> u16 {
        self.status.as_u16()
    }
}

struct ServerContext {
    lifecycle: LifecycleManager,
    adapter: LifecycleAdapter,
}

/// HTTP server
pub struct Server {
    lifecycle: LifecycleManager,
    adapter: LifecycleAdapter,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `address`. Port 0 lets the OS pick.
    pub async fn bind(address: &str, lifecycle: LifecycleManager) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!(address = %local_addr, "server bound");

        Ok(Self {
            lifecycle,
            adapter: LifecycleAdapter::ScopedLifecycle,
            listener,
            local_addr,
        })
    }

    /// Select the lifecycle hook shape requests go through
    pub fn with_adapter(mut self, adapter: LifecycleAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        info!(address = %self.local_addr, adapter = ?self.adapter, "serving");
        let server_context = Arc::new(ServerContext {
            lifecycle: self.lifecycle,
            adapter: self.adapter,
        });
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down server");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let context = Arc::clone(&server_context);
            let local_addr = self.local_addr;

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let context = Arc::clone(&context);
                    async move { handle_request(req, context, peer_addr, local_addr).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(peer = %peer_addr, error = %e, "error serving connection");
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ServerContext>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (request, _body) = HttpRequest::from_request(req, Some(peer_addr), Some(local_addr));
    let request = Arc::new(request);

    debug!(method = request.method(), path = request.path(), "handling request");

    let response = match dispatch(&context, &request) {
        Ok(Some(flow)) => match Finalize::new(flow.wait(), |outcome| {
            debug!(settled_ok = outcome.is_ok(), "response flow settled");
        })
        .await
        {
            Ok(response) => response.as_ref().clone(),
            Err(e) => DemoResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(r#"{{"error":"{}"}}"#, e),
            ),
        },
        Ok(None) => DemoResponse::new(StatusCode::NO_CONTENT, ""),
        Err(e) => DemoResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(r#"{{"error":"{}"}}"#, e),
        ),
    };

    let trace_id = correlation::find(request.as_ref()).map(|t| t.trace_id().to_string());
    Ok(response.to_http(trace_id))
}

/// Run the request through the lifecycle hooks and the router.
///
/// Synchronous so the propagation scope never crosses an await.
fn dispatch(
    context: &ServerContext,
    request: &Arc<HttpRequest>,
) -> Result<Option<CompletionFlow<DemoResponse>>, HandlerError> {
    let entry = context.adapter.on_enter(request.as_ref(), &context.lifecycle);

    match route(context, request) {
        Ok(flow) => Ok(context
            .adapter
            .on_exit(entry, request.as_ref(), Ok(Some(flow)))),
        Err(e) => {
            context
                .adapter
                .on_exit::<DemoResponse>(entry, request.as_ref(), Err(&e as &(dyn Error + 'static)));
            Err(e)
        }
    }
}

fn route(
    context: &ServerContext,
    request: &Arc<HttpRequest>,
) -> Result<CompletionFlow<DemoResponse>, HandlerError> {
    let path = request.path();

    if path == "/health" {
        return Ok(CompletionFlow::completed(DemoResponse::ok(r#"{"status":"ok"}"#)));
    }

    if let Some(id) = path.strip_prefix("/orders/") {
        context.adapter.on_route_resolved(
            request.as_ref(),
            Some(&RouteTarget::new("OrdersController", "show")),
        );
        return Ok(CompletionFlow::completed(DemoResponse::ok(format!(
            r#"{{"order":"{}"}}"#,
            id
        ))));
    }

    match path {
        "/slow" => Ok(spawn_handler(context, request, |flow| {
            let trace_id = bridge::current()
                .map(|t| t.trace_id().to_string())
                .unwrap_or_default();
            flow.complete(DemoResponse::ok(format!(r#"{{"trace_id":"{}"}}"#, trace_id)));
        })),
        "/async-fail" => Ok(spawn_handler(context, request, |flow| {
            flow.fail(HandlerError::Failed("upstream unavailable"));
        })),
        "/crash" => Ok(spawn_handler(context, request, |_| {
            panic!("handler task crashed");
        })),
        "/fail" => Err(HandlerError::Failed("simulated failure")),
        _ => Ok(CompletionFlow::completed(DemoResponse::new(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#,
        ))),
    }
}

/// Complete a flow from a spawned task running in the request's propagated
/// context. If the task dies first, the flow fails as abandoned.
fn spawn_handler<F>(
    context: &ServerContext,
    request: &Arc<HttpRequest>,
    complete: F,
) -> CompletionFlow<DemoResponse>
where
    F: FnOnce(&FlowProducer<DemoResponse>) + Send + 'static,
{
    let server_request: Arc<dyn InboundRequest> = Arc::clone(request) as Arc<dyn InboundRequest>;
    let elements = PropagatedContext::current()
        .plus(PropagatedElement::ServerRequest(server_request))
        .elements()
        .to_vec();
    let elements = context.adapter.on_context_install(&elements).unwrap_or(elements);

    let flow = CompletionFlow::new();
    let producer = flow.producer();

    tokio::spawn(
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            complete(&producer);
        }
        .propagated(PropagatedContext::from_elements(elements)),
    );

    flow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::{AgentTracer, NoopReporter};

    fn lifecycle() -> LifecycleManager {
        LifecycleManager::new(Arc::new(AgentTracer::new("test", Arc::new(NoopReporter))))
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let result = Server::bind("not-an-address", lifecycle()).await;
        assert!(matches!(result, Err(ServerError::BindError(_))));
    }

    #[tokio::test]
    async fn test_bind_port_zero() {
        let server = Server::bind("127.0.0.1:0", lifecycle()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_demo_response_status() {
        let response = DemoResponse::new(StatusCode::BAD_GATEWAY, "");
        assert_eq!(response.status_code(), 502);
    }
}
