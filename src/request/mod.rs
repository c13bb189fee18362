//! Inbound request abstraction
//!
//! The engine sees requests only through [`InboundRequest`]: header lookup,
//! a request-scoped attribute store keyed by string, and the handful of
//! fields copied into transaction metadata.

use crate::carrier::HeaderCarrier;
use crate::transaction::Transaction;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Value stored in a request attribute slot
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// A transaction bound to the request
    Transaction(Arc<Transaction>),
    /// Arbitrary text set by other instrumentation
    Text(String),
}

/// Request-lifetime attribute store, get/set by string key.
///
/// Safe to share between instrumentation points racing on the same request.
#[derive(Debug, Default)]
pub struct RequestAttributes {
    inner: DashMap<String, AttributeValue>,
}

impl RequestAttributes {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &str) -> Option<AttributeValue> {
        self.inner.get(key).map(|v| v.value().clone())
    }

    /// Set `key`, replacing any previous value
    pub fn set(&self, key: &str, value: AttributeValue) {
        self.inner.insert(key.to_string(), value);
    }

    /// Remove `key`, returning the previous value
    pub fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Atomically store `value` unless `key` is already set.
    ///
    /// Returns the value that ends up stored and whether this call stored it.
    pub fn insert_if_absent(&self, key: &str, value: AttributeValue) -> (AttributeValue, bool) {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                (value, true)
            }
        }
    }

    /// Atomically store `value` if `key` is unset or its current value
    /// satisfies `replaceable`.
    ///
    /// Returns the value that ends up stored and whether this call stored it.
    pub fn replace_if<P>(&self, key: &str, replaceable: P, value: AttributeValue) -> (AttributeValue, bool)
    where
        P: FnOnce(&AttributeValue) -> bool,
    {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if replaceable(existing.get()) {
                    existing.insert(value.clone());
                    (value, true)
                } else {
                    (existing.get().clone(), false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                (value, true)
            }
        }
    }

    /// Number of attributes set
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no attributes are set
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// What the engine needs from an inbound request
pub trait InboundRequest: Send + Sync {
    /// Header collection used for trace-context extraction
    fn headers(&self) -> &dyn HeaderCarrier;

    /// Request-scoped attribute store
    fn attributes(&self) -> &RequestAttributes;

    /// HTTP method name, e.g. `GET`
    fn method(&self) -> &str;

    /// Path component of the request URI
    fn path(&self) -> &str;

    /// Raw query string without the leading `?`
    fn query(&self) -> Option<&str>;

    /// Protocol version, e.g. `1.1`
    fn http_version(&self) -> &str;

    /// Address of the remote peer
    fn remote_address(&self) -> Option<IpAddr>;

    /// URL scheme, `http` unless the request says otherwise
    fn scheme(&self) -> &str {
        "http"
    }

    /// Host the request was addressed to
    fn host(&self) -> Option<&str>;

    /// Local port the request arrived on
    fn server_port(&self) -> Option<u16>;
}

impl std::fmt::Debug for dyn InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("method", &self.method())
            .field("path", &self.path())
            .finish()
    }
}

/// An [`InboundRequest`] over `http::request::Parts`.
///
/// Built by the server from a hyper request before the body is consumed.
#[derive(Debug)]
pub struct HttpRequest {
    parts: http::request::Parts,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    attributes: RequestAttributes,
}

impl HttpRequest {
    /// Wrap request parts together with the connection addresses
    pub fn new(
        parts: http::request::Parts,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            parts,
            remote_addr,
            local_addr,
            attributes: RequestAttributes::new(),
        }
    }

    /// Split an `http::Request` into an `HttpRequest` and its body
    pub fn from_request<B>(
        request: http::Request<B>,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> (Self, B) {
        let (parts, body) = request.into_parts();
        (Self::new(parts, remote_addr, local_addr), body)
    }

    /// Underlying request parts
    pub fn parts(&self) -> &http::request::Parts {
        &self.parts
    }
}

impl InboundRequest for HttpRequest {
    fn headers(&self) -> &dyn HeaderCarrier {
        &self.parts.headers
    }

    fn attributes(&self) -> &RequestAttributes {
        &self.attributes
    }

    fn method(&self) -> &str {
        self.parts.method.as_str()
    }

    fn path(&self) -> &str {
        self.parts.uri.path()
    }

    fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    fn http_version(&self) -> &str {
        match self.parts.version {
            http::Version::HTTP_09 => "0.9",
            http::Version::HTTP_10 => "1.0",
            http::Version::HTTP_11 => "1.1",
            http::Version::HTTP_2 => "2",
            http::Version::HTTP_3 => "3",
            _ => "unknown",
        }
    }

    fn remote_address(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.ip())
    }

    fn scheme(&self) -> &str {
        self.parts.uri.scheme_str().unwrap_or("http")
    }

    fn host(&self) -> Option<&str> {
        self.parts.uri.host().or_else(|| {
            self.parts
                .headers
                .first_header("host")
                .map(|host| host.split(':').next().unwrap_or(host))
        })
    }

    fn server_port(&self) -> Option<u16> {
        self.local_addr
            .map(|addr| addr.port())
            .or_else(|| self.parts.uri.port_u16())
    }
}

/// A fully in-memory request, for tests, benchmarks and embedding.
///
/// ```
/// use reqtrace::request::{InboundRequest, StaticRequest};
///
/// let request = StaticRequest::new("GET", "/orders/42?x=1")
///     .header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
///
/// assert_eq!(request.path(), "/orders/42");
/// assert_eq!(request.query(), Some("x=1"));
/// ```
#[derive(Debug)]
pub struct StaticRequest {
    method: String,
    path: String,
    query: Option<String>,
    http_version: String,
    headers: Vec<(String, String)>,
    remote_address: Option<IpAddr>,
    host: Option<String>,
    port: Option<u16>,
    attributes: RequestAttributes,
}

impl StaticRequest {
    /// Create a request from a method and a target (`/path?query`)
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        Self {
            method: method.to_string(),
            path,
            query,
            http_version: "1.1".to_string(),
            headers: Vec::new(),
            remote_address: None,
            host: None,
            port: None,
            attributes: RequestAttributes::new(),
        }
    }

    /// Add a header
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the remote peer address
    pub fn remote_address(mut self, addr: IpAddr) -> Self {
        self.remote_address = Some(addr);
        self
    }

    /// Set the host and port the request was addressed to
    pub fn server(mut self, host: &str, port: u16) -> Self {
        self.host = Some(host.to_string());
        self.port = Some(port);
        self
    }

    /// Set the protocol version
    pub fn http_version(mut self, version: &str) -> Self {
        self.http_version = version.to_string();
        self
    }
}

impl InboundRequest for StaticRequest {
    fn headers(&self) -> &dyn HeaderCarrier {
        &self.headers
    }

    fn attributes(&self) -> &RequestAttributes {
        &self.attributes
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn http_version(&self) -> &str {
        &self.http_version
    }

    fn remote_address(&self) -> Option<IpAddr> {
        self.remote_address
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn server_port(&self) -> Option<u16> {
        self.port
    }
}
