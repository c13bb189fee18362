//! Header Carrier Adapter
//!
//! Exposes "first value for a textual key" over arbitrary inbound header
//! collections, and extracts W3C Trace Context from any such collection.
//!
//! # W3C Trace Context
//!
//! - **traceparent**: `00-{trace-id}-{parent-id}-{trace-flags}`
//!   - Example: `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//! - **tracestate**: optional vendor list, `vendor1=value1,vendor2=value2`
//!
//! A missing or malformed `traceparent` is never an error: extraction yields
//! `None` and the caller starts a fresh root trace.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use reqtrace::carrier::{extract_header_context, HeaderCarrier};
//!
//! let mut headers = HashMap::new();
//! headers.insert(
//!     "traceparent".to_string(),
//!     "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
//! );
//!
//! assert_eq!(headers.first_header("TraceParent").map(|v| v.len()), Some(55));
//!
//! let context = extract_header_context(&headers).unwrap();
//! assert_eq!(context.trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
//! assert!(context.is_sampled());
//! ```

use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{SpanId, TraceContextExt, TraceFlags, TraceId};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;

/// W3C `traceparent` header name
pub const TRACEPARENT: &str = "traceparent";

/// W3C `tracestate` header name
pub const TRACESTATE: &str = "tracestate";

/// Read-only view over an inbound header collection.
///
/// Lookups are case-insensitive and return the first value only. A missing
/// header is `None`, never a panic.
pub trait HeaderCarrier {
    /// First value for `name`, if present and valid text
    fn first_header(&self, name: &str) -> Option<&str>;

    /// Names of all headers present
    fn header_names(&self) -> Vec<&str>;
}

impl HeaderCarrier for http::HeaderMap {
    fn first_header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn header_names(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect()
    }
}

impl HeaderCarrier for HashMap<String, String> {
    fn first_header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_names(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect()
    }
}

impl HeaderCarrier for Vec<(String, String)> {
    fn first_header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_names(&self) -> Vec<&str> {
        self.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// Bridges a [`HeaderCarrier`] to the OpenTelemetry propagator API
struct CarrierExtractor<'a>(&'a dyn HeaderCarrier);

impl Extractor for CarrierExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.first_header(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.header_names()
    }
}

/// Distributed trace context extracted from inbound headers
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderContext {
    /// Trace the inbound request belongs to
    pub trace_id: TraceId,
    /// Span id of the remote caller
    pub parent_span_id: SpanId,
    /// Trace flags (bit 0 = sampled)
    pub trace_flags: TraceFlags,
    /// Raw `tracestate` value, if any
    pub tracestate: Option<String>,
}

impl HeaderContext {
    /// Whether the remote caller sampled this trace
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// Format as a `traceparent` header value
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.parent_span_id,
            self.trace_flags.to_u8()
        )
    }
}

/// Extract W3C Trace Context from a header carrier.
///
/// Returns `None` when `traceparent` is missing, malformed, or carries
/// all-zero identifiers.
pub fn extract_header_context(carrier: &dyn HeaderCarrier) -> Option<HeaderContext> {
    let propagator = TraceContextPropagator::new();
    let context = propagator.extract(&CarrierExtractor(carrier));
    let span = context.span();
    let span_context = span.span_context();

    if !span_context.is_valid() {
        return None;
    }

    let tracestate = span_context.trace_state().header();

    Some(HeaderContext {
        trace_id: span_context.trace_id(),
        parent_span_id: span_context.span_id(),
        trace_flags: span_context.trace_flags(),
        tracestate: if tracestate.is_empty() {
            None
        } else {
            Some(tracestate)
        },
    })
}
