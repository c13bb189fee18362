//! reqtrace Library
//!
//! Transaction correlation and lifecycle engine for inbound request tracing.
//!
//! # Features
//!
//! - **Correlation**: at most one transaction per request, bound through the
//!   request's attribute store
//! - **Propagation**: the active transaction follows the request across
//!   spawned tasks and worker threads
//! - **Priority naming**: route-level names beat generic method+path names
//!   regardless of which hook runs first
//! - **Exactly-once finish**: synchronous returns, async completions and
//!   errors all funnel into a single finish that takes effect once
//!
//! # Example
//!
//! ```
//! use reqtrace::correlation;
//! use reqtrace::lifecycle::{finish, LifecycleManager};
//! use reqtrace::request::StaticRequest;
//! use reqtrace::tracer::{AgentTracer, NoopReporter};
//! use std::sync::Arc;
//!
//! let tracer = AgentTracer::new("orders", Arc::new(NoopReporter));
//! let lifecycle = LifecycleManager::new(Arc::new(tracer));
//!
//! let request = StaticRequest::new("GET", "/orders/42?x=1");
//! let transaction = correlation::attach(&request, &lifecycle).unwrap();
//! assert_eq!(transaction.name(), "GET /orders/42");
//!
//! assert!(finish(Some(&transaction), Some(&200u16), None));
//! assert!(!finish(Some(&transaction), Some(&500u16), None));
//! ```

pub mod carrier;
pub mod config;
pub mod correlation;
pub mod flow;
pub mod lifecycle;
pub mod metrics;
pub mod propagation;
pub mod request;
pub mod server;
pub mod telemetry;
pub mod tracer;
pub mod transaction;

// Re-export commonly used types
pub use config::Config;
pub use lifecycle::{finish, LifecycleAdapter, LifecycleManager};
pub use server::Server;
pub use transaction::Transaction;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
