//! Transaction sampling
//!
//! Decides whether a transaction is created at all:
//! - Rules: first matching path/method rule wins and applies its own rate
//! - `always` / `never`: fixed decisions
//! - `ratio`: deterministic on the trace id, so every service in a trace
//!   agrees on the same decision
//! - `parent_based`: honour the sampled flag of an inbound `traceparent`,
//!   fall back to `ratio` for root requests

use crate::carrier::HeaderContext;
use crate::config::{SamplingConfig, SamplingRuleConfig};
use opentelemetry::trace::TraceId;

/// Sampling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    /// Create and record the transaction
    Sample,
    /// Create nothing
    Drop,
}

/// Sampling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Always,
    Never,
    Ratio,
    ParentBased,
}

impl SamplingStrategy {
    /// Parse a strategy name from configuration
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "always" => Some(SamplingStrategy::Always),
            "never" => Some(SamplingStrategy::Never),
            "ratio" => Some(SamplingStrategy::Ratio),
            "parent_based" => Some(SamplingStrategy::ParentBased),
            _ => None,
        }
    }
}

/// Path/method pattern.
///
/// A pattern ending in `/*` matches that prefix; anything else matches
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern(String);

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.to_string())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.0.strip_suffix("/*") {
            Some(prefix) => path == prefix || path.starts_with(&format!("{}/", prefix)),
            None => path == self.0,
        }
    }
}

/// Sampling rule
#[derive(Debug, Clone)]
pub struct SamplingRule {
    path_pattern: Option<PathPattern>,
    method: Option<String>,
    sample_rate: f64,
}

impl SamplingRule {
    /// Create a rule that matches everything at rate 1.0
    pub fn new() -> Self {
        Self {
            path_pattern: None,
            method: None,
            sample_rate: 1.0,
        }
    }

    /// Set path pattern for this rule
    pub fn with_path_pattern(mut self, pattern: &str) -> Self {
        self.path_pattern = Some(PathPattern::new(pattern));
        self
    }

    /// Set HTTP method for this rule
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    /// Set sample rate for this rule
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Check if the rule applies to a request
    pub fn matches(&self, method: &str, path: &str) -> bool {
        let path_ok = self
            .path_pattern
            .as_ref()
            .map_or(true, |pattern| pattern.matches(path));
        let method_ok = self
            .method
            .as_ref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method));
        path_ok && method_ok
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

impl Default for SamplingRule {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&SamplingRuleConfig> for SamplingRule {
    fn from(config: &SamplingRuleConfig) -> Self {
        let mut rule = SamplingRule::new().with_sample_rate(config.sample_rate);
        if let Some(ref pattern) = config.path_pattern {
            rule = rule.with_path_pattern(pattern);
        }
        if let Some(ref method) = config.method {
            rule = rule.with_method(method);
        }
        rule
    }
}

/// Sampler consulted by the tracing runtime for every transaction start
#[derive(Debug, Clone)]
pub struct TransactionSampler {
    strategy: SamplingStrategy,
    ratio: f64,
    rules: Vec<SamplingRule>,
}

impl TransactionSampler {
    /// Create a sampler with a strategy and a base ratio
    pub fn new(strategy: SamplingStrategy, ratio: f64) -> Self {
        Self {
            strategy,
            ratio,
            rules: Vec::new(),
        }
    }

    /// Sample everything
    pub fn always() -> Self {
        Self::new(SamplingStrategy::Always, 1.0)
    }

    /// Build from validated configuration. Unknown strategies sample everything.
    pub fn from_config(config: &SamplingConfig) -> Self {
        let strategy = SamplingStrategy::parse(&config.strategy).unwrap_or(SamplingStrategy::Always);
        let mut sampler = Self::new(strategy, config.ratio);
        for rule in &config.rules {
            sampler.add_rule(SamplingRule::from(rule));
        }
        sampler
    }

    /// Add a sampling rule
    pub fn add_rule(&mut self, rule: SamplingRule) {
        self.rules.push(rule);
    }

    /// Decide for a request about to start a transaction
    pub fn should_sample(
        &self,
        parent: Option<&HeaderContext>,
        method: &str,
        path: &str,
        trace_id: TraceId,
    ) -> SamplingDecision {
        // Check rules in order (first match wins)
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(method, path)) {
            return ratio_decision(rule.sample_rate(), trace_id);
        }

        match self.strategy {
            SamplingStrategy::Always => SamplingDecision::Sample,
            SamplingStrategy::Never => SamplingDecision::Drop,
            SamplingStrategy::Ratio => ratio_decision(self.ratio, trace_id),
            SamplingStrategy::ParentBased => match parent {
                Some(parent) if parent.is_sampled() => SamplingDecision::Sample,
                Some(_) => SamplingDecision::Drop,
                None => ratio_decision(self.ratio, trace_id),
            },
        }
    }
}

impl Default for TransactionSampler {
    fn default() -> Self {
        Self::always()
    }
}

fn ratio_decision(rate: f64, trace_id: TraceId) -> SamplingDecision {
    if rate >= 1.0 {
        return SamplingDecision::Sample;
    }
    if rate <= 0.0 {
        return SamplingDecision::Drop;
    }

    // Lower 64 bits of the trace id are uniformly random
    let bytes = trace_id.to_bytes();
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[8..]);
    let value = u64::from_be_bytes(low);

    let threshold = (rate * u64::MAX as f64) as u64;
    if value <= threshold {
        SamplingDecision::Sample
    } else {
        SamplingDecision::Drop
    }
}
