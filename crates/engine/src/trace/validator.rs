//! Trace assertion evaluation and sink polling

use clnrm_common::{
    AssertionOutcome, AttributePredicate, Cardinality, Error, PredicateOp, Result, TraceAssertion,
    TraceFailure,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::sink::TraceSink;
use super::span::{value_string, Span, SpanSet};
use crate::config::TraceConfig;

/// Does a span name match a pattern where `*` matches any run of characters
pub fn name_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*' (or was only '*')
    true
}

/// First unmet attribute condition of a span, if any
fn attribute_problem(assertion: &TraceAssertion, span: &Span) -> Option<String> {
    for (key, expected) in &assertion.attributes {
        match span.attribute_string(key) {
            Some(actual) if &actual == expected => {}
            Some(actual) => return Some(format!("{}={} (expected {})", key, actual, expected)),
            None => return Some(format!("{} missing", key)),
        }
    }
    assertion
        .predicates
        .iter()
        .find(|p| !predicate_holds(p, span))
        .map(|p| match span.attributes.get(&p.key) {
            Some(actual) => format!("{} failed ({}={})", p, p.key, value_string(actual)),
            None => format!("{} failed ({} missing)", p, p.key),
        })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn predicate_holds(predicate: &AttributePredicate, span: &Span) -> bool {
    let Some(actual) = span.attributes.get(&predicate.key) else {
        return false;
    };
    if predicate.op == PredicateOp::Exists {
        return true;
    }
    let Some(expected) = &predicate.value else {
        return false;
    };

    let ordering = match (as_number(actual), as_number(expected)) {
        (Some(a), Some(e)) => a.partial_cmp(&e),
        _ => None,
    };

    match predicate.op {
        PredicateOp::Eq => match ordering {
            Some(ord) => ord.is_eq(),
            None => value_string(actual) == value_string(expected),
        },
        PredicateOp::Ne => match ordering {
            Some(ord) => !ord.is_eq(),
            None => value_string(actual) != value_string(expected),
        },
        PredicateOp::Lt => ordering.map(|o| o.is_lt()).unwrap_or(false),
        PredicateOp::Lte => ordering.map(|o| o.is_le()).unwrap_or(false),
        PredicateOp::Gt => ordering.map(|o| o.is_gt()).unwrap_or(false),
        PredicateOp::Gte => ordering.map(|o| o.is_ge()).unwrap_or(false),
        PredicateOp::Matches => expected
            .as_str()
            .and_then(|p| regex::Regex::new(p).ok())
            .map(|re| re.is_match(&value_string(actual)))
            .unwrap_or(false),
        PredicateOp::Exists => true,
    }
}

/// Evaluate one assertion against a run's spans
///
/// Spans are narrowed by name, then attributes, then parent; the first stage
/// that leaves nothing names the failure. A declared count is checked
/// against the spans surviving every stage.
pub fn evaluate(assertion: &TraceAssertion, spans: &SpanSet) -> std::result::Result<(), TraceFailure> {
    let pattern = assertion.name.clone();

    let named: Vec<&Span> = spans.iter().filter(|s| name_matches(&assertion.name, &s.name)).collect();
    let attributed: Vec<&Span> = named
        .iter()
        .copied()
        .filter(|s| attribute_problem(assertion, s).is_none())
        .collect();
    let related: Vec<&Span> = match &assertion.parent {
        Some(parent) => attributed
            .iter()
            .copied()
            .filter(|s| {
                spans
                    .parent_of(s)
                    .map(|p| name_matches(parent, &p.name))
                    .unwrap_or(false)
            })
            .collect(),
        None => attributed.clone(),
    };

    let count = assertion.count.unwrap_or(Cardinality::AtLeast(1));
    if count.admits(related.len()) {
        return Ok(());
    }

    if named.is_empty() {
        return Err(TraceFailure::SpanNotFound { pattern });
    }
    if attributed.is_empty() {
        let detail = named
            .first()
            .and_then(|s| attribute_problem(assertion, s))
            .unwrap_or_default();
        return Err(TraceFailure::AttributeMismatch { pattern, detail });
    }
    if related.is_empty() {
        if let Some(parent) = &assertion.parent {
            return Err(TraceFailure::RelationshipMismatch {
                pattern,
                parent: parent.clone(),
            });
        }
    }
    Err(TraceFailure::CardinalityMismatch {
        pattern,
        expected: count.to_string(),
        actual: related.len(),
    })
}

/// Assertion plus the step it belongs to
#[derive(Debug, Clone)]
pub struct ScopedAssertion {
    pub step: Option<String>,
    pub assertion: TraceAssertion,
}

/// Spans collected for a run and the verdict on each assertion
#[derive(Debug, Clone)]
pub struct TraceCollection {
    pub spans: SpanSet,
    pub outcomes: Vec<AssertionOutcome>,
    pub polls: u32,
}

impl TraceCollection {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed())
    }

    /// First failing assertion
    pub fn first_failure(&self) -> Option<&TraceFailure> {
        self.outcomes.iter().find_map(|o| o.failure.as_ref())
    }
}

fn evaluate_all(assertions: &[ScopedAssertion], spans: &SpanSet) -> Vec<AssertionOutcome> {
    assertions
        .iter()
        .map(|scoped| AssertionOutcome {
            step: scoped.step.clone(),
            description: scoped.assertion.describe(),
            failure: evaluate(&scoped.assertion, spans).err(),
        })
        .collect()
}

/// Polls a sink until assertions hold or the window closes
pub struct TraceValidator {
    sink: Option<Arc<dyn TraceSink>>,
    poll_timeout: Duration,
    poll_interval: Duration,
}

impl TraceValidator {
    pub fn new(sink: Option<Arc<dyn TraceSink>>, config: &TraceConfig) -> Self {
        Self {
            sink,
            poll_timeout: config.poll_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn sink(&self) -> Option<&Arc<dyn TraceSink>> {
        self.sink.as_ref()
    }

    /// Where collected spans can be read again
    pub fn source(&self) -> Option<String> {
        self.sink.as_ref().map(|s| s.describe())
    }

    /// Check the sink is reachable; without one there is nothing to check
    pub async fn probe(&self) -> Result<()> {
        match &self.sink {
            Some(sink) => sink.probe().await,
            None => Ok(()),
        }
    }

    /// Gather the run's spans and evaluate every assertion
    ///
    /// `harvested` holds spans already taken from step output. Exporters
    /// flush asynchronously, so the sink is polled until every assertion
    /// passes or the poll timeout elapses. A window that closes with no span
    /// at all for the trace turns each failure into `PollTimeout`.
    pub async fn collect(
        &self,
        trace_id: &str,
        harvested: &SpanSet,
        assertions: &[ScopedAssertion],
        cancel: &CancellationToken,
    ) -> Result<TraceCollection> {
        self.collect_within(trace_id, harvested, assertions, cancel, self.poll_timeout)
            .await
    }

    /// Single fetch and evaluation, no waiting for late spans
    pub async fn snapshot(
        &self,
        trace_id: &str,
        harvested: &SpanSet,
        assertions: &[ScopedAssertion],
        cancel: &CancellationToken,
    ) -> Result<TraceCollection> {
        self.collect_within(trace_id, harvested, assertions, cancel, Duration::ZERO)
            .await
    }

    async fn collect_within(
        &self,
        trace_id: &str,
        harvested: &SpanSet,
        assertions: &[ScopedAssertion],
        cancel: &CancellationToken,
        window: Duration,
    ) -> Result<TraceCollection> {
        let start = Instant::now();
        let mut spans = harvested.for_trace(trace_id);
        let mut polls = 0u32;

        loop {
            if let Some(sink) = &self.sink {
                polls += 1;
                let fetched = sink.fetch(trace_id).await?;
                debug!(
                    trace_id = %trace_id,
                    "Poll {} fetched {} span(s) from {}",
                    polls,
                    fetched.len(),
                    sink.describe()
                );
                spans.extend(fetched);
            }

            let outcomes = evaluate_all(assertions, &spans);
            let passed = outcomes.iter().all(|o| o.passed());
            let elapsed = start.elapsed();

            // Without a sink nothing more can arrive
            if passed || self.sink.is_none() || elapsed >= window {
                let outcomes = if spans.is_empty() && !passed {
                    timed_out(outcomes, assertions, elapsed)
                } else {
                    outcomes
                };
                info!(
                    trace_id = %trace_id,
                    "Collected {} span(s), {}/{} assertion(s) passed",
                    spans.len(),
                    outcomes.iter().filter(|o| o.passed()).count(),
                    outcomes.len()
                );
                return Ok(TraceCollection {
                    spans,
                    outcomes,
                    polls,
                });
            }

            let sleep_for = self.poll_interval.min(window - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

fn timed_out(
    outcomes: Vec<AssertionOutcome>,
    assertions: &[ScopedAssertion],
    waited: Duration,
) -> Vec<AssertionOutcome> {
    outcomes
        .into_iter()
        .zip(assertions)
        .map(|(mut outcome, scoped)| {
            if outcome.failure.is_some() {
                outcome.failure = Some(TraceFailure::PollTimeout {
                    pattern: scoped.assertion.name.clone(),
                    waited,
                });
            }
            outcome
        })
        .collect()
}
