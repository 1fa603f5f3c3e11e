//! Trace collection and validation
//!
//! Each run gets its own trace id, handed to steps through `TRACEPARENT` and
//! `CLNRM_TRACE_ID`. After the steps finish, spans are gathered from the
//! configured sink and from step stdout, then checked against the
//! definition's trace assertions.

mod context;
mod sink;
mod span;
mod validator;

pub use context::TraceContext;
pub use sink::{from_config as sink_from_config, FileTraceSink, HttpTraceSink, MemoryTraceSink, TraceSink};
pub use span::{parse_jaeger, parse_json_lines, parse_otlp, Span, SpanSet};
pub use validator::{evaluate, name_matches, ScopedAssertion, TraceCollection, TraceValidator};
