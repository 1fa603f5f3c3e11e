//! Per-run trace context injected into every step

use rand::RngCore;

/// Trace identity of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex chars
    pub trace_id: String,
    /// Root span id steps hang their spans under
    pub span_id: String,
    pub run_id: String,
}

impl TraceContext {
    pub fn new(run_id: &str) -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0u8; 16];
        let mut span = [0u8; 8];
        // All-zero ids are invalid in W3C trace context
        while trace.iter().all(|b| *b == 0) {
            rng.fill_bytes(&mut trace);
        }
        while span.iter().all(|b| *b == 0) {
            rng.fill_bytes(&mut span);
        }

        Self {
            trace_id: hex::encode(trace),
            span_id: hex::encode(span),
            run_id: run_id.to_string(),
        }
    }

    /// W3C `traceparent` header value, sampled
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Variables handed to every step of the run
    pub fn env(&self, test_name: &str) -> Vec<(String, String)> {
        vec![
            ("CLNRM_TRACE_ID".to_string(), self.trace_id.clone()),
            ("CLNRM_RUN_ID".to_string(), self.run_id.clone()),
            ("TRACEPARENT".to_string(), self.traceparent()),
            (
                "OTEL_RESOURCE_ATTRIBUTES".to_string(),
                format!("clnrm.run_id={},clnrm.test={}", self.run_id, test_name.replace(',', "_")),
            ),
        ]
    }
}
