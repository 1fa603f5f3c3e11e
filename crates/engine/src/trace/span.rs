//! Span model and the JSON shapes spans arrive in

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One recorded operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Lowercase hex
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl Span {
    pub fn new(trace_id: &str, span_id: &str, name: &str) -> Self {
        Self {
            trace_id: normalize_id(trace_id),
            span_id: normalize_id(span_id),
            parent_span_id: None,
            name: name.to_string(),
            attributes: BTreeMap::new(),
            service_name: None,
        }
    }

    pub fn with_parent(mut self, parent_span_id: &str) -> Self {
        self.parent_span_id = Some(normalize_id(parent_span_id));
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Attribute rendered as a plain string (`"1"` for both `1` and `"1"`)
    pub fn attribute_string(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(value_string)
    }

    /// Parse a single span object in any of the supported shapes
    ///
    /// Accepts flat objects (`traceId`/`trace_id`, `spanId`, `parentSpanId`,
    /// `name`, `attributes` as a map or an OTLP key/value list) and the OTel
    /// stdout exporter form (`Name`, `SpanContext.TraceID`, `Parent.SpanID`,
    /// `Attributes`).
    pub fn from_json(value: &Value) -> Option<Self> {
        if let Some(ctx) = value.get("SpanContext") {
            return Self::from_stdout_exporter(value, ctx);
        }

        let trace_id = str_field(value, &["traceId", "trace_id", "traceID"])?;
        let span_id = str_field(value, &["spanId", "span_id", "spanID"])?;
        let name = str_field(value, &["name", "operationName"])?;

        let parent = str_field(value, &["parentSpanId", "parent_span_id", "parentId", "parent_id"])
            .filter(|p| !p.is_empty() && p.chars().any(|c| c != '0'));

        Some(Self {
            trace_id: normalize_id(trace_id),
            span_id: normalize_id(span_id),
            parent_span_id: parent.map(normalize_id),
            name: name.to_string(),
            attributes: value.get("attributes").map(parse_attributes).unwrap_or_default(),
            service_name: str_field(value, &["service_name", "serviceName"]).map(String::from),
        })
    }

    fn from_stdout_exporter(value: &Value, ctx: &Value) -> Option<Self> {
        let name = value.get("Name")?.as_str()?;
        let trace_id = ctx.get("TraceID")?.as_str()?;
        let span_id = ctx.get("SpanID")?.as_str()?;
        let parent = value
            .get("Parent")
            .and_then(|p| p.get("SpanID"))
            .and_then(Value::as_str)
            .filter(|p| p.chars().any(|c| c != '0'));

        let mut attributes = BTreeMap::new();
        if let Some(list) = value.get("Attributes").and_then(Value::as_array) {
            for attr in list {
                if let (Some(key), Some(val)) = (
                    attr.get("Key").and_then(Value::as_str),
                    attr.get("Value").and_then(|v| v.get("Value")),
                ) {
                    attributes.insert(key.to_string(), val.clone());
                }
            }
        }

        Some(Self {
            trace_id: normalize_id(trace_id),
            span_id: normalize_id(span_id),
            parent_span_id: parent.map(normalize_id),
            name: name.to_string(),
            attributes,
            service_name: None,
        })
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

pub(crate) fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

pub(crate) fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Attributes as a JSON map or an OTLP `[{key, value: {stringValue: ..}}]` list
fn parse_attributes(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(list) => list
            .iter()
            .filter_map(|kv| {
                let key = kv.get("key")?.as_str()?;
                let value = kv.get("value").map(any_value)?;
                Some((key.to_string(), value))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Unwrap an OTLP AnyValue
fn any_value(value: &Value) -> Value {
    if let Some(s) = value.get("stringValue") {
        return s.clone();
    }
    if let Some(i) = value.get("intValue") {
        // OTLP JSON encodes int64 as a string
        return match i {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| i.clone()),
            other => other.clone(),
        };
    }
    if let Some(d) = value.get("doubleValue") {
        return d.clone();
    }
    if let Some(b) = value.get("boolValue") {
        return b.clone();
    }
    value.clone()
}

/// Spans from an OTLP JSON document (`resourceSpans` at the top)
pub fn parse_otlp(document: &Value) -> Vec<Span> {
    let mut spans = Vec::new();
    let Some(resource_spans) = document.get("resourceSpans").and_then(Value::as_array) else {
        return spans;
    };

    for rs in resource_spans {
        let service_name = rs
            .get("resource")
            .and_then(|r| r.get("attributes"))
            .map(parse_attributes)
            .and_then(|attrs| attrs.get("service.name").map(value_string));

        let scopes = rs
            .get("scopeSpans")
            .or_else(|| rs.get("instrumentationLibrarySpans"))
            .and_then(Value::as_array);
        for scope in scopes.into_iter().flatten() {
            for raw in scope.get("spans").and_then(Value::as_array).into_iter().flatten() {
                if let Some(mut span) = Span::from_json(raw) {
                    span.service_name = service_name.clone();
                    spans.push(span);
                }
            }
        }
    }
    spans
}

/// Spans from a Jaeger query API response (`{"data": [{"spans": [..]}]}`)
pub fn parse_jaeger(response: &Value) -> Vec<Span> {
    let mut spans = Vec::new();
    for trace in response.get("data").and_then(Value::as_array).into_iter().flatten() {
        let processes = trace.get("processes");
        for raw in trace.get("spans").and_then(Value::as_array).into_iter().flatten() {
            let (Some(trace_id), Some(span_id), Some(name)) = (
                raw.get("traceID").and_then(Value::as_str),
                raw.get("spanID").and_then(Value::as_str),
                raw.get("operationName").and_then(Value::as_str),
            ) else {
                continue;
            };

            let mut span = Span::new(trace_id, span_id, name);
            span.parent_span_id = raw
                .get("references")
                .and_then(Value::as_array)
                .and_then(|refs| {
                    refs.iter().find(|r| {
                        r.get("refType").and_then(Value::as_str) == Some("CHILD_OF")
                    })
                })
                .and_then(|r| r.get("spanID"))
                .and_then(Value::as_str)
                .map(normalize_id);

            for tag in raw.get("tags").and_then(Value::as_array).into_iter().flatten() {
                if let (Some(key), Some(value)) =
                    (tag.get("key").and_then(Value::as_str), tag.get("value"))
                {
                    span.attributes.insert(key.to_string(), value.clone());
                }
            }

            span.service_name = raw
                .get("processID")
                .and_then(Value::as_str)
                .and_then(|pid| processes.and_then(|p| p.get(pid)))
                .and_then(|p| p.get("serviceName"))
                .and_then(Value::as_str)
                .map(String::from);

            spans.push(span);
        }
    }
    spans
}

/// Spans from JSON-lines text; non-JSON lines are ignored
pub fn parse_json_lines(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("resourceSpans").is_some() {
            spans.extend(parse_otlp(&value));
        } else if let Some(span) = Span::from_json(&value) {
            spans.push(span);
        }
    }
    spans
}

/// Deduplicated set of spans
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpanSet {
    spans: Vec<Span>,
    #[serde(skip)]
    seen: HashSet<(String, String)>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a span unless one with the same trace and span id is present
    pub fn insert(&mut self, span: Span) -> bool {
        let key = (span.trace_id.clone(), span.span_id.clone());
        if self.seen.insert(key) {
            self.spans.push(span);
            true
        } else {
            false
        }
    }

    pub fn extend(&mut self, spans: impl IntoIterator<Item = Span>) {
        for span in spans {
            self.insert(span);
        }
    }

    /// Spans belonging to one trace
    pub fn for_trace(&self, trace_id: &str) -> SpanSet {
        let trace_id = normalize_id(trace_id);
        let mut set = SpanSet::new();
        set.extend(self.spans.iter().filter(|s| s.trace_id == trace_id).cloned());
        set
    }

    pub fn get(&self, span_id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    pub fn parent_of(&self, span: &Span) -> Option<&Span> {
        span.parent_span_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn into_vec(self) -> Vec<Span> {
        self.spans
    }
}

impl FromIterator<Span> for SpanSet {
    fn from_iter<I: IntoIterator<Item = Span>>(iter: I) -> Self {
        let mut set = SpanSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

    #[test]
    fn test_flat_span_with_map_attributes() {
        let span = Span::from_json(&json!({
            "traceId": TRACE.to_uppercase(),
            "spanId": "00f067aa0ba902b7",
            "parentSpanId": "",
            "name": "db.query",
            "attributes": {"rows": 1, "db.system": "postgresql"}
        }))
        .unwrap();

        assert_eq!(span.trace_id, TRACE);
        assert!(span.parent_span_id.is_none());
        assert_eq!(span.attribute_string("rows").as_deref(), Some("1"));
    }

    #[test]
    fn test_otlp_document() {
        let doc = json!({
            "resourceSpans": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "api"}}]},
                "scopeSpans": [{
                    "spans": [
                        {"traceId": TRACE, "spanId": "a1", "name": "http.request", "attributes": []},
                        {"traceId": TRACE, "spanId": "b2", "parentSpanId": "a1", "name": "db.query",
                         "attributes": [{"key": "rows", "value": {"intValue": "1"}}]}
                    ]
                }]
            }]
        });

        let spans = parse_otlp(&doc);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].parent_span_id.as_deref(), Some("a1"));
        assert_eq!(spans[1].attributes.get("rows"), Some(&json!(1)));
        assert_eq!(spans[0].service_name.as_deref(), Some("api"));
    }

    #[test]
    fn test_stdout_exporter_form() {
        let line = json!({
            "Name": "db.query",
            "SpanContext": {"TraceID": TRACE, "SpanID": "b2"},
            "Parent": {"TraceID": TRACE, "SpanID": "0000000000000000"},
            "Attributes": [{"Key": "rows", "Value": {"Type": "INT64", "Value": 1}}]
        })
        .to_string();

        let spans = parse_json_lines(&format!("INSERT 0 1\n{}\n(1 row)\n", line));
        assert_eq!(spans.len(), 1);
        assert!(spans[0].parent_span_id.is_none());
        assert_eq!(spans[0].attribute_string("rows").as_deref(), Some("1"));
    }

    #[test]
    fn test_jaeger_response() {
        let response = json!({
            "data": [{
                "traceID": TRACE,
                "spans": [
                    {"traceID": TRACE, "spanID": "a1", "operationName": "parent", "references": [], "tags": [], "processID": "p1"},
                    {"traceID": TRACE, "spanID": "b2", "operationName": "child",
                     "references": [{"refType": "CHILD_OF", "traceID": TRACE, "spanID": "a1"}],
                     "tags": [{"key": "rows", "type": "int64", "value": 1}], "processID": "p1"}
                ],
                "processes": {"p1": {"serviceName": "db"}}
            }]
        });

        let spans = parse_jaeger(&response);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].parent_span_id.as_deref(), Some("a1"));
        assert_eq!(spans[1].service_name.as_deref(), Some("db"));
    }

    #[test]
    fn test_span_set_dedup_and_filter() {
        let mut set = SpanSet::new();
        assert!(set.insert(Span::new(TRACE, "a1", "x")));
        assert!(!set.insert(Span::new(TRACE, "A1", "x")));
        set.insert(Span::new("ffff", "a1", "other"));

        assert_eq!(set.len(), 2);
        let run = set.for_trace(TRACE);
        assert_eq!(run.len(), 1);
        assert_eq!(run.iter().next().map(|s| s.name.as_str()), Some("x"));
    }
}
