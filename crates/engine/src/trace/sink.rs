//! Trace sinks: where spans are read back from after a run

use async_trait::async_trait;
use clnrm_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::span::{normalize_id, parse_jaeger, parse_json_lines, Span};
use crate::config::{SinkKind, TraceConfig};

#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Human-readable location, stored in run records
    fn describe(&self) -> String;

    /// Check the sink is reachable before a run starts
    async fn probe(&self) -> Result<()>;

    /// Every span currently known for a trace
    async fn fetch(&self, trace_id: &str) -> Result<Vec<Span>>;
}

/// Build the sink a config asks for; None when only stdout spans are used
pub fn from_config(config: &TraceConfig) -> Result<Option<Arc<dyn TraceSink>>> {
    match config.sink {
        SinkKind::Stdout => Ok(None),
        SinkKind::File => {
            let path = config
                .file
                .clone()
                .ok_or_else(|| Error::validation("trace.file", "file sink requires a path"))?;
            Ok(Some(Arc::new(FileTraceSink::new(path))))
        }
        SinkKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| Error::validation("trace.endpoint", "http sink requires an endpoint"))?;
            Ok(Some(Arc::new(HttpTraceSink::new(&endpoint, config.query_timeout)?)))
        }
    }
}

/// Collector file-exporter output (JSON lines)
///
/// The exporter only appends, so each fetch parses the bytes added since the
/// previous one and serves the trace from spans already indexed.
pub struct FileTraceSink {
    path: PathBuf,
    cursor: tokio::sync::Mutex<FileCursor>,
}

#[derive(Default)]
struct FileCursor {
    offset: u64,
    by_trace: HashMap<String, Vec<Span>>,
}

impl FileTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: tokio::sync::Mutex::new(FileCursor::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_error(&self, e: std::io::Error) -> Error {
        Error::infrastructure(format!("reading {}: {}", self.path.display(), e))
    }
}

/// Length of the prefix made of whole lines
///
/// An unterminated last line counts once it parses on its own; until then the
/// exporter is still writing it.
fn complete_prefix(bytes: &[u8]) -> usize {
    let cut = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let tail = &bytes[cut..];
    if !tail.is_empty() && serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        bytes.len()
    } else {
        cut
    }
}

#[async_trait]
impl TraceSink for FileTraceSink {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn probe(&self) -> Result<()> {
        // The exporter creates the file on first flush; its directory must exist
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if tokio::fs::metadata(dir).await.is_err() {
            return Err(Error::infrastructure(format!(
                "trace export directory {} does not exist",
                dir.display()
            )));
        }
        Ok(())
    }

    async fn fetch(&self, trace_id: &str) -> Result<Vec<Span>> {
        let mut cursor = self.cursor.lock().await;
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *cursor = FileCursor::default();
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.read_error(e)),
        };

        let len = file.metadata().await.map_err(|e| self.read_error(e))?.len();
        if len < cursor.offset {
            debug!("{} was truncated, indexing from the start", self.path.display());
            *cursor = FileCursor::default();
        }

        if len > cursor.offset {
            file.seek(SeekFrom::Start(cursor.offset))
                .await
                .map_err(|e| self.read_error(e))?;
            let mut fresh = Vec::with_capacity((len - cursor.offset) as usize);
            file.take(len - cursor.offset)
                .read_to_end(&mut fresh)
                .await
                .map_err(|e| self.read_error(e))?;

            let consumed = complete_prefix(&fresh);
            for span in parse_json_lines(&String::from_utf8_lossy(&fresh[..consumed])) {
                cursor.by_trace.entry(span.trace_id.clone()).or_default().push(span);
            }
            cursor.offset += consumed as u64;
        }

        Ok(cursor
            .by_trace
            .get(&normalize_id(trace_id))
            .cloned()
            .unwrap_or_default())
    }
}

/// Jaeger-style query API
pub struct HttpTraceSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTraceSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::infrastructure(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    async fn probe(&self) -> Result<()> {
        let url = format!("{}/api/services", self.endpoint);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::infrastructure(format!("trace sink {} unreachable: {}", self.endpoint, e)))?;
        if !resp.status().is_success() {
            return Err(Error::infrastructure(format!(
                "trace sink {} returned {}",
                self.endpoint,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn fetch(&self, trace_id: &str) -> Result<Vec<Span>> {
        let url = format!("{}/api/traces/{}", self.endpoint, trace_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::infrastructure(format!("trace query failed: {}", e)))?;

        // Not flushed yet
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Trace {} not found yet", trace_id);
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Error::infrastructure(format!(
                "trace query returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::infrastructure(format!("trace query body: {}", e)))?;
        Ok(parse_jaeger(&body))
    }
}

/// In-process sink, fed directly by tests or embedders
#[derive(Default)]
pub struct MemoryTraceSink {
    spans: Mutex<Vec<Span>>,
    unreachable: AtomicBool,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, span: Span) {
        self.spans.lock().push(span);
    }

    pub fn extend(&self, spans: impl IntoIterator<Item = Span>) {
        self.spans.lock().extend(spans);
    }

    /// Make probe and fetch fail as if the backend were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(Error::infrastructure("memory trace sink marked unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn probe(&self) -> Result<()> {
        self.check()
    }

    async fn fetch(&self, trace_id: &str) -> Result<Vec<Span>> {
        self.check()?;
        let trace_id = normalize_id(trace_id);
        Ok(self
            .spans
            .lock()
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_sink_reads_matching_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.jsonl");
        let sink = FileTraceSink::new(&path);

        sink.probe().await.unwrap();
        assert!(sink.fetch("aa").await.unwrap().is_empty());

        let lines = [
            json!({"traceId": "aa", "spanId": "1", "name": "one"}).to_string(),
            json!({"resourceSpans": [{"scopeSpans": [{"spans": [
                {"traceId": "AA", "spanId": "2", "parentSpanId": "1", "name": "two"},
                {"traceId": "bb", "spanId": "3", "name": "other"}
            ]}]}]})
            .to_string(),
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let spans = sink.fetch("aa").await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].parent_span_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_file_sink_indexes_only_appended_bytes() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.jsonl");
        let sink = FileTraceSink::new(&path);
        let mut file = std::fs::File::create(&path).unwrap();

        let first = format!("{}\n", json!({"traceId": "aa", "spanId": "1", "name": "one"}));
        file.write_all(first.as_bytes()).unwrap();
        assert_eq!(sink.fetch("aa").await.unwrap().len(), 1);
        assert_eq!(sink.cursor.lock().await.offset, first.len() as u64);

        // Half a line is left for the next fetch
        let second = json!({"traceId": "aa", "spanId": "2", "parentSpanId": "1", "name": "two"}).to_string();
        let (head, tail) = second.split_at(second.len() / 2);
        file.write_all(head.as_bytes()).unwrap();
        assert_eq!(sink.fetch("aa").await.unwrap().len(), 1);
        assert_eq!(sink.cursor.lock().await.offset, first.len() as u64);

        file.write_all(format!("{}\n", tail).as_bytes()).unwrap();
        file.write_all(json!({"traceId": "bb", "spanId": "3", "name": "other"}).to_string().as_bytes())
            .unwrap();
        let spans = sink.fetch("aa").await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].parent_span_id.as_deref(), Some("1"));
        assert_eq!(sink.fetch("bb").await.unwrap().len(), 1);
        assert_eq!(
            sink.cursor.lock().await.offset,
            std::fs::metadata(&path).unwrap().len()
        );

        // A truncated file is indexed again from the start
        std::fs::write(&path, format!("{}\n", json!({"traceId": "cc", "spanId": "9", "name": "new"})))
            .unwrap();
        assert_eq!(sink.fetch("cc").await.unwrap().len(), 1);
        assert!(sink.fetch("aa").await.unwrap().is_empty());
    }

    #[test]
    fn test_complete_prefix() {
        assert_eq!(complete_prefix(b""), 0);
        assert_eq!(complete_prefix(b"{\"a\":1}\n{\"b\""), 8);
        assert_eq!(complete_prefix(b"{\"a\":1}\n{\"b\":2}"), 15);
    }

    #[tokio::test]
    async fn test_http_sink_honours_query_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = TraceConfig {
            sink: SinkKind::Http,
            endpoint: Some(format!("http://{}", addr)),
            query_timeout: Duration::from_millis(200),
            ..TraceConfig::default()
        };
        let sink = from_config(&config).unwrap().unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(3), sink.fetch("aa")).await;
        assert!(matches!(outcome, Ok(Err(Error::Infrastructure(_)))));
    }

    #[tokio::test]
    async fn test_file_sink_missing_directory() {
        let sink = FileTraceSink::new("/nonexistent/clnrm/traces.jsonl");
        assert!(matches!(sink.probe().await, Err(Error::Infrastructure(_))));
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryTraceSink::new();
        sink.push(Span::new("aa", "1", "x"));
        sink.push(Span::new("bb", "2", "y"));
        assert_eq!(sink.fetch("aa").await.unwrap().len(), 1);

        sink.set_unreachable(true);
        assert!(sink.probe().await.is_err());
    }

    #[test]
    fn test_from_config() {
        let config = TraceConfig::default();
        assert!(from_config(&config).unwrap().is_none());

        let config = TraceConfig {
            sink: SinkKind::Http,
            endpoint: Some("http://127.0.0.1:16686/".into()),
            ..TraceConfig::default()
        };
        let sink = from_config(&config).unwrap().unwrap();
        assert_eq!(sink.describe(), "http://127.0.0.1:16686");
    }
}
