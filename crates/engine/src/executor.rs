//! Step executor
//!
//! Runs one step's command on the host or inside a service, streams its
//! output through bounded channels into ring buffers, enforces the timeout
//! and evaluates the step's exit and output expectations.

use clnrm_common::{Step, StepFailure, StepResult, StepStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::lifecycle::ServiceGroup;

const READ_CHUNK: usize = 8 * 1024;

/// Fixed-capacity byte ring keeping the most recent output
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(READ_CHUNK * 4)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.dropped += (self.data.len() + chunk.len() - self.capacity) as u64;
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes discarded to stay within capacity
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn to_string_lossy(&self) -> String {
        let (a, b) = self.data.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Everything a step needs from its run
pub struct StepContext<'a> {
    pub services: &'a ServiceGroup,
    /// Trace context and service connection variables
    pub env: Vec<(String, String)>,
    /// Run-wide deadline; the step's timeout is cut short to honor it
    pub deadline: Option<Instant>,
    pub cancel: &'a CancellationToken,
}

enum Ending {
    Exited(Option<i32>),
    TimedOut(Duration),
    Cancelled,
}

pub struct StepExecutor {
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Effective timeout for a step given the run deadline
    pub fn timeout_for(&self, step: &Step, deadline: Option<Instant>) -> Duration {
        let timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        match deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }

    /// Run one step to completion
    ///
    /// Interrupted by cancellation, the step is recorded as skipped with
    /// whatever output it produced.
    pub async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> StepResult {
        let start = Instant::now();
        let timeout = self.timeout_for(step, ctx.deadline);
        info!(step = %step.name, "Running step (timeout {:?})", timeout);

        let mut env = ctx.env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut cmd = match self.build_command(step, ctx.services, &env) {
            Ok(cmd) => cmd,
            Err(reason) => return spawn_failed(step, reason, start),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failed(step, format!("{}: {}", step.command[0], e), start),
        };

        let stdout = Arc::new(Mutex::new(OutputBuffer::new(self.config.output_buffer_bytes)));
        let stderr = Arc::new(Mutex::new(OutputBuffer::new(self.config.output_buffer_bytes)));
        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, stdout.clone(), self.config.channel_capacity));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, stderr.clone(), self.config.channel_capacity));
        }

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status.ok().and_then(|s| s.code())),
            _ = tokio::time::sleep(timeout) => Ending::TimedOut(timeout),
            _ = ctx.cancel.cancelled() => Ending::Cancelled,
        };

        if !matches!(ending, Ending::Exited(_)) {
            terminate(&mut child, self.config.kill_grace).await;
        }

        // Grandchildren may hold the pipes open; do not wait on them forever
        for handle in pumps {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.kill_grace.max(Duration::from_millis(100)), handle)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        let (stdout, stdout_dropped) = {
            let buf = stdout.lock();
            (buf.to_string_lossy(), buf.dropped())
        };
        let (stderr, stderr_dropped) = {
            let buf = stderr.lock();
            (buf.to_string_lossy(), buf.dropped())
        };

        let (exit_code, status) = match ending {
            Ending::Exited(code) => (code, evaluate(step, code, &stdout, &stderr)),
            Ending::TimedOut(after) => (None, StepStatus::Failed(StepFailure::Timeout { after })),
            Ending::Cancelled => (None, StepStatus::Skipped),
        };

        let result = StepResult {
            name: step.name.clone(),
            exit_code,
            stdout,
            stderr,
            dropped_bytes: stdout_dropped + stderr_dropped,
            duration_ms: start.elapsed().as_millis() as u64,
            status,
        };

        match &result.status {
            StepStatus::Passed => info!(step = %step.name, "Step passed ({} ms)", result.duration_ms),
            StepStatus::Failed(failure) => warn!(step = %step.name, "Step failed: {}", failure),
            StepStatus::Skipped => debug!(step = %step.name, "Step interrupted"),
        }
        result
    }

    fn build_command(
        &self,
        step: &Step,
        services: &ServiceGroup,
        env: &[(String, String)],
    ) -> Result<Command, String> {
        if step.command.is_empty() {
            return Err("empty command".to_string());
        }

        if let Some(service) = &step.service {
            if services.get(service).is_none() {
                return Err(format!("service '{}' is not running", service));
            }
            let argv = match &step.workdir {
                Some(dir) => with_workdir(dir, &step.command),
                None => step.command.clone(),
            };
            if let Some(cmd) = services.exec_command(service, &argv, env) {
                return Ok(cmd);
            }
        }

        let mut cmd = Command::new(&step.command[0]);
        cmd.args(&step.command[1..]);
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &step.workdir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

/// Wrap argv so it runs from `dir` inside a container shell
fn with_workdir(dir: &str, argv: &[String]) -> Vec<String> {
    let mut wrapped = vec![
        "sh".to_string(),
        "-c".to_string(),
        "cd \"$0\" && exec \"$@\"".to_string(),
        dir.to_string(),
    ];
    wrapped.extend(argv.iter().cloned());
    wrapped
}

/// Exit expectation first, then the output pattern
fn evaluate(step: &Step, exit_code: Option<i32>, stdout: &str, stderr: &str) -> StepStatus {
    if !step.expect.matches(exit_code) {
        return StepStatus::Failed(StepFailure::NonZeroExit {
            expected: step.expect.to_string(),
            actual: exit_code,
        });
    }

    if let Some(pattern) = &step.expected_output_regex {
        let matched = regex::Regex::new(pattern)
            .map(|re| re.is_match(stdout) || re.is_match(stderr))
            .unwrap_or(false);
        if !matched {
            return StepStatus::Failed(StepFailure::OutputMismatch {
                pattern: pattern.clone(),
            });
        }
    }

    StepStatus::Passed
}

fn spawn_failed(step: &Step, reason: String, start: Instant) -> StepResult {
    warn!(step = %step.name, "Failed to spawn: {}", reason);
    StepResult {
        name: step.name.clone(),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        dropped_bytes: 0,
        duration_ms: start.elapsed().as_millis() as u64,
        status: StepStatus::Failed(StepFailure::SpawnFailed { reason }),
    }
}

/// Copy a pipe into a ring buffer through a bounded channel
///
/// The reader blocks when the channel is full, which in turn stalls the
/// child on a full pipe instead of growing memory.
fn pump<R>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>, capacity: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity);

    let producer = tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            buffer.lock().push(&bytes);
        }
        let _ = producer.await;
    })
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            if killpg(pgid, Signal::SIGTERM).is_ok()
                && tokio::time::timeout(grace, child.wait()).await.is_ok()
            {
                return;
            }
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    // Force kill if still running
    let _ = child.kill().await;
}
