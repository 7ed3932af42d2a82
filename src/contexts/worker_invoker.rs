use std::fmt;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::diagnostics::{DiagnosticDecoder, DiagnosticLine};

/// The three worker stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Scenarios,
    Tests,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Scenarios => "scenarios",
            Stage::Tests => "tests",
        }
    }

    /// Human label used to qualify failure messages.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Extract => "Function extraction",
            Stage::Scenarios => "Scenario generation",
            Stage::Tests => "Test generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program and arguments that start one stage's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommands {
    pub extract: WorkerCommand,
    pub scenarios: WorkerCommand,
    pub tests: WorkerCommand,
}

impl WorkerCommands {
    pub fn for_stage(&self, stage: Stage) -> &WorkerCommand {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Scenarios => &self.scenarios,
            Stage::Tests => &self.tests,
        }
    }
}

/// Errors raised while talking to a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker '{program}' could not be started: {source}")]
    Unavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{message}")]
    Failed {
        stage: Stage,
        message: String,
        exit_code: Option<i32>,
    },

    #[error("invalid response from {stage} worker: {reason}")]
    InvalidResponse { stage: Stage, reason: String },

    #[error("I/O error while talking to {stage} worker: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    #[error("{stage} worker timed out after {}s", .after.as_secs())]
    TimedOut { stage: Stage, after: Duration },

    #[error("{stage} worker was cancelled")]
    Cancelled { stage: Stage },
}

/// Callback invoked with the identifier from each progress notification.
pub type ProgressSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Runs one request/response exchange with a stage worker.
pub trait WorkerInvoker {
    fn run(
        &self,
        stage: Stage,
        request: &Value,
        on_progress: Option<&mut ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Value, WorkerError>> + Send;
}

/// Serializes `request`, runs the stage and decodes the response as `Resp`.
///
/// A response that does not match `Resp` is an `InvalidResponse`.
pub async fn invoke_stage<W, Req, Resp>(
    invoker: &W,
    stage: Stage,
    request: &Req,
    on_progress: Option<&mut ProgressSink<'_>>,
    cancel: &CancellationToken,
) -> Result<Resp, WorkerError>
where
    W: WorkerInvoker,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let request = serde_json::to_value(request).map_err(|e| WorkerError::Io {
        stage,
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;
    let response = invoker.run(stage, &request, on_progress, cancel).await?;
    decode_response(stage, response)
}

pub fn decode_response<T: DeserializeOwned>(stage: Stage, response: Value) -> Result<T, WorkerError> {
    serde_json::from_value(response).map_err(|e| WorkerError::InvalidResponse {
        stage,
        reason: format!("does not match the {} response schema: {}", stage, e),
    })
}

/// Process bridge: one OS process per request.
///
/// The request is written to the worker's stdin, which is then closed. Stdout
/// is collected as a single JSON document; stderr is decoded line by line into
/// progress notifications and error text.
#[derive(Debug, Clone)]
pub struct ExternalWorkerInvoker {
    commands: WorkerCommands,
    timeout: Option<Duration>,
}

enum Outcome {
    Finished(Result<Exchange, WorkerError>),
    Cancelled,
    TimedOut(Duration),
}

struct Exchange {
    status: ExitStatus,
    stdout: Vec<u8>,
    error_text: String,
}

impl ExternalWorkerInvoker {
    pub fn new(commands: WorkerCommands) -> Self {
        Self {
            commands,
            timeout: None,
        }
    }

    /// Kills a worker that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl WorkerInvoker for ExternalWorkerInvoker {
    async fn run(
        &self,
        stage: Stage,
        request: &Value,
        on_progress: Option<&mut ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Value, WorkerError> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled { stage });
        }

        let command = self.commands.for_stage(stage);
        let payload = serde_json::to_vec(request).map_err(|e| WorkerError::Io {
            stage,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Unavailable {
                program: command.program.clone(),
                source,
            })?;
        debug!(%stage, command = %command, pid = ?child.id(), "spawned worker");

        let (stdin, stdout, stderr) = take_pipes(&mut child, stage)?;

        let deadline = self.timeout;
        let expired = async {
            match deadline {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            result = exchange(&mut child, stage, payload, stdin, stdout, stderr, on_progress) => {
                Outcome::Finished(result)
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = expired => Outcome::TimedOut(deadline.unwrap_or_default()),
        };

        let exchange = match outcome {
            Outcome::Finished(result) => result?,
            Outcome::Cancelled => {
                terminate(&mut child, stage).await;
                return Err(WorkerError::Cancelled { stage });
            }
            Outcome::TimedOut(after) => {
                terminate(&mut child, stage).await;
                return Err(WorkerError::TimedOut { stage, after });
            }
        };

        interpret(stage, exchange)
    }
}

fn take_pipes(
    child: &mut Child,
    stage: Stage,
) -> Result<(ChildStdin, ChildStdout, ChildStderr), WorkerError> {
    let missing = |name: &str| WorkerError::Io {
        stage,
        source: io::Error::new(io::ErrorKind::BrokenPipe, format!("worker {} not captured", name)),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

async fn exchange(
    child: &mut Child,
    stage: Stage,
    payload: Vec<u8>,
    mut stdin: ChildStdin,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut on_progress: Option<&mut ProgressSink<'_>>,
) -> Result<Exchange, WorkerError> {
    let write = async move {
        // A worker may exit before reading its input; its exit status decides the outcome.
        match stdin.write_all(&payload).await {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(%stage, "worker closed stdin early");
                return Ok(());
            }
            other => other?,
        }
        match stdin.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
            _ => Ok(()),
        }
    };

    let read_stdout = async move {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).await?;
        Ok::<_, io::Error>(buffer)
    };

    let read_stderr = async {
        let mut decoder = DiagnosticDecoder::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let read = stderr.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            for line in decoder.push(&chunk[..read]) {
                dispatch(stage, line, &mut on_progress);
            }
        }
        if let Some(line) = decoder.finish() {
            dispatch(stage, line, &mut on_progress);
        }
        Ok::<_, io::Error>(decoder.error_text())
    };

    let (written, stdout, error_text) = tokio::join!(write, read_stdout, read_stderr);
    let io_error = |source| WorkerError::Io { stage, source };
    written.map_err(io_error)?;
    let stdout = stdout.map_err(io_error)?;
    let error_text = error_text.map_err(io_error)?;
    let status = child.wait().await.map_err(io_error)?;

    Ok(Exchange {
        status,
        stdout,
        error_text,
    })
}

fn dispatch(stage: Stage, line: DiagnosticLine, on_progress: &mut Option<&mut ProgressSink<'_>>) {
    match line {
        DiagnosticLine::Progress(function) => {
            debug!(%stage, %function, "worker progress");
            if let Some(sink) = on_progress.as_deref_mut() {
                sink(&function);
            }
        }
        DiagnosticLine::Text(text) => debug!(%stage, "worker: {}", text),
    }
}

async fn terminate(child: &mut Child, stage: Stage) {
    if let Err(e) = child.kill().await {
        warn!(%stage, "failed to kill worker: {}", e);
    }
}

fn interpret(stage: Stage, exchange: Exchange) -> Result<Value, WorkerError> {
    let Exchange {
        status,
        stdout,
        error_text,
    } = exchange;

    if !status.success() {
        let message = if !error_text.is_empty() {
            error_text
        } else if let Some(reported) = reported_error(&stdout) {
            reported
        } else {
            match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "worker terminated by signal".to_string(),
            }
        };
        return Err(WorkerError::Failed {
            stage,
            message,
            exit_code: status.code(),
        });
    }

    if !error_text.is_empty() {
        warn!(%stage, "worker succeeded with diagnostics: {}", error_text);
    }

    serde_json::from_slice(&stdout).map_err(|e| WorkerError::InvalidResponse {
        stage,
        reason: format!("output is not valid JSON: {}", e),
    })
}

/// Workers report input errors as `{"error": "..."}` on stdout.
fn reported_error(stdout: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(stdout).ok()?;
    value
        .get("error")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn finished(code: i32, stdout: &str, error_text: &str) -> Exchange {
        Exchange {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            error_text: error_text.to_string(),
        }
    }

    #[test]
    fn test_success_parses_stdout() {
        let value = interpret(Stage::Extract, finished(0, "[]", "")).unwrap();
        assert_eq!(value, serde_json::json!([]));
    }

    #[test]
    fn test_success_with_non_json_is_invalid_response() {
        let err = interpret(Stage::Tests, finished(0, "here are your tests", "")).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidResponse { stage: Stage::Tests, .. }));
    }

    #[test]
    fn test_success_with_empty_output_is_invalid_response() {
        let err = interpret(Stage::Extract, finished(0, "", "")).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidResponse { .. }));
    }

    #[test]
    fn test_failure_prefers_diagnostic_text() {
        let err = interpret(Stage::Scenarios, finished(2, "", "ConnectionError: refused")).unwrap_err();
        match err {
            WorkerError::Failed { message, exit_code, .. } => {
                assert_eq!(message, "ConnectionError: refused");
                assert_eq!(exit_code, Some(2));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_uses_reported_error_then_exit_code() {
        let err = interpret(Stage::Extract, finished(1, r#"{"error": "No files provided"}"#, "")).unwrap_err();
        assert_eq!(err.to_string(), "No files provided");

        let err = interpret(Stage::Extract, finished(3, "", "")).unwrap_err();
        assert_eq!(err.to_string(), "exit code 3");
    }

    #[test]
    fn test_decode_response_schema_mismatch() {
        let err = decode_response::<Vec<String>>(Stage::Extract, serde_json::json!({"error": "x"}))
            .unwrap_err();
        match err {
            WorkerError::InvalidResponse { stage, reason } => {
                assert_eq!(stage, Stage::Extract);
                assert!(reason.contains("extract response schema"));
            }
            other => panic!("expected InvalidResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_worker_command_display() {
        let command = WorkerCommand::new("python3").arg("workers/extract_functions.py");
        assert_eq!(command.to_string(), "python3 workers/extract_functions.py");
    }
}
