//! The supervisor: owns one interpreter child, its authenticated IPC
//! channel, the sandbox artifacts, and the audit logger; drives the
//! per-execution event loop; self-heals after timeouts and child crashes.

use std::fmt;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::time::Duration;
use std::time::Instant;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use securer_protocol::ChildFrame;
use securer_protocol::ExecResult;
use securer_protocol::HostFrame;
use securer_protocol::ToolReply;
use securer_protocol::is_valid_identifier;

use crate::audit::AuditEventKind;
use crate::audit::AuditLogger;
use crate::audit::truncate_field;
use crate::config::ExecPolicy;
use crate::config::SessionConfig;
use crate::env::build_child_env;
use crate::error::Result;
use crate::error::SecurerErr;
use crate::injection;
use crate::ipc::HANDSHAKE_TIMEOUT;
use crate::ipc::IpcChannel;
use crate::ipc::IpcListener;
use crate::ipc::Rendezvous;
use crate::ipc::generate_token;
use crate::job_object::JobHandle;
use crate::registry::ToolRegistry;
use crate::sandbox;
use crate::sandbox::SandboxConfig;
use crate::sanitize::sanitize;
use crate::spawn::StdioPolicy;
use crate::spawn::spawn_child;
use crate::validator;

/// Capacity of the line channel between the pipe readers and the event loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Grace period for pulling trailing output once a result frame arrives.
const FINAL_DRAIN: Duration = Duration::from_millis(25);

/// Cap on the result summary recorded in `tool_result` events.
const RESULT_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Starting,
    Ready,
    Executing,
    TimedOut,
    Restarting,
    Failed,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::TimedOut => "timed_out",
            SessionState::Restarting => "restarting",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn label(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One line of child output, labeled by origin. Interleaving across the two
/// streams is arrival order, best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Successful execution: the child's result value plus the captured output.
#[derive(Debug)]
pub struct ExecOutput {
    pub value: Value,
    pub output: Vec<OutputLine>,
    pub duration: Duration,
}

/// Everything created by one `start_session` run. Dropping it kills the
/// child (`kill_on_drop`) and unlinks the rendezvous directory, wrapper
/// script, and profile (`TempDir`/`TempPath` ownership).
struct SessionRuntime {
    child: Child,
    channel: IpcChannel,
    #[allow(dead_code)] // held for unlink-on-drop
    rendezvous: Rendezvous,
    #[allow(dead_code)] // held for unlink-on-drop and the job handle
    sandbox: SandboxConfig,
    #[allow(dead_code)] // keeps kernel limits alive for the child's lifetime
    job_handle: Option<JobHandle>,
    output_rx: mpsc::Receiver<OutputLine>,
    output_open: bool,
    pid: u32,
}

pub struct Supervisor {
    config: SessionConfig,
    registry: ToolRegistry,
    policy: ExecPolicy,
    audit: AuditLogger,
    session_id: String,
    state: SessionState,
    executions_used: u64,
    runtime: Option<SessionRuntime>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("executions_used", &self.executions_used)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Starts a session: rendezvous, sandbox assembly, child spawn,
    /// handshake, tool wrapper injection. On any failure every created
    /// resource is released before the error is returned.
    pub async fn start(
        config: SessionConfig,
        registry: ToolRegistry,
        policy: ExecPolicy,
    ) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let audit = match &config.audit_log {
            Some(path) => AuditLogger::open(path, &session_id)?,
            None => AuditLogger::disabled(&session_id),
        };
        let mut supervisor = Self {
            config,
            registry,
            policy,
            audit,
            session_id,
            state: SessionState::Init,
            executions_used: 0,
            runtime: None,
        };
        supervisor.start_runtime().await?;
        Ok(supervisor)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn executions_used(&self) -> u64 {
        self.executions_used
    }

    /// True while a live child is attached.
    pub fn is_alive(&mut self) -> bool {
        if !matches!(self.state, SessionState::Ready | SessionState::Executing) {
            return false;
        }
        match self.runtime.as_mut() {
            Some(runtime) => matches!(runtime.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Executes `code` under the session's default policy.
    pub async fn execute(&mut self, code: &str) -> Result<ExecOutput> {
        let policy = self.policy.clone();
        self.execute_with(code, &policy).await
    }

    /// Executes `code` under an explicit per-call policy.
    pub async fn execute_with(&mut self, code: &str, policy: &ExecPolicy) -> Result<ExecOutput> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Executing => return Err(SecurerErr::ConcurrentExecution),
            state => return Err(SecurerErr::SessionNotRunning(state.name().to_string())),
        }

        if let Some(cap) = policy.max_executions {
            if self.executions_used >= cap {
                return Err(SecurerErr::ExecutionCapReached(self.executions_used));
            }
        }
        if code.len() > policy.max_code_length {
            return Err(SecurerErr::CodeTooLong(code.len(), policy.max_code_length));
        }
        if let Some(hook) = &policy.pre_execute_hook {
            if !hook(code) {
                return Err(SecurerErr::ExecutionBlocked);
            }
        }
        if policy.validate {
            let validation = validator::validate(code);
            if let Some(parse_error) = validation.error {
                return Err(SecurerErr::Syntax(parse_error));
            }
            for warning in validation.warnings {
                warn!(%warning, "advisory pattern warning");
            }
        }

        self.executions_used += 1;
        self.state = SessionState::Executing;
        self.audit.emit(
            AuditEventKind::ExecuteStart,
            fields(json!({ "code": truncate_field(code) })),
        );

        let Some(mut runtime) = self.runtime.take() else {
            self.state = SessionState::Failed;
            self.audit.emit(
                AuditEventKind::ExecuteError,
                fields(json!({ "error": "no interpreter attached" })),
            );
            return Err(SecurerErr::SessionNotRunning("failed".to_string()));
        };

        // Lines printed after the previous execution completed belong to no
        // one; drop them so they cannot leak into this execution's output.
        while let Ok(stale) = runtime.output_rx.try_recv() {
            debug!(stream = stale.stream.label(), "discarding stale output line");
        }

        let started = Instant::now();
        if let Err(err) = runtime
            .channel
            .write_frame(&HostFrame::Execute {
                code: code.to_string(),
            })
            .await
        {
            return Err(self.recover_after_failure(runtime, err).await);
        }

        self.run_event_loop(runtime, policy, started).await
    }

    async fn run_event_loop(
        &mut self,
        mut runtime: SessionRuntime,
        policy: &ExecPolicy,
        started: Instant,
    ) -> Result<ExecOutput> {
        enum LoopEvent {
            Deadline,
            Output(Option<OutputLine>),
            Frame(Result<ChildFrame>),
            ChildExit(std::io::Result<std::process::ExitStatus>),
        }

        let deadline = policy.timeout.map(|t| TokioInstant::now() + t);
        let far_future = TokioInstant::now() + Duration::from_secs(86_400);
        let message_cap = policy.total_message_cap();

        let mut output_lines: Vec<OutputLine> = Vec::new();
        let mut dropped_lines: u64 = 0;
        let mut tool_calls_used: u64 = 0;
        let mut total_messages: u64 = 0;

        loop {
            let event = {
                let SessionRuntime {
                    child,
                    channel,
                    output_rx,
                    output_open,
                    ..
                } = &mut runtime;
                tokio::select! {
                    biased;
                    _ = sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => {
                        LoopEvent::Deadline
                    }
                    line = output_rx.recv(), if *output_open => LoopEvent::Output(line),
                    frame = channel.read_frame() => LoopEvent::Frame(frame),
                    status = child.wait() => LoopEvent::ChildExit(status),
                }
            };

            match event {
                LoopEvent::Deadline => {
                    let timeout = policy.timeout.unwrap_or_default();
                    return Err(self.handle_timeout(runtime, timeout).await);
                }
                LoopEvent::Output(Some(line)) => {
                    handle_output_line(policy, &mut output_lines, &mut dropped_lines, line);
                }
                LoopEvent::Output(None) => {
                    runtime.output_open = false;
                }
                LoopEvent::Frame(Err(err)) => {
                    return Err(self.recover_after_failure(runtime, err).await);
                }
                LoopEvent::Frame(Ok(frame)) => {
                    total_messages += 1;
                    if total_messages > message_cap {
                        let err = SecurerErr::IpcFlood(message_cap);
                        return Err(self.recover_after_failure(runtime, err).await);
                    }
                    match frame {
                        ChildFrame::ToolCall { tool, args } => {
                            tool_calls_used += 1;
                            if let Some(cap) = policy.max_tool_calls {
                                if tool_calls_used > cap {
                                    let err = SecurerErr::ToolCallsExceeded(cap);
                                    return Err(self.recover_after_failure(runtime, err).await);
                                }
                            }
                            let reply = self.dispatch_tool_call(&tool, args.as_ref());
                            if let Err(err) = runtime.channel.write_frame(&reply).await {
                                return Err(self.recover_after_failure(runtime, err).await);
                            }
                        }
                        ChildFrame::Result(ExecResult::Value(value)) => {
                            drain_trailing_output(
                                policy,
                                &mut runtime,
                                &mut output_lines,
                                &mut dropped_lines,
                            )
                            .await;
                            let duration = started.elapsed();
                            self.audit.emit(
                                AuditEventKind::ExecuteComplete,
                                fields(json!({ "elapsed_ms": duration.as_millis() as u64 })),
                            );
                            if dropped_lines > 0 {
                                debug!(dropped_lines, "output lines over the cap were discarded");
                            }
                            self.runtime = Some(runtime);
                            self.state = SessionState::Ready;
                            return Ok(ExecOutput {
                                value,
                                output: output_lines,
                                duration,
                            });
                        }
                        ChildFrame::Result(ExecResult::Error(message)) => {
                            drain_trailing_output(
                                policy,
                                &mut runtime,
                                &mut output_lines,
                                &mut dropped_lines,
                            )
                            .await;
                            self.audit.emit(
                                AuditEventKind::ExecuteError,
                                fields(json!({ "error": truncate_field(&message) })),
                            );
                            let message = if policy.sanitize_errors {
                                sanitize(&message)
                            } else {
                                message
                            };
                            self.runtime = Some(runtime);
                            self.state = SessionState::Ready;
                            return Err(SecurerErr::ExecutionFailed(message));
                        }
                        ChildFrame::Unknown { kind } => {
                            warn!(kind = kind.as_str(), "ignoring frame with unhandled type");
                        }
                    }
                }
                LoopEvent::ChildExit(status) => {
                    let detail = match status {
                        Ok(status) => {
                            format!("interpreter exited during execution ({status})")
                        }
                        Err(err) => format!("interpreter wait failed: {err}"),
                    };
                    let err = SecurerErr::ExecutionFailed(detail);
                    return Err(self.recover_after_failure(runtime, err).await);
                }
            }
        }
    }

    /// Resolves and invokes one tool call, producing exactly one reply.
    /// Misses (unknown tool, unexpected arguments) are in-band errors the
    /// child raises from; only the accepted calls are audited.
    fn dispatch_tool_call(&self, tool: &str, args: Option<&Map<String, Value>>) -> ToolReply {
        if !is_valid_identifier(tool) {
            return ToolReply::Error {
                error: SecurerErr::UnknownTool(tool.to_string()).to_string(),
            };
        }
        let Some(def) = self.registry.get(tool) else {
            return ToolReply::Error {
                error: SecurerErr::UnknownTool(tool.to_string()).to_string(),
            };
        };

        if let Some(expected) = def.expected_params() {
            if let Some(args_map) = args {
                let unexpected: Vec<String> = args_map
                    .keys()
                    .filter(|key| !expected.iter().any(|name| name == *key))
                    .map(|key| format!("'{key}'"))
                    .collect();
                if !unexpected.is_empty() {
                    return ToolReply::Error {
                        error: SecurerErr::UnexpectedArguments {
                            tool: tool.to_string(),
                            args: unexpected.join(", "),
                        }
                        .to_string(),
                    };
                }
            }
        }

        self.audit.emit(
            AuditEventKind::ToolCall,
            fields(json!({
                "tool": tool,
                "args": args.cloned().map(Value::Object).unwrap_or(Value::Null),
            })),
        );

        let empty = Map::new();
        let args_ref = args.unwrap_or(&empty);
        let implementation = def.implementation().clone();
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| implementation(args_ref)));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                self.audit.emit(
                    AuditEventKind::ToolResult,
                    fields(json!({
                        "tool": tool,
                        "error": Value::Null,
                        "result_summary": summarize_value(&value),
                        "elapsed_ms": elapsed_ms,
                    })),
                );
                ToolReply::Value { value }
            }
            Ok(Err(message)) => {
                let sanitized = sanitize(&message);
                self.audit.emit(
                    AuditEventKind::ToolResult,
                    fields(json!({
                        "tool": tool,
                        "error": sanitized,
                        "elapsed_ms": elapsed_ms,
                    })),
                );
                ToolReply::Error { error: sanitized }
            }
            Err(_panic) => {
                let message = format!("tool '{tool}' implementation panicked");
                self.audit.emit(
                    AuditEventKind::ToolResult,
                    fields(json!({
                        "tool": tool,
                        "error": message,
                        "elapsed_ms": elapsed_ms,
                    })),
                );
                ToolReply::Error { error: message }
            }
        }
    }

    /// Wall-clock deadline fired: kill the child, release every per-run
    /// resource, and bring a fresh child up so the session is READY again.
    async fn handle_timeout(&mut self, runtime: SessionRuntime, timeout: Duration) -> SecurerErr {
        self.state = SessionState::TimedOut;
        self.audit.emit(
            AuditEventKind::ExecuteTimeout,
            fields(json!({ "timeout_ms": timeout.as_millis() as u64 })),
        );
        self.kill_runtime(runtime).await;
        if let Err(err) = self.start_runtime().await {
            warn!("session restart after timeout failed: {err}");
        }
        SecurerErr::Timeout(timeout)
    }

    /// Channel-fatal errors and child crashes: the wire protocol is out of
    /// sync (or the child is gone), so the only way back to READY is a fresh
    /// child.
    async fn recover_after_failure(
        &mut self,
        runtime: SessionRuntime,
        err: SecurerErr,
    ) -> SecurerErr {
        self.audit.emit(
            AuditEventKind::ExecuteError,
            fields(json!({ "error": err.to_string() })),
        );
        self.kill_runtime(runtime).await;
        if let Err(restart_err) = self.start_runtime().await {
            warn!("session restart after execution failure failed: {restart_err}");
        }
        err
    }

    async fn kill_runtime(&mut self, mut runtime: SessionRuntime) {
        let _ = runtime.child.start_kill();
        let _ = runtime.child.wait().await;
        // Dropping the runtime unlinks the socket directory, wrapper script,
        // profile, and sandbox temp directory, and releases the job handle.
        drop(runtime);
    }

    /// Explicit restart: refused while an execution is in flight. Resets the
    /// execution counter; the session comes back as fresh as a new start.
    pub async fn restart(&mut self) -> Result<()> {
        match self.state {
            SessionState::Executing => return Err(SecurerErr::ConcurrentExecution),
            SessionState::Closed => {
                return Err(SecurerErr::SessionNotRunning("closed".to_string()));
            }
            _ => {}
        }
        self.audit.emit(AuditEventKind::SessionRestart, Map::new());
        self.state = SessionState::Restarting;
        if let Some(runtime) = self.runtime.take() {
            self.kill_runtime(runtime).await;
        }
        self.executions_used = 0;
        self.start_runtime().await
    }

    /// Releases everything and marks the session CLOSED. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.audit.emit(AuditEventKind::SessionClose, Map::new());
        if let Some(runtime) = self.runtime.take() {
            self.kill_runtime(runtime).await;
        }
        self.state = SessionState::Closed;
    }

    async fn start_runtime(&mut self) -> Result<()> {
        self.state = SessionState::Starting;
        match self.try_start_runtime().await {
            Ok(runtime) => {
                self.audit.emit(
                    AuditEventKind::SessionStart,
                    fields(json!({
                        "sandbox": runtime.sandbox.kind().label(),
                        "pid": runtime.pid,
                    })),
                );
                info!(
                    session_id = self.session_id.as_str(),
                    pid = runtime.pid,
                    sandbox = runtime.sandbox.kind().label(),
                    "session started"
                );
                self.runtime = Some(runtime);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    async fn try_start_runtime(&self) -> Result<SessionRuntime> {
        let rendezvous = Rendezvous::create(self.config.temp_base.as_deref())?;
        let socket_path = rendezvous.socket_path();
        let token = generate_token();
        let listener = IpcListener::bind(&socket_path)?;

        let sandbox = sandbox::assemble(&self.config, rendezvous.dir_path())?;

        let empty_overrides = std::collections::HashMap::new();
        let overrides = sandbox.env_overrides().unwrap_or(&empty_overrides);
        let env = build_child_env(&socket_path, &token, overrides);

        let snippet = injection::runtime_snippet(&self.config);
        let args = injection::build_child_args(&self.config.child, snippet);
        let program = sandbox.launch_program(&self.config.child);
        let mut child = spawn_child(&program, &args, &env, StdioPolicy::RedirectForCapture)?;
        let pid = child.id().unwrap_or_default();

        let (line_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputStream::Stderr, line_tx);
        }

        let job_handle = sandbox.apply_post_spawn(pid)?;

        let channel = match listener.accept_and_auth(&token).await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
        };

        let mut runtime = SessionRuntime {
            child,
            channel,
            rendezvous,
            sandbox,
            job_handle,
            output_rx,
            output_open: true,
            pid,
        };

        if !self.registry.is_empty() {
            let wrappers = self.registry.wrapper_snippet();
            if let Err(err) = inject_snippet(&mut runtime.channel, &wrappers).await {
                let _ = runtime.child.start_kill();
                let _ = runtime.child.wait().await;
                return Err(err);
            }
        }

        Ok(runtime)
    }
}

/// Evaluates a snippet in the child's global scope and waits for the
/// acknowledgement, bounded by the handshake ceiling.
async fn inject_snippet(channel: &mut IpcChannel, snippet: &str) -> Result<()> {
    channel
        .write_frame(&HostFrame::Inject {
            code: snippet.to_string(),
        })
        .await?;
    let deadline = TokioInstant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let frame = tokio::time::timeout_at(deadline, channel.read_frame())
            .await
            .map_err(|_| {
                SecurerErr::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "child did not acknowledge tool wrapper injection",
                ))
            })??;
        match frame {
            ChildFrame::Result(ExecResult::Value(_)) => return Ok(()),
            ChildFrame::Result(ExecResult::Error(message)) => {
                return Err(SecurerErr::ExecutionFailed(format!(
                    "tool wrapper injection failed: {message}"
                )));
            }
            ChildFrame::ToolCall { tool, .. } => {
                return Err(SecurerErr::IpcSchemaViolation(format!(
                    "unexpected tool_call '{tool}' during injection"
                )));
            }
            ChildFrame::Unknown { kind } => {
                warn!(kind = kind.as_str(), "ignoring frame during injection");
            }
        }
    }
}

fn spawn_line_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(stream = stream.label(), "output reader stopped: {err}");
                    break;
                }
            }
        }
    });
}

fn handle_output_line(
    policy: &ExecPolicy,
    output_lines: &mut Vec<OutputLine>,
    dropped_lines: &mut u64,
    line: OutputLine,
) {
    if let Some(handler) = &policy.output_handler {
        // A panicking handler must not corrupt the event loop.
        if catch_unwind(AssertUnwindSafe(|| handler(&line))).is_err() {
            warn!("output handler panicked; continuing");
        }
    }
    match policy.max_output_lines {
        Some(cap) if output_lines.len() >= cap => *dropped_lines += 1,
        _ => output_lines.push(line),
    }
}

/// Pulls trailing output for a short grace period so lines flushed just
/// before the result frame are not lost.
async fn drain_trailing_output(
    policy: &ExecPolicy,
    runtime: &mut SessionRuntime,
    output_lines: &mut Vec<OutputLine>,
    dropped_lines: &mut u64,
) {
    if !runtime.output_open {
        return;
    }
    let grace = TokioInstant::now() + FINAL_DRAIN;
    loop {
        match tokio::time::timeout_at(grace, runtime.output_rx.recv()).await {
            Ok(Some(line)) => handle_output_line(policy, output_lines, dropped_lines, line),
            Ok(None) => {
                runtime.output_open = false;
                break;
            }
            Err(_) => break,
        }
    }
}

fn summarize_value(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() <= RESULT_SUMMARY_CHARS {
        return rendered;
    }
    let mut summary: String = rendered.chars().take(RESULT_SUMMARY_CHARS - 1).collect();
    summary.push('…');
    summary
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
