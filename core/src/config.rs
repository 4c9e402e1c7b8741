use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::rlimit::ResourceLimits;
use crate::session::OutputLine;

/// Default cap on the byte length of submitted code.
pub const DEFAULT_MAX_CODE_LENGTH: usize = 100_000;

/// Total-message cap used when `max_tool_calls` is not set. When it is set,
/// the cap is `10 * max_tool_calls` instead. Counted per execution.
pub const DEFAULT_TOTAL_MESSAGE_CAP: u64 = 1_000;

/// Hook consulted before every execution. Returning `false` blocks the
/// execution with [`crate::error::SecurerErr::ExecutionBlocked`].
pub type PreExecuteHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Callback invoked for every child output line drained by the event loop.
pub type OutputHandler = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// How to invoke the interpreter child.
///
/// The interpreter is a black box: the supervisor only needs a program, its
/// fixed arguments, and the flag that makes it evaluate the runtime snippet
/// passed as the following argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub eval_flag: String,
}

impl Default for ChildCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("R"),
            args: vec!["--no-echo".to_string(), "--no-save".to_string()],
            eval_flag: "-e".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Use the platform sandbox when one is available; otherwise warn and
    /// run unsandboxed (or fail when `sandbox_strict` is set).
    Auto,

    /// Never sandbox. A limits-only wrapper is still generated when resource
    /// caps are configured.
    Disabled,
}

/// Per-session configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub child: ChildCommand,
    pub sandbox: SandboxMode,

    /// Fail `start` with `SandboxUnavailable` instead of falling back to an
    /// unsandboxed child when no real sandbox can be assembled.
    pub sandbox_strict: bool,

    pub limits: ResourceLimits,

    /// Append-only audit log path. `None` disables auditing.
    pub audit_log: Option<PathBuf>,

    /// Base directory for the rendezvous directory. Defaults to a short
    /// system location so the socket path stays under the `sun_path` limit.
    pub temp_base: Option<PathBuf>,

    /// Replacement for the built-in child runtime snippet. Tests substitute
    /// a stand-in runner that speaks the same wire protocol.
    pub runtime_template: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            child: ChildCommand::default(),
            sandbox: SandboxMode::Auto,
            sandbox_strict: false,
            limits: ResourceLimits::default(),
            audit_log: None,
            temp_base: None,
            runtime_template: None,
        }
    }
}

/// Per-execution policy. Session-level defaults can be overridden per call
/// via [`crate::session::Supervisor::execute_with`].
#[derive(Clone)]
pub struct ExecPolicy {
    pub max_code_length: usize,
    pub max_tool_calls: Option<u64>,
    pub max_output_lines: Option<usize>,
    pub max_executions: Option<u64>,
    pub timeout: Option<Duration>,

    /// Run the parse pre-check before dispatching code.
    pub validate: bool,

    /// Pass errors returned to the caller through the sanitizer. Tool errors
    /// returned to the child are always sanitized regardless of this flag.
    pub sanitize_errors: bool,

    pub pre_execute_hook: Option<PreExecuteHook>,
    pub output_handler: Option<OutputHandler>,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            max_code_length: DEFAULT_MAX_CODE_LENGTH,
            max_tool_calls: None,
            max_output_lines: None,
            max_executions: None,
            timeout: None,
            validate: true,
            sanitize_errors: true,
            pre_execute_hook: None,
            output_handler: None,
        }
    }
}

impl ExecPolicy {
    /// Total frames the child may send within one execution.
    pub fn total_message_cap(&self) -> u64 {
        match self.max_tool_calls {
            Some(calls) => calls.saturating_mul(10),
            None => DEFAULT_TOTAL_MESSAGE_CAP,
        }
    }
}

impl fmt::Debug for ExecPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPolicy")
            .field("max_code_length", &self.max_code_length)
            .field("max_tool_calls", &self.max_tool_calls)
            .field("max_output_lines", &self.max_output_lines)
            .field("max_executions", &self.max_executions)
            .field("timeout", &self.timeout)
            .field("validate", &self.validate)
            .field("sanitize_errors", &self.sanitize_errors)
            .field("pre_execute_hook", &self.pre_execute_hook.is_some())
            .field("output_handler", &self.output_handler.is_some())
            .finish()
    }
}
