use std::io;
use std::time::Duration;

use securer_protocol::FrameError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SecurerErr>;

#[derive(Error, Debug)]
pub enum SecurerErr {
    /// Strict sandboxing was requested but no real sandbox could be built.
    #[error("sandbox unavailable: no usable sandbox backend on this host")]
    SandboxUnavailable,

    /// The first line received on the rendezvous socket did not match the
    /// session token.
    #[error("IPC authentication failed")]
    IpcAuthFailed,

    /// A frame exceeded the per-frame byte cap; rejected before parsing.
    #[error("IPC frame of {0} bytes exceeds the frame size limit")]
    IpcFrameTooLarge(usize),

    /// A frame parsed but violated the wire schema.
    #[error("IPC schema violation: {0}")]
    IpcSchemaViolation(String),

    /// The child sent more frames in one execution than the total-message
    /// cap allows.
    #[error("IPC flood: more than {0} messages in one execution")]
    IpcFlood(u64),

    /// The submitted code failed the parse pre-check.
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("code is {0} bytes, exceeding the {1} byte limit")]
    CodeTooLong(usize, usize),

    #[error("execution cap reached after {0} executions")]
    ExecutionCapReached(u64),

    #[error("execution blocked by pre-execute hook")]
    ExecutionBlocked,

    #[error("tool call limit of {0} exceeded")]
    ToolCallsExceeded(u64),

    /// The wall-clock deadline fired. The session has already been restarted
    /// and is READY again when this is returned.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The child reported an error result, or died mid-execution.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("duplicate tool: '{0}'")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unexpected arguments for tool '{tool}': {args}")]
    UnexpectedArguments { tool: String, args: String },

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("audit log path rejected: {0}")]
    AuditPathRejected(String),

    #[error("session is not running (state: {0})")]
    SessionNotRunning(String),

    #[error("an execution is already in flight on this session")]
    ConcurrentExecution,

    #[error("pool is closed")]
    PoolClosed,

    #[error("no free session in the pool")]
    PoolExhausted,

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<FrameError> for SecurerErr {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge(size) => SecurerErr::IpcFrameTooLarge(size),
            FrameError::Schema(msg) => SecurerErr::IpcSchemaViolation(msg),
        }
    }
}
