//! Wire protocol for the supervisor <-> interpreter rendezvous socket.
//!
//! Framing is one JSON object per newline-terminated UTF-8 line. The child
//! authenticates by sending the raw session token as its first line; every
//! frame after that must parse as a JSON object with a scalar `type` field.
//! Requests and replies are strictly ordered: each `tool_call` from the child
//! is answered with exactly one reply before the supervisor reads the next
//! frame.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a single frame, including the trailing newline. Larger
/// frames are rejected before parsing.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Environment variable carrying the rendezvous socket path to the child.
pub const ENV_SOCKET: &str = "SECURER_SOCKET";

/// Environment variable carrying the one-shot session token to the child.
pub const ENV_TOKEN: &str = "SECURER_TOKEN";

/// Length of the session token in characters.
pub const TOKEN_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    TooLarge(usize),

    #[error("malformed frame: {0}")]
    Schema(String),
}

/// Returns true if `name` matches `^[A-Za-z.][A-Za-z0-9_.]*$`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Frames written by the supervisor to the child.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Evaluate `code` in the child's global scope and acknowledge with a
    /// `result` frame. Used for the per-tool wrapper snippet after handshake.
    Inject { code: String },

    /// Dispatch one execution. The child answers with interleaved
    /// `tool_call` frames and finally one `result` frame.
    Execute { code: String },
}

/// Reply to a single `tool_call`: exactly one of `value` or `error`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ToolReply {
    Value { value: Value },
    Error { error: String },
}

/// Structured completion of an `execute` or `inject`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecResult {
    Value(Value),
    Error(String),
}

/// A validated frame read from the child.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildFrame {
    ToolCall {
        tool: String,
        args: Option<serde_json::Map<String, Value>>,
    },
    Result(ExecResult),

    /// Schema-valid frame with a `type` the supervisor does not handle. The
    /// event loop warns and counts it against the total-message cap.
    Unknown { kind: String },
}

/// Serializes a frame to its wire line (newline included), enforcing the
/// frame size limit.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, FrameError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| FrameError::Schema(e.to_string()))?;
    line.push('\n');
    if line.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(line.len()));
    }
    Ok(line)
}

/// Parses and validates one line received from the child.
///
/// The byte cap is enforced by the channel before this is called. Validation
/// here is structural: the line must be a JSON object whose `type` is a
/// scalar string; a `tool_call` must carry a string `tool` and null-or-object
/// `args`. Whether `tool` names a registered tool (or is even a well-formed
/// identifier) is the dispatcher's concern, which answers with an in-band
/// `Unknown tool` reply rather than tearing the channel down.
pub fn parse_child_frame(line: &str) -> Result<ChildFrame, FrameError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| FrameError::Schema(format!("invalid JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(FrameError::Schema("frame is not a JSON object".to_string()));
    };
    let kind = match obj.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(FrameError::Schema(
                "`type` must be a scalar string".to_string(),
            ));
        }
        None => return Err(FrameError::Schema("frame has no `type` field".to_string())),
    };

    match kind.as_str() {
        "tool_call" => {
            let tool = match obj.get("tool") {
                Some(Value::String(s)) => s.clone(),
                _ => {
                    return Err(FrameError::Schema(
                        "`tool` must be a scalar string".to_string(),
                    ));
                }
            };
            let args = match obj.get("args") {
                None | Some(Value::Null) => None,
                Some(Value::Object(map)) => Some(map.clone()),
                Some(_) => {
                    return Err(FrameError::Schema(
                        "`args` must be null or an object".to_string(),
                    ));
                }
            };
            Ok(ChildFrame::ToolCall { tool, args })
        }
        "result" => match obj.get("error") {
            Some(Value::String(msg)) => Ok(ChildFrame::Result(ExecResult::Error(msg.clone()))),
            Some(Value::Null) | None => {
                let value = obj.get("value").cloned().unwrap_or(Value::Null);
                Ok(ChildFrame::Result(ExecResult::Value(value)))
            }
            Some(_) => Err(FrameError::Schema(
                "`error` must be null or a string".to_string(),
            )),
        },
        _ => Ok(ChildFrame::Unknown { kind }),
    }
}
