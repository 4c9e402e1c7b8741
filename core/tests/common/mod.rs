//! Shared helpers for the integration suites.
//!
//! The interpreter is a black box to the supervisor, so the suites drive it
//! with a Python stand-in that speaks the same wire protocol as the real
//! child runtime: connect, authenticate, scrub the rendezvous variables,
//! then service `inject`/`execute` frames and issue `tool_call`s.

#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use securer_core::ChildCommand;
use securer_core::ExecPolicy;
use securer_core::SandboxMode;
use securer_core::SessionConfig;
use serde_json::Value;

pub const PYTHON_RUNNER: &str = r#"
import json, os, socket, sys, time

path = os.environ.pop("SECURER_SOCKET")
token = os.environ.pop("SECURER_TOKEN")
sock = socket.socket(socket.AF_UNIX, socket.SOCK_STREAM)
sock.connect(path)
f = sock.makefile("rw", buffering=1, encoding="utf-8", newline="\n")
f.write(token + "\n")
f.flush()

def call_tool(name, **kwargs):
    frame = {"type": "tool_call", "tool": name, "args": kwargs if kwargs else None}
    f.write(json.dumps(frame) + "\n")
    f.flush()
    reply = json.loads(f.readline())
    if reply.get("error") is not None:
        raise RuntimeError(reply["error"])
    return reply.get("value")

def flood(n=2000):
    for _ in range(n):
        try:
            call_tool("no.such.tool")
        except Exception:
            pass
    return 0

def emit():
    print("line-1")
    print("line-2", file=sys.stderr)
    sys.stdout.flush()
    sys.stderr.flush()
    return 7

def chatty(n=50):
    for i in range(n):
        print("chatty-%d" % i)
    sys.stdout.flush()
    return n

SCOPE = {
    "call_tool": call_tool,
    "sleep": time.sleep,
    "flood": flood,
    "emit": emit,
    "chatty": chatty,
    "die": lambda: os._exit(9),
}

for line in f:
    msg = json.loads(line)
    kind = msg.get("type")
    if kind == "inject":
        f.write(json.dumps({"type": "result", "value": True}) + "\n")
        f.flush()
    elif kind == "execute":
        try:
            value = eval(msg["code"], SCOPE)
            f.write(json.dumps({"type": "result", "value": value}) + "\n")
        except Exception as exc:
            f.write(json.dumps({"type": "result", "error": str(exc)}) + "\n")
        f.flush()
"#;

/// A runner that connects but presents the wrong token, for the
/// authentication-failure scenario.
pub const WRONG_TOKEN_RUNNER: &str = r#"
import os, socket, time

path = os.environ["SECURER_SOCKET"]
sock = socket.socket(socket.AF_UNIX, socket.SOCK_STREAM)
sock.connect(path)
sock.sendall(b"wrong-token\n")
time.sleep(30)
"#;

pub fn python3() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("python3"))
        .find(|candidate| candidate.is_file())
}

/// Session configuration driving the Python stand-in, unsandboxed.
pub fn stand_in_config() -> SessionConfig {
    SessionConfig {
        child: ChildCommand {
            program: PathBuf::from("python3"),
            args: vec!["-u".to_string()],
            eval_flag: "-c".to_string(),
        },
        sandbox: SandboxMode::Disabled,
        runtime_template: Some(PYTHON_RUNNER.to_string()),
        ..SessionConfig::default()
    }
}

pub fn policy_with_timeout(timeout: Duration) -> ExecPolicy {
    ExecPolicy {
        timeout: Some(timeout),
        ..ExecPolicy::default()
    }
}

/// Reads the audit log back as parsed events.
pub fn read_events(path: &Path) -> Vec<Value> {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit line must be JSON"))
        .collect()
}

pub fn event_kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            event["event"]
                .as_str()
                .expect("event kind must be a string")
                .to_string()
        })
        .collect()
}

/// Names of `securer_*` entries currently under `base` — used to assert the
/// filesystem surface is cleaned on every exit path.
pub fn securer_entries(base: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(base) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("securer_"))
        .collect()
}
