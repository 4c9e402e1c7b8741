//! macOS Seatbelt backend: composes the mandatory-access-control profile and
//! the argument list for `sandbox-exec`.

use std::path::Path;

const SEATBELT_BASE_PROFILE: &str = include_str!("sandbox_profile_base.sb");

/// When working with `sandbox-exec`, only consider `sandbox-exec` in
/// `/usr/bin` to defend against an attacker trying to inject a malicious
/// version on the PATH. If /usr/bin/sandbox-exec has been tampered with,
/// then the attacker already has root access.
pub const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// POSIX utilities the interpreter shells out to while starting up.
const EXEC_UTILITY_ALLOWLIST: &[&str] = &[
    "/bin/sh",
    "/usr/bin/env",
    "/usr/bin/uname",
    "/usr/bin/arch",
    "/usr/bin/sed",
];

/// Builds the full profile text: the default-deny base plus the per-session
/// allowances, which are bound at launch via `-D` parameters so the profile
/// file itself carries no absolute paths.
pub fn build_profile() -> String {
    let socket_dir_policy = "(allow file-write*\n    (subpath (param \"SOCKET_DIR\")))";
    let exec_literals: String = EXEC_UTILITY_ALLOWLIST
        .iter()
        .map(|util| format!("    (literal \"{util}\")"))
        .collect::<Vec<_>>()
        .join("\n");
    let exec_policy = format!(
        "(allow process-exec\n    (literal (param \"INTERPRETER\"))\n{exec_literals})"
    );
    format!("{SEATBELT_BASE_PROFILE}\n{socket_dir_policy}\n{exec_policy}\n")
}

/// Arguments for `sandbox-exec` itself; the wrapper appends the interpreter
/// path and `"$@"` after these.
pub fn sandbox_exec_args(
    profile_path: &Path,
    socket_dir: &Path,
    interpreter: &Path,
) -> Vec<String> {
    vec![
        "-f".to_string(),
        profile_path.to_string_lossy().into_owned(),
        format!("-DSOCKET_DIR={}", socket_dir.to_string_lossy()),
        format!("-DINTERPRETER={}", interpreter.to_string_lossy()),
    ]
}
