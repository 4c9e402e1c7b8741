//! Child environment construction.
//!
//! The child never inherits the parent environment wholesale: per-user
//! library search paths can be attacker-controlled and support load-time
//! side effects, so everything outside a fixed allowlist is dropped and
//! `R_LIBS_USER` is forced empty.

use std::collections::HashMap;
use std::path::Path;

use securer_protocol::ENV_SOCKET;
use securer_protocol::ENV_TOKEN;

/// Variables kept from the parent environment, verbatim. `LC_*` is matched
/// by prefix.
const ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "LANG", "SHELL", "TMPDIR", "TZ", "TERM", "R_HOME",
    "R_LIBS_SITE", "R_PLATFORM", "R_ARCH",
];

fn is_allowed(key: &str) -> bool {
    ENV_ALLOWLIST.contains(&key) || key.starts_with("LC_")
}

/// Builds the complete environment for the interpreter child: the allowlisted
/// subset of the current process environment, the rendezvous variables, the
/// forced-empty `R_LIBS_USER`, and any sandbox-supplied overrides (applied
/// last, so a sandbox can pin `HOME`/`TMPDIR`).
pub fn build_child_env(
    socket_path: &Path,
    token: &str,
    sandbox_overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| is_allowed(key))
        .collect();
    env.insert("R_LIBS_USER".to_string(), String::new());
    env.insert(
        ENV_SOCKET.to_string(),
        socket_path.to_string_lossy().into_owned(),
    );
    env.insert(ENV_TOKEN.to_string(), token.to_string());
    for (key, value) in sandbox_overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}
