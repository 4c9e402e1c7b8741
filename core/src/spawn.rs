use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;

#[derive(Debug, Clone, Copy)]
pub enum StdioPolicy {
    /// Pipe stdout/stderr for the streaming drain; no stdin so the child can
    /// never block waiting for input from the supervisor.
    RedirectForCapture,

    /// Inherit stdin, stdout, and stderr from the parent process.
    Inherit,
}

/// Spawns the interpreter child (or its sandbox wrapper) with exactly the
/// environment produced by [`crate::env::build_child_env`] — `env_clear`
/// first, so nothing leaks past the allowlist.
///
/// `kill_on_drop(true)` is the process-kill finalizer: dropping the `Child`
/// on any exit path reaps the interpreter even when teardown logic never
/// ran.
pub(crate) fn spawn_child(
    program: &Path,
    args: &[String],
    env: &HashMap<String, String>,
    stdio_policy: StdioPolicy,
) -> io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(env);

    match stdio_policy {
        StdioPolicy::RedirectForCapture => {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        StdioPolicy::Inherit => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
    }

    cmd.kill_on_drop(true).spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_child_sees_only_the_given_env() {
        let mut env = HashMap::new();
        env.insert("ONLY_VAR".to_string(), "yes".to_string());
        let mut child = spawn_child(
            Path::new("/bin/sh"),
            &["-c".to_string(), "printf '%s' \"$ONLY_VAR:$HOME\"".to_string()],
            &env,
            StdioPolicy::RedirectForCapture,
        )
        .expect("spawn");
        let mut out = String::new();
        use tokio::io::AsyncReadExt;
        child
            .stdout
            .take()
            .expect("stdout piped")
            .read_to_string(&mut out)
            .await
            .expect("read");
        let status = child.wait().await.expect("wait");
        assert!(status.success());
        assert_eq!(out, "yes:");
    }
}
