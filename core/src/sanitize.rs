//! Error sanitizer: strips paths, PIDs, hosts, and stack traces from error
//! strings before they cross a trust boundary (to the child, or to callers
//! when `sanitize_errors` is set).
//!
//! Substitutions are ordered and idempotent: sanitizing an already-sanitized
//! string is a no-op.

use std::sync::LazyLock;

use regex_lite::Regex;

/// Character cap applied after all substitutions.
pub const DEFAULT_MAX_ERROR_LEN: usize = 2_000;

fn built_in(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid built-in regex {pattern}: {err}"),
    }
}

static STACK_TRACE_TAIL: LazyLock<Regex> =
    LazyLock::new(|| built_in(r"(?s)\s*(?:Traceback|Call stack|Stack trace).*$"));

static UNIX_PATH: LazyLock<Regex> = LazyLock::new(|| {
    built_in(r"/(?:home|Users|usr|tmp|var|etc|opt|srv|root|private)(?:/[\w.+-]+)+")
});

static DRIVE_PATH: LazyLock<Regex> = LazyLock::new(|| built_in(r#"[A-Za-z]:\\[^\s'"]+"#));

static PID_MENTION: LazyLock<Regex> =
    LazyLock::new(|| built_in(r"(?i)\b(?:pid|process)\s*[:=#]?\s*\d+"));

static CONNECTION_HOST: LazyLock<Regex> = LazyLock::new(|| {
    built_in(r"(?i)\b(connect(?:ion|ed)?\s+(?:to|refused|with)|host[:=])\s+\S+")
});

static IPV4: LazyLock<Regex> =
    LazyLock::new(|| built_in(r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d+)?\b"));

pub fn sanitize(message: &str) -> String {
    sanitize_with_limit(message, DEFAULT_MAX_ERROR_LEN)
}

pub fn sanitize_with_limit(message: &str, max_chars: usize) -> String {
    let message = STACK_TRACE_TAIL.replace(message, "");
    let message = UNIX_PATH.replace_all(&message, "[path]");
    let message = DRIVE_PATH.replace_all(&message, "[path]");
    let message = PID_MENTION.replace_all(&message, "[pid]");
    let message = CONNECTION_HOST.replace_all(&message, "$1 [host]");
    let message = IPV4.replace_all(&message, "[host]");

    if message.chars().count() > max_chars {
        let mut truncated: String = message.chars().take(max_chars.saturating_sub(1)).collect();
        truncated.push('…');
        truncated
    } else {
        message.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_stack_traces() {
        let input = "object 'x' not found\nTraceback:\n1: f()\n2: g()";
        assert_eq!(sanitize(input), "object 'x' not found");
        let input = "boom\nCall stack:\n  eval -> f";
        assert_eq!(sanitize(input), "boom");
    }

    #[test]
    fn redacts_unix_and_drive_paths() {
        assert_eq!(
            sanitize("cannot open file '/home/alice/.Rprofile'"),
            "cannot open file '[path]'"
        );
        assert_eq!(
            sanitize("cannot open C:\\Users\\alice\\data.csv here"),
            "cannot open [path] here"
        );
    }

    #[test]
    fn redacts_pids_and_hosts() {
        assert_eq!(sanitize("child pid 41213 died"), "child [pid] died");
        assert_eq!(
            sanitize("connection to internal.db.example refused"),
            "connection to [host] refused"
        );
        assert_eq!(sanitize("cannot reach 10.0.0.7:5432"), "cannot reach [host]");
    }

    #[test]
    fn truncates_long_messages() {
        let long = "x".repeat(3 * DEFAULT_MAX_ERROR_LEN);
        let sanitized = sanitize(&long);
        assert_eq!(sanitized.chars().count(), DEFAULT_MAX_ERROR_LEN);
        assert!(sanitized.ends_with('…'));
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in [
            "plain message",
            "cannot open file '/home/alice/.Rprofile'",
            "child pid 41213 died at /usr/lib/R/bin/exec",
            "connection to db.internal.example refused by 10.0.0.7",
            "boom\nTraceback:\n1: f()",
            &"y".repeat(3 * DEFAULT_MAX_ERROR_LEN),
        ] {
            let once = sanitize(input);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }
}
