//! Linux bubblewrap backend: argument builder for the namespace/mount
//! isolator the launch wrapper execs.

use std::path::Path;
use std::path::PathBuf;

/// Filesystem roots bind-mounted read-only so the interpreter binary and the
/// system libraries resolve inside the mount namespace. Only roots that
/// exist on the host are emitted.
const SYSTEM_RO_ROOTS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/opt"];

/// Library-search paths outside the system roots: the interpreter
/// installation (`R_HOME`) and every site library directory.
pub fn library_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(r_home) = std::env::var("R_HOME") {
        if !r_home.is_empty() {
            roots.push(PathBuf::from(r_home));
        }
    }
    if let Ok(site) = std::env::var("R_LIBS_SITE") {
        for entry in site.split(':').filter(|s| !s.is_empty()) {
            roots.push(PathBuf::from(entry));
        }
    }
    roots
}

/// Builds the complete bubblewrap argument list. The wrapper script invokes
/// `bwrap <these args> -- <interpreter> "$@"`.
pub fn build_args(socket_dir: &Path, extra_ro_roots: &[PathBuf]) -> Vec<String> {
    let mut args: Vec<String> = [
        "--unshare-all",
        "--die-with-parent",
        "--new-session",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut push = |items: &[&str]| {
        args.extend(items.iter().map(|s| s.to_string()));
    };

    for root in SYSTEM_RO_ROOTS {
        if Path::new(root).is_dir() {
            push(&["--ro-bind", root, root]);
        }
    }
    for root in extra_ro_roots {
        if !root.is_dir() || SYSTEM_RO_ROOTS.iter().any(|sys| root.starts_with(sys)) {
            continue;
        }
        let root = root.to_string_lossy();
        push(&["--ro-bind", root.as_ref(), root.as_ref()]);
    }

    push(&["--dev", "/dev"]);
    push(&["--proc", "/proc"]);

    // Clean scratch space, then the rendezvous directory bound writable on
    // top of it.
    push(&["--tmpfs", "/tmp"]);
    let socket_dir = socket_dir.to_string_lossy();
    push(&["--bind", socket_dir.as_ref(), socket_dir.as_ref()]);

    // Mask the introspection windows that would leak the parent environment
    // or memory layout.
    push(&["--ro-bind", "/dev/null", "/proc/self/environ"]);
    push(&["--ro-bind", "/dev/null", "/proc/self/maps"]);
    push(&["--tmpfs", "/proc/self/fd"]);

    push(&["--setenv", "HOME", "/tmp"]);
    push(&["--setenv", "TMPDIR", "/tmp"]);
    push(&["--setenv", "R_LIBS_USER", ""]);

    args
}
