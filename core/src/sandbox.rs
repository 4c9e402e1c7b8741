//! Sandbox assembly: turns the session configuration into a launch
//! configuration (wrapper script, profile, environment overrides, post-spawn
//! hook) for the current platform, with a warn-and-degrade fallback unless
//! strict sandboxing was requested.
//!
//! The auxiliary files are owned as `TempPath`/`TempDir`, so dropping the
//! assembled configuration unlinks every artifact on every exit path.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use tempfile::TempPath;
use tracing::warn;

use crate::config::ChildCommand;
use crate::config::SandboxMode;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::error::SecurerErr;
use crate::job_object;
use crate::job_object::JobHandle;
use crate::job_object::JobLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Seatbelt,
    Bwrap,
    EnvOnly,
    LimitsOnly,
    None,
}

impl SandboxKind {
    pub fn label(self) -> &'static str {
        match self {
            SandboxKind::Seatbelt => "seatbelt",
            SandboxKind::Bwrap => "bwrap",
            SandboxKind::EnvOnly => "env-only",
            SandboxKind::LimitsOnly => "limits-only",
            SandboxKind::None => "none",
        }
    }
}

#[derive(Debug)]
pub(crate) enum SandboxConfig {
    /// A generated launch script that execs the interpreter under the
    /// platform sandbox (or under `ulimit` caps alone).
    Wrapper {
        script: TempPath,
        profile: Option<TempPath>,
        kind: SandboxKind,
    },

    /// No wrapper; a sanitized environment is merged into the child's launch
    /// environment and limits are applied to the PID after spawn.
    EnvOnly {
        env_overrides: HashMap<String, String>,
        #[allow(dead_code)] // held for unlink-on-drop
        sandbox_tmp: TempDir,
        limits: JobLimits,
    },

    None,
}

impl SandboxConfig {
    pub(crate) fn kind(&self) -> SandboxKind {
        match self {
            SandboxConfig::Wrapper { kind, .. } => *kind,
            SandboxConfig::EnvOnly { .. } => SandboxKind::EnvOnly,
            SandboxConfig::None => SandboxKind::None,
        }
    }

    /// True when a real isolation boundary (not just resource caps) exists.
    pub(crate) fn is_real_sandbox(&self) -> bool {
        matches!(
            self.kind(),
            SandboxKind::Seatbelt | SandboxKind::Bwrap | SandboxKind::EnvOnly
        )
    }

    /// The program to spawn: the wrapper script when one exists, otherwise
    /// the interpreter itself. Interpreter args are passed through either
    /// way (`"$@"` in the wrapper).
    pub(crate) fn launch_program(&self, child: &ChildCommand) -> PathBuf {
        match self {
            SandboxConfig::Wrapper { script, .. } => script.to_path_buf(),
            _ => child.program.clone(),
        }
    }

    pub(crate) fn env_overrides(&self) -> Option<&HashMap<String, String>> {
        match self {
            SandboxConfig::EnvOnly { env_overrides, .. } => Some(env_overrides),
            _ => None,
        }
    }

    /// Post-spawn confinement hook. The returned handle must be kept alive
    /// for as long as the child runs.
    pub(crate) fn apply_post_spawn(&self, pid: u32) -> io::Result<Option<JobHandle>> {
        match self {
            SandboxConfig::EnvOnly { limits, .. } => job_object::apply_to_child(pid, limits),
            _ => Ok(None),
        }
    }
}

/// Builds the sandbox configuration for this session. Called during session
/// start, before the child is spawned; the result is immutable afterwards.
pub(crate) fn assemble(config: &SessionConfig, socket_dir: &Path) -> Result<SandboxConfig> {
    let assembled = match config.sandbox {
        SandboxMode::Disabled => limits_only(config)?,
        SandboxMode::Auto => assemble_platform(config, socket_dir)?,
    };
    if config.sandbox_strict && config.sandbox == SandboxMode::Auto && !assembled.is_real_sandbox()
    {
        return Err(SecurerErr::SandboxUnavailable);
    }
    Ok(assembled)
}

#[cfg(target_os = "macos")]
fn assemble_platform(config: &SessionConfig, socket_dir: &Path) -> Result<SandboxConfig> {
    use crate::seatbelt;

    if !Path::new(seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE).is_file() {
        return fallback(config, seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE);
    }
    let interpreter = resolve_program(&config.child.program);
    let profile = write_profile(config, &seatbelt::build_profile())?;
    let mut exec_line = format!("exec {}", shell_quote(seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE));
    for arg in seatbelt::sandbox_exec_args(&profile, socket_dir, &interpreter) {
        exec_line.push(' ');
        exec_line.push_str(&shell_quote(&arg));
    }
    exec_line.push(' ');
    exec_line.push_str(&shell_quote(&interpreter.to_string_lossy()));
    exec_line.push_str(" \"$@\"");
    let script = write_wrapper(config, &exec_line)?;
    Ok(SandboxConfig::Wrapper {
        script,
        profile: Some(profile),
        kind: SandboxKind::Seatbelt,
    })
}

#[cfg(target_os = "linux")]
fn assemble_platform(config: &SessionConfig, socket_dir: &Path) -> Result<SandboxConfig> {
    use crate::bwrap;

    let Some(bwrap_bin) = find_in_path("bwrap") else {
        return fallback(config, "bwrap");
    };
    let interpreter = resolve_program(&config.child.program);
    let mut exec_line = format!("exec {}", shell_quote(&bwrap_bin.to_string_lossy()));
    for arg in bwrap::build_args(socket_dir, &bwrap::library_search_roots()) {
        exec_line.push(' ');
        exec_line.push_str(&shell_quote(&arg));
    }
    exec_line.push_str(" -- ");
    exec_line.push_str(&shell_quote(&interpreter.to_string_lossy()));
    exec_line.push_str(" \"$@\"");
    let script = write_wrapper(config, &exec_line)?;
    Ok(SandboxConfig::Wrapper {
        script,
        profile: None,
        kind: SandboxKind::Bwrap,
    })
}

#[cfg(target_os = "windows")]
fn assemble_platform(config: &SessionConfig, _socket_dir: &Path) -> Result<SandboxConfig> {
    let sandbox_tmp = tempfile::Builder::new()
        .prefix("securer_win_")
        .tempdir_in(temp_base(config))?;
    let env_overrides = env_only_overrides(sandbox_tmp.path());
    Ok(SandboxConfig::EnvOnly {
        env_overrides,
        sandbox_tmp,
        limits: JobLimits::from_limits(&config.limits),
    })
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn assemble_platform(config: &SessionConfig, _socket_dir: &Path) -> Result<SandboxConfig> {
    fallback(config, "platform sandbox")
}

fn fallback(config: &SessionConfig, missing: &str) -> Result<SandboxConfig> {
    if config.sandbox_strict {
        return Err(SecurerErr::SandboxUnavailable);
    }
    warn!("{missing} not found; child will run without OS-level sandboxing");
    limits_only(config)
}

/// No isolation; a minimal wrapper still enforces `ulimit` caps when any
/// were configured.
fn limits_only(config: &SessionConfig) -> Result<SandboxConfig> {
    if config.limits.is_empty() {
        return Ok(SandboxConfig::None);
    }
    let interpreter = resolve_program(&config.child.program);
    let exec_line = format!(
        "exec {} \"$@\"",
        shell_quote(&interpreter.to_string_lossy())
    );
    let script = write_wrapper(config, &exec_line)?;
    Ok(SandboxConfig::Wrapper {
        script,
        profile: None,
        kind: SandboxKind::LimitsOnly,
    })
}

/// Environment overrides for the no-wrapper (Windows) path: every temp and
/// home variable points into the freshly created private directory and the
/// library-path variables are blanked.
pub fn env_only_overrides(sandbox_tmp: &Path) -> HashMap<String, String> {
    let tmp = sandbox_tmp.to_string_lossy().into_owned();
    let mut env = HashMap::new();
    for key in ["HOME", "TMPDIR", "TEMP", "TMP"] {
        env.insert(key.to_string(), tmp.clone());
    }
    for key in ["R_LIBS", "R_LIBS_USER", "R_LIBS_SITE"] {
        env.insert(key.to_string(), String::new());
    }
    env
}

fn write_wrapper(config: &SessionConfig, exec_line: &str) -> Result<TempPath> {
    let mut content = String::from("#!/bin/sh\n");
    for line in config.limits.ulimit_lines() {
        content.push_str(&line);
        content.push('\n');
    }
    content.push_str(exec_line);
    content.push('\n');
    write_artifact(config, "securer_r_", ".sh", &content, 0o700)
}

#[cfg(target_os = "macos")]
fn write_profile(config: &SessionConfig, profile: &str) -> Result<TempPath> {
    write_artifact(config, "securer_sb_", ".sb", profile, 0o600)
}

fn write_artifact(
    config: &SessionConfig,
    prefix: &str,
    suffix: &str,
    content: &str,
    mode: u32,
) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(temp_base(config))?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(file.into_temp_path())
}

fn temp_base(config: &SessionConfig) -> PathBuf {
    config
        .temp_base
        .clone()
        .unwrap_or_else(std::env::temp_dir)
}

/// Resolves a bare program name against `PATH`; absolute and relative paths
/// pass through untouched.
fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() > 1 || program.is_absolute() {
        return program.to_path_buf();
    }
    find_in_path(&program.to_string_lossy()).unwrap_or_else(|| program.to_path_buf())
}

pub(crate) fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
