//! Named resource limits and their translation to the wrapper script's
//! `ulimit` invocations.
//!
//! Values are positive integers. Units follow the limit: `cpu` is seconds,
//! `memory`/`fsize`/`stack` are bytes (converted to KiB or 512-byte blocks as
//! `ulimit` requires), `nproc`/`nofile` are counts. A plain `ulimit` sets
//! both the soft and the hard cap.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Result;
use crate::error::SecurerErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LimitKind {
    Cpu,
    Memory,
    Fsize,
    Nproc,
    Nofile,
    Stack,
}

impl LimitKind {
    pub fn name(self) -> &'static str {
        match self {
            LimitKind::Cpu => "cpu",
            LimitKind::Memory => "memory",
            LimitKind::Fsize => "fsize",
            LimitKind::Nproc => "nproc",
            LimitKind::Nofile => "nofile",
            LimitKind::Stack => "stack",
        }
    }
}

impl FromStr for LimitKind {
    type Err = SecurerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(LimitKind::Cpu),
            "memory" => Ok(LimitKind::Memory),
            "fsize" => Ok(LimitKind::Fsize),
            "nproc" => Ok(LimitKind::Nproc),
            "nofile" => Ok(LimitKind::Nofile),
            "stack" => Ok(LimitKind::Stack),
            other => Err(SecurerErr::InvalidLimit(format!(
                "unknown resource limit '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    entries: BTreeMap<LimitKind, u64>,
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one limit. Zero is rejected: every limit is a positive quantity.
    pub fn set(&mut self, kind: LimitKind, value: u64) -> Result<()> {
        if value == 0 {
            return Err(SecurerErr::InvalidLimit(format!(
                "'{}' must be a positive number",
                kind.name()
            )));
        }
        self.entries.insert(kind, value);
        Ok(())
    }

    /// Parses and sets a limit from its wire name, e.g. `("memory", bytes)`.
    pub fn set_named(&mut self, name: &str, value: u64) -> Result<()> {
        self.set(name.parse()?, value)
    }

    pub fn get(&self, kind: LimitKind) -> Option<u64> {
        self.entries.get(&kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the `ulimit` lines that the launch wrapper prepends to the
    /// interpreter exec. Byte-valued limits are converted to the unit the
    /// underlying primitive expects, rounding up so a cap is never loosened.
    pub fn ulimit_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(kind, value)| match kind {
                LimitKind::Cpu => format!("ulimit -t {value}"),
                LimitKind::Memory => format!("ulimit -v {}", bytes_to_kib(*value)),
                LimitKind::Fsize => format!("ulimit -f {}", bytes_to_blocks(*value)),
                LimitKind::Nproc => format!("ulimit -u {value}"),
                LimitKind::Nofile => format!("ulimit -n {value}"),
                LimitKind::Stack => format!("ulimit -s {}", bytes_to_kib(*value)),
            })
            .collect()
    }
}

fn bytes_to_kib(bytes: u64) -> u64 {
    bytes.div_ceil(1024).max(1)
}

fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(512).max(1)
}
