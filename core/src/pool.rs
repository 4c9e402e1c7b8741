//! Pre-warmed pool of supervisors with acquire/release semantics.
//!
//! Single-process only, by design: one owner mutates the pool, so there is
//! no internal locking. Busy tracking is a parallel boolean vector; dead
//! sessions found during acquire or inspection are torn down and replaced
//! with a fresh session built from the original configuration.

use std::time::Duration;
use std::time::Instant;

use tokio::time::sleep;
use tracing::warn;

use crate::config::ExecPolicy;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::error::SecurerErr;
use crate::registry::ToolRegistry;
use crate::session::ExecOutput;
use crate::session::Supervisor;

const MIN_POOL_SIZE: usize = 1;
const MAX_POOL_SIZE: usize = 100;
const ACQUIRE_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub session: SessionConfig,

    /// Restart a session after each release so state cannot leak from one
    /// consumer to the next.
    pub reset_between_uses: bool,

    /// Wall-clock budget for `acquire` when every slot is busy. `None`
    /// means fail immediately with `PoolExhausted`.
    pub acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            session: SessionConfig::default(),
            reset_between_uses: false,
            acquire_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub dead: usize,
}

#[derive(Debug)]
pub struct SessionPool {
    config: PoolConfig,
    registry: ToolRegistry,
    policy: ExecPolicy,
    sessions: Vec<Supervisor>,
    busy: Vec<bool>,
    closed: bool,
}

impl SessionPool {
    /// Pre-warms `size` sessions. On any start failure the already-started
    /// sessions are closed before the error is returned.
    pub async fn start(
        config: PoolConfig,
        registry: ToolRegistry,
        policy: ExecPolicy,
    ) -> Result<Self> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&config.size) {
            return Err(SecurerErr::InvalidLimit(format!(
                "pool size {} is outside {MIN_POOL_SIZE}..={MAX_POOL_SIZE}",
                config.size
            )));
        }
        let mut sessions = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            match Supervisor::start(config.session.clone(), registry.clone(), policy.clone())
                .await
            {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    for mut session in sessions {
                        session.close().await;
                    }
                    return Err(err);
                }
            }
        }
        let busy = vec![false; config.size];
        Ok(Self {
            config,
            registry,
            policy,
            sessions,
            busy,
            closed: false,
        })
    }

    /// Claims the first free slot, replacing a dead session on the way.
    /// With an acquire timeout configured, retries every 100 ms until a slot
    /// frees up or the budget expires.
    pub async fn acquire(&mut self) -> Result<usize> {
        if self.closed {
            return Err(SecurerErr::PoolClosed);
        }
        let deadline = self.config.acquire_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(index) = self.try_acquire().await? {
                return Ok(index);
            }
            match deadline {
                Some(at) if Instant::now() < at => sleep(ACQUIRE_RETRY).await,
                _ => return Err(SecurerErr::PoolExhausted),
            }
        }
    }

    async fn try_acquire(&mut self) -> Result<Option<usize>> {
        for index in 0..self.sessions.len() {
            if self.busy[index] {
                continue;
            }
            if !self.sessions[index].is_alive() {
                warn!(index, "replacing dead pooled session");
                self.sessions[index].close().await;
                let replacement = Supervisor::start(
                    self.config.session.clone(),
                    self.registry.clone(),
                    self.policy.clone(),
                )
                .await?;
                self.sessions[index] = replacement;
            }
            self.busy[index] = true;
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Access to an acquired session, e.g. for `execute_with`.
    pub fn session(&mut self, index: usize) -> Option<&mut Supervisor> {
        self.sessions.get_mut(index)
    }

    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.busy.get_mut(index) {
            *slot = false;
        }
    }

    /// Acquire, execute, release — the slot is released on every outcome,
    /// error or not. With `reset_between_uses`, the session is restarted
    /// after release.
    pub async fn execute(&mut self, code: &str) -> Result<ExecOutput> {
        let index = self.acquire().await?;
        let outcome = self.sessions[index].execute(code).await;
        self.release(index);
        if self.config.reset_between_uses {
            if let Err(err) = self.sessions[index].restart().await {
                warn!(index, "reset between uses failed: {err}");
            }
        }
        outcome
    }

    pub fn status(&mut self) -> PoolStatus {
        let total = self.sessions.len();
        let mut busy = 0;
        let mut idle = 0;
        let mut dead = 0;
        for index in 0..total {
            if !self.sessions[index].is_alive() {
                dead += 1;
            } else if self.busy[index] {
                busy += 1;
            } else {
                idle += 1;
            }
        }
        PoolStatus {
            total,
            busy,
            idle,
            dead,
        }
    }

    /// Closes every session. Further use fails with `PoolClosed`.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        for session in &mut self.sessions {
            session.close().await;
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_size_bounds_are_enforced() {
        for size in [0, 101] {
            let err = SessionPool::start(
                PoolConfig::new(size),
                ToolRegistry::default(),
                ExecPolicy::default(),
            )
            .await
            .expect_err("must fail");
            assert!(matches!(err, SecurerErr::InvalidLimit(_)), "size {size}");
        }
    }
}
