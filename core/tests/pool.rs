//! Pool behavior: acquire/release bookkeeping, dead-session recovery,
//! acquire timeouts, reset-between-uses, closed-pool semantics.

mod common;

use std::time::Duration;
use std::time::Instant;

use securer_core::ExecPolicy;
use securer_core::PoolConfig;
use securer_core::SecurerErr;
use securer_core::SessionPool;
use securer_core::ToolRegistry;
use serde_json::json;

macro_rules! require_python {
    () => {
        if common::python3().is_none() {
            eprintln!("skipping: python3 not available");
            return;
        }
    };
}

fn pool_config(size: usize) -> PoolConfig {
    PoolConfig {
        session: common::stand_in_config(),
        ..PoolConfig::new(size)
    }
}

#[tokio::test]
async fn pool_prewarms_executes_and_reports_status() {
    require_python!();
    let mut pool = SessionPool::start(
        pool_config(2),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let status = pool.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.idle, 2);
    assert_eq!(status.busy, 0);
    assert_eq!(status.dead, 0);

    let outcome = pool.execute("1 + 1").await.expect("execute");
    assert_eq!(outcome.value, json!(2));

    // Released on completion.
    let status = pool.status();
    assert_eq!(status.idle, 2);
    pool.close().await;
}

#[tokio::test]
async fn acquire_marks_busy_and_release_frees() {
    require_python!();
    let mut pool = SessionPool::start(
        pool_config(2),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let first = pool.acquire().await.expect("acquire");
    let second = pool.acquire().await.expect("acquire");
    assert_ne!(first, second);
    assert_eq!(pool.status().busy, 2);

    // No acquire timeout configured: an exhausted pool fails immediately.
    let err = pool.acquire().await.expect_err("exhausted");
    assert!(matches!(err, SecurerErr::PoolExhausted), "{err:?}");

    pool.release(first);
    let reacquired = pool.acquire().await.expect("acquire");
    assert_eq!(reacquired, first);

    pool.release(first);
    pool.release(second);
    pool.close().await;
}

#[tokio::test]
async fn dead_sessions_are_replaced_on_acquire() {
    require_python!();
    let mut pool = SessionPool::start(
        pool_config(1),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    // Kill the pooled session behind the pool's back.
    let index = pool.acquire().await.expect("acquire");
    pool.session(index).expect("session").close().await;
    pool.release(index);
    assert_eq!(pool.status().dead, 1);

    // Acquire finds the dead slot and spawns a replacement with the same
    // configuration.
    let index = pool.acquire().await.expect("acquire");
    let outcome = pool
        .session(index)
        .expect("session")
        .execute("3 + 4")
        .await
        .expect("execute");
    assert_eq!(outcome.value, json!(7));
    pool.release(index);
    pool.close().await;
}

#[tokio::test]
async fn acquire_timeout_retries_then_fails() {
    require_python!();
    let mut config = pool_config(1);
    config.acquire_timeout = Some(Duration::from_millis(350));
    let mut pool = SessionPool::start(
        config,
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let index = pool.acquire().await.expect("acquire");
    let started = Instant::now();
    let err = pool.acquire().await.expect_err("must expire");
    assert!(matches!(err, SecurerErr::PoolExhausted), "{err:?}");
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "acquire must retry until the budget expires"
    );
    pool.release(index);
    pool.close().await;
}

#[tokio::test]
async fn reset_between_uses_restarts_sessions() {
    require_python!();
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().join("audit.jsonl");

    let mut config = pool_config(1);
    config.reset_between_uses = true;
    config.session.audit_log = Some(audit_path.clone());

    let mut pool = SessionPool::start(
        config,
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    pool.execute("1 + 1").await.expect("first");
    pool.execute("2 + 2").await.expect("second");
    pool.close().await;

    let kinds = common::event_kinds(&common::read_events(&audit_path));
    assert!(
        kinds.iter().filter(|k| *k == "session_restart").count() >= 2,
        "each use must be followed by a reset: {kinds:?}"
    );
}

#[tokio::test]
async fn errors_still_release_the_slot() {
    require_python!();
    let mut pool = SessionPool::start(
        pool_config(1),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let err = pool.execute("boom()").await.expect_err("child error");
    assert!(matches!(err, SecurerErr::ExecutionFailed(_)), "{err:?}");
    assert_eq!(pool.status().busy, 0, "slot must be released after an error");

    let outcome = pool.execute("1 + 1").await.expect("execute");
    assert_eq!(outcome.value, json!(2));
    pool.close().await;
}

#[tokio::test]
async fn closed_pools_refuse_use() {
    require_python!();
    let mut pool = SessionPool::start(
        pool_config(1),
        ToolRegistry::default(),
        ExecPolicy::default(),
    )
    .await
    .expect("start");

    pool.close().await;
    let err = pool.execute("1 + 1").await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::PoolClosed), "{err:?}");
    let err = pool.acquire().await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::PoolClosed), "{err:?}");
}
