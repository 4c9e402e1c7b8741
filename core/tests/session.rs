//! End-to-end supervisor scenarios, driven against the Python stand-in
//! runner (see `common::PYTHON_RUNNER`). Each suite skips gracefully when
//! `python3` is not installed.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use securer_core::ExecPolicy;
use securer_core::SecurerErr;
use securer_core::SessionState;
use securer_core::Supervisor;
use securer_core::ToolFn;
use securer_core::ToolParam;
use securer_core::ToolRegistry;
use securer_core::TypeTag;
use securer_core::define_tool;
use serde_json::Value;
use serde_json::json;

macro_rules! require_python {
    () => {
        if common::python3().is_none() {
            eprintln!("skipping: python3 not available");
            return;
        }
    };
}

fn add_tool() -> ToolRegistry {
    let implementation: ToolFn = Arc::new(|args| {
        let a = args.get("a").and_then(Value::as_f64).unwrap_or_default();
        let b = args.get("b").and_then(Value::as_f64).unwrap_or_default();
        Ok(json!(a + b))
    });
    let add = define_tool(
        "add",
        "adds two numbers",
        implementation,
        Some(vec![
            ToolParam::typed("a", TypeTag::Numeric),
            ToolParam::typed("b", TypeTag::Numeric),
        ]),
    )
    .expect("define add");
    ToolRegistry::from_tools(vec![add]).expect("registry")
}

fn ping_tool() -> ToolRegistry {
    let implementation: ToolFn = Arc::new(|_args| Ok(json!("pong")));
    let ping = define_tool("ping", "returns pong", implementation, Some(vec![]))
        .expect("define ping");
    ToolRegistry::from_tools(vec![ping]).expect("registry")
}

#[tokio::test]
async fn simple_execution_returns_value_and_audit_trail() {
    require_python!();
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().join("audit.jsonl");

    let mut config = common::stand_in_config();
    config.audit_log = Some(audit_path.clone());

    let mut session = Supervisor::start(
        config,
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let outcome = session.execute("1 + 1").await.expect("execute");
    assert_eq!(outcome.value, json!(2));
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let events = common::read_events(&audit_path);
    assert_eq!(
        common::event_kinds(&events),
        vec![
            "session_start",
            "execute_start",
            "execute_complete",
            "session_close"
        ]
    );
    assert_eq!(events[1]["code"], "1 + 1");
    let session_id = events[0]["session_id"].as_str().expect("session id");
    assert!(
        events.iter().all(|e| e["session_id"] == session_id),
        "session id must be stable across events"
    );
}

#[tokio::test]
async fn tool_round_trip_dispatches_through_the_registry() {
    require_python!();
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().join("audit.jsonl");

    let mut config = common::stand_in_config();
    config.audit_log = Some(audit_path.clone());

    let mut session = Supervisor::start(
        config,
        add_tool(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let outcome = session
        .execute("call_tool('add', a=2, b=3)")
        .await
        .expect("execute");
    assert_eq!(outcome.value, json!(5.0));
    session.close().await;

    let kinds = common::event_kinds(&common::read_events(&audit_path));
    assert_eq!(
        kinds,
        vec![
            "session_start",
            "execute_start",
            "tool_call",
            "tool_result",
            "execute_complete",
            "session_close"
        ]
    );

    let events = common::read_events(&audit_path);
    assert_eq!(events[2]["tool"], "add");
    assert_eq!(events[2]["args"]["a"], 2);
    assert_eq!(events[3]["error"], Value::Null);
}

#[tokio::test]
async fn wrong_token_fails_the_session_and_cleans_up() {
    require_python!();
    let base = tempfile::tempdir().expect("tempdir");

    let mut config = common::stand_in_config();
    config.runtime_template = Some(common::WRONG_TOKEN_RUNNER.to_string());
    config.temp_base = Some(base.path().to_path_buf());

    let err = Supervisor::start(config, ToolRegistry::default(), ExecPolicy::default())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SecurerErr::IpcAuthFailed), "{err:?}");

    assert_eq!(
        common::securer_entries(base.path()),
        Vec::<String>::new(),
        "all rendezvous artifacts must be unlinked"
    );
}

#[tokio::test]
async fn timeout_kills_the_child_and_the_session_self_heals() {
    require_python!();
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().join("audit.jsonl");
    let base = tempfile::tempdir().expect("tempdir");

    let mut config = common::stand_in_config();
    config.audit_log = Some(audit_path.clone());
    config.temp_base = Some(base.path().to_path_buf());

    let mut session = Supervisor::start(
        config,
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(1)),
    )
    .await
    .expect("start");

    let started = std::time::Instant::now();
    let err = session.execute("sleep(60)").await.expect_err("must time out");
    assert!(matches!(err, SecurerErr::Timeout(_)), "{err:?}");
    assert!(started.elapsed() >= Duration::from_secs(1));

    // Self-healed: the same handle executes again immediately.
    assert_eq!(session.state(), SessionState::Ready);
    let outcome = session.execute("42").await.expect("follow-up");
    assert_eq!(outcome.value, json!(42));

    session.close().await;
    assert_eq!(
        common::securer_entries(base.path()),
        Vec::<String>::new(),
        "timeout recovery must not leak rendezvous artifacts"
    );

    let kinds = common::event_kinds(&common::read_events(&audit_path));
    assert!(kinds.contains(&"execute_timeout".to_string()));
    // One session_start for the original child, one for the replacement.
    assert_eq!(kinds.iter().filter(|k| *k == "session_start").count(), 2);
}

#[tokio::test]
async fn unexpected_arguments_are_rejected_in_band() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ping_tool(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let err = session
        .execute("call_tool('ping', evil=1)")
        .await
        .expect_err("must fail");
    match &err {
        SecurerErr::ExecutionFailed(message) => {
            assert!(
                message.contains("Unexpected arguments for tool 'ping': 'evil'"),
                "{message}"
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The rejection was in-band; the session stays READY and the tool works
    // when called correctly.
    assert_eq!(session.state(), SessionState::Ready);
    let outcome = session.execute("call_tool('ping')").await.expect("execute");
    assert_eq!(outcome.value, json!("pong"));
    session.close().await;
}

#[tokio::test]
async fn unknown_tools_surface_as_execution_errors() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let err = session
        .execute("call_tool('missing')")
        .await
        .expect_err("must fail");
    match &err {
        SecurerErr::ExecutionFailed(message) => {
            assert!(message.contains("Unknown tool: missing"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await;
}

#[tokio::test]
async fn tool_call_cap_aborts_and_recovers() {
    require_python!();
    let policy = ExecPolicy {
        max_tool_calls: Some(2),
        timeout: Some(Duration::from_secs(10)),
        ..ExecPolicy::default()
    };
    let mut session = Supervisor::start(common::stand_in_config(), ping_tool(), policy)
        .await
        .expect("start");

    let err = session.execute("flood()").await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::ToolCallsExceeded(2)), "{err:?}");

    assert_eq!(session.state(), SessionState::Ready);
    let outcome = session.execute("1 + 1").await.expect("follow-up");
    assert_eq!(outcome.value, json!(2));
    session.close().await;
}

#[tokio::test]
async fn message_flood_trips_the_total_cap() {
    require_python!();
    // No tool-call cap, so the total-message cap defaults to 1000.
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(30)),
    )
    .await
    .expect("start");

    let err = session.execute("flood()").await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::IpcFlood(1000)), "{err:?}");

    assert_eq!(session.state(), SessionState::Ready);
    session.close().await;
}

#[tokio::test]
async fn execution_cap_is_enforced_before_dispatch() {
    require_python!();
    let policy = ExecPolicy {
        max_executions: Some(1),
        timeout: Some(Duration::from_secs(5)),
        ..ExecPolicy::default()
    };
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        policy,
    )
    .await
    .expect("start");

    session.execute("1 + 1").await.expect("first execute");
    let err = session.execute("2 + 2").await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::ExecutionCapReached(1)), "{err:?}");
    session.close().await;
}

#[tokio::test]
async fn policy_rejects_long_blocked_and_broken_code() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let long_policy = ExecPolicy {
        max_code_length: 8,
        ..ExecPolicy::default()
    };
    let err = session
        .execute_with("1 + 1 + 1 + 1", &long_policy)
        .await
        .expect_err("too long");
    assert!(matches!(err, SecurerErr::CodeTooLong(13, 8)), "{err:?}");

    let hook_policy = ExecPolicy {
        pre_execute_hook: Some(Arc::new(|code: &str| !code.contains("forbidden"))),
        ..ExecPolicy::default()
    };
    let err = session
        .execute_with("forbidden()", &hook_policy)
        .await
        .expect_err("blocked");
    assert!(matches!(err, SecurerErr::ExecutionBlocked), "{err:?}");

    let err = session
        .execute("mean(c(1, 2")
        .await
        .expect_err("syntax error");
    assert!(matches!(err, SecurerErr::Syntax(_)), "{err:?}");

    // None of the rejections consumed the session.
    let outcome = session.execute("1 + 1").await.expect("execute");
    assert_eq!(outcome.value, json!(2));
    session.close().await;
}

#[tokio::test]
async fn output_is_captured_labeled_and_capped() {
    require_python!();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let policy = ExecPolicy {
        timeout: Some(Duration::from_secs(5)),
        output_handler: Some(Arc::new(move |line: &securer_core::OutputLine| {
            sink.lock().expect("lock").push(line.text.clone());
        })),
        ..ExecPolicy::default()
    };
    let mut session = Supervisor::start(common::stand_in_config(), ToolRegistry::default(), policy)
        .await
        .expect("start");

    let outcome = session.execute("emit()").await.expect("execute");
    assert_eq!(outcome.value, json!(7));
    let stdout: Vec<&str> = outcome
        .output
        .iter()
        .filter(|l| l.stream == securer_core::OutputStream::Stdout)
        .map(|l| l.text.as_str())
        .collect();
    let stderr: Vec<&str> = outcome
        .output
        .iter()
        .filter(|l| l.stream == securer_core::OutputStream::Stderr)
        .map(|l| l.text.as_str())
        .collect();
    assert_eq!(stdout, vec!["line-1"]);
    assert_eq!(stderr, vec!["line-2"]);
    assert_eq!(
        seen.lock().expect("lock").len(),
        2,
        "handler sees every line"
    );

    // Excess lines are read and discarded, never stored.
    let capped_policy = ExecPolicy {
        timeout: Some(Duration::from_secs(5)),
        max_output_lines: Some(3),
        ..ExecPolicy::default()
    };
    let outcome = session
        .execute_with("chatty(50)", &capped_policy)
        .await
        .expect("execute");
    assert_eq!(outcome.value, json!(50));
    assert_eq!(outcome.output.len(), 3);
    session.close().await;
}

#[tokio::test]
async fn child_errors_leave_the_session_ready() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let err = session.execute("boom()").await.expect_err("must fail");
    match &err {
        SecurerErr::ExecutionFailed(message) => {
            assert!(message.contains("boom"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(session.state(), SessionState::Ready);
    let outcome = session.execute("1 + 1").await.expect("execute");
    assert_eq!(outcome.value, json!(2));
    session.close().await;
}

#[tokio::test]
async fn child_crash_recovers_transparently() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    let err = session.execute("die()").await.expect_err("must fail");
    assert!(
        matches!(err, SecurerErr::ExecutionFailed(_) | SecurerErr::Io(_)),
        "{err:?}"
    );

    // A fresh child is attached; the next execute succeeds.
    assert_eq!(session.state(), SessionState::Ready);
    let outcome = session.execute("1 + 1").await.expect("follow-up");
    assert_eq!(outcome.value, json!(2));
    session.close().await;
}

#[tokio::test]
async fn restart_resets_the_session() {
    require_python!();
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().join("audit.jsonl");

    let mut config = common::stand_in_config();
    config.audit_log = Some(audit_path.clone());

    let mut session = Supervisor::start(
        config,
        ToolRegistry::default(),
        common::policy_with_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("start");

    session.execute("1 + 1").await.expect("execute");
    assert_eq!(session.executions_used(), 1);

    session.restart().await.expect("restart");
    assert_eq!(session.executions_used(), 0);
    assert_eq!(session.state(), SessionState::Ready);

    let outcome = session.execute("2 + 2").await.expect("execute");
    assert_eq!(outcome.value, json!(4));
    session.close().await;

    let kinds = common::event_kinds(&common::read_events(&audit_path));
    assert!(kinds.contains(&"session_restart".to_string()));
}

#[tokio::test]
async fn closed_sessions_refuse_everything() {
    require_python!();
    let mut session = Supervisor::start(
        common::stand_in_config(),
        ToolRegistry::default(),
        ExecPolicy::default(),
    )
    .await
    .expect("start");

    session.close().await;
    assert!(!session.is_alive());

    let err = session.execute("1 + 1").await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::SessionNotRunning(_)), "{err:?}");

    let err = session.restart().await.expect_err("must fail");
    assert!(matches!(err, SecurerErr::SessionNotRunning(_)), "{err:?}");

    // Idempotent.
    session.close().await;
}
