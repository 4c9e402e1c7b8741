//! Child runtime injection: the snippet evaluated by the interpreter at
//! launch, and the argv assembly that delivers it.
//!
//! The runtime connects to the rendezvous socket, authenticates, scrubs the
//! rendezvous variables from its environment, seals the channel behind a
//! refusing accessor, publishes `call_tool`, locks every injected binding,
//! shadows the unlock/namespace reflection primitives, and then services
//! `inject`/`execute` frames until the channel closes. None of the
//! child-side hardening is trusted; the parent enforces everything that
//! matters.

use crate::config::ChildCommand;
use crate::config::SessionConfig;

const CHILD_RUNTIME_TEMPLATE: &str = include_str!("child_runtime.R");

/// The program text the child evaluates. Tests substitute a stand-in runner
/// via `SessionConfig::runtime_template`.
pub(crate) fn runtime_snippet(config: &SessionConfig) -> &str {
    config
        .runtime_template
        .as_deref()
        .unwrap_or(CHILD_RUNTIME_TEMPLATE)
}

/// Full argv for the interpreter (or its sandbox wrapper, which forwards
/// `"$@"`): the configured fixed arguments, then the eval flag carrying the
/// runtime snippet.
pub(crate) fn build_child_args(child: &ChildCommand, snippet: &str) -> Vec<String> {
    let mut args = child.args.clone();
    args.push(child.eval_flag.clone());
    args.push(snippet.to_string());
    args
}
