//! Process-wide delivery of failures nobody observes.
//!
//! Failures escaping a fire-and-forget task, a completion handler, or an
//! undelivered-element callback are routed here when the task's context
//! carries no failure handler. The registry is append-only and never torn
//! down; with no hooks registered, failures are logged.

use once_cell::sync::Lazy;
use std::sync::RwLock;

use crate::context::FailureHandler;
use crate::error::Fault;

static HOOKS: Lazy<RwLock<Vec<FailureHandler>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Register a process-wide hook for unhandled failures. Hooks cannot be
/// removed; every registered hook sees every unhandled failure.
pub fn register_failure_hook(hook: FailureHandler) {
    HOOKS.write().unwrap().push(hook);
}

/// Deliver `fault` to the context handler if present, otherwise to the
/// process-wide hooks, otherwise to the log.
pub(crate) fn deliver_unhandled(context_handler: Option<&FailureHandler>, fault: &Fault) {
    if let Some(handler) = context_handler {
        handler(fault);
        return;
    }
    let hooks = HOOKS.read().unwrap();
    if hooks.is_empty() {
        tracing::error!(fault = %fault, "unhandled task failure");
    } else {
        for hook in hooks.iter() {
            hook(fault);
        }
    }
}
