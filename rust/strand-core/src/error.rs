//! Error model for the runtime.
//!
//! The runtime threads completion information through explicit `Result`
//! values rather than unwinding:
//!
//! * [`Fault`] — a type-erased business failure raised by task code.
//! * [`Cancelled`] — the cooperative-cancellation value observed at a
//!   suspension point. A timeout is a flavour of cancellation
//!   (see [`Cancelled::by_timeout`]).
//! * [`Cause`] — why a job reached a cancelled/failed terminal state.
//! * [`StrandError`] — the error half of [`Outcome`], either a cancellation
//!   or a failure.
//!
//! The first failure captured by a job becomes the root cause; failures
//! from siblings of the same parent are attached to it as suppressed
//! faults (deduplicated by `Arc` identity) so that nothing is lost
//! silently.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// A type-erased failure raised by task code.
pub type Fault = Arc<dyn Error + Send + Sync + 'static>;

/// Build a [`Fault`] from a plain message.
pub fn fault(message: impl Into<String>) -> Fault {
    Arc::new(MessageError(message.into()))
}

/// Build a [`Fault`] from an arbitrary error value.
pub fn fault_from<E: Error + Send + Sync + 'static>(error: E) -> Fault {
    Arc::new(error)
}

/// Result type returned by suspending operations and task bodies.
pub type Outcome<T> = Result<T, StrandError>;

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

/// A minimal string-only error, used for ad-hoc faults.
#[derive(Debug, Clone, ThisError)]
#[error("{0}")]
pub struct MessageError(pub String);

// ---------------------------------------------------------------------------
// Cancelled
// ---------------------------------------------------------------------------

/// The value delivered at a suspension point when the surrounding job has
/// been cancelled.
///
/// Carries an optional underlying [`Cause`] (for example the failure of a
/// sibling that triggered structural cancellation) and a flag marking
/// timeout-driven cancellation.
#[derive(Debug, Clone)]
pub struct Cancelled {
    message: String,
    by_timeout: bool,
    cause: Option<Cause>,
}

impl Cancelled {
    /// Plain cancellation with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            by_timeout: false,
            cause: None,
        }
    }

    /// Cancellation triggered by an underlying cause.
    pub fn with_cause(message: impl Into<String>, cause: Cause) -> Self {
        Self {
            message: message.into(),
            by_timeout: false,
            cause: Some(cause),
        }
    }

    /// Cancellation raised by a timeout expiry.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            by_timeout: true,
            cause: None,
        }
    }

    /// The human-readable cancellation message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// `true` when this cancellation was raised by a timeout.
    pub fn by_timeout(&self) -> bool {
        self.by_timeout
    }

    /// The underlying cause, if cancellation was triggered by one.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.by_timeout {
            write!(f, "timed out: {}", self.message)
        } else {
            write!(f, "cancelled: {}", self.message)
        }
    }
}

impl Error for Cancelled {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(Cause::Failed(failure)) => Some(failure.as_ref()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// The terminal failure of a job: the root fault plus any suppressed
/// faults collected from siblings while the job tree was draining.
#[derive(Debug, Clone)]
pub struct Failure {
    root: Fault,
    suppressed: Vec<Fault>,
}

impl Failure {
    pub fn new(root: Fault) -> Self {
        Self {
            root,
            suppressed: Vec::new(),
        }
    }

    pub fn with_suppressed(root: Fault, suppressed: Vec<Fault>) -> Self {
        Self { root, suppressed }
    }

    /// The first captured fault.
    pub fn root(&self) -> &Fault {
        &self.root
    }

    /// Later faults attached to the root (identity-deduplicated).
    pub fn suppressed(&self) -> &[Fault] {
        &self.suppressed
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.root.as_ref())
    }
}

/// Append `fault` to `list` unless an identical `Arc` is already present.
pub(crate) fn push_suppressed(list: &mut Vec<Fault>, new: &Fault, root: Option<&Fault>) {
    if let Some(root) = root {
        if Arc::ptr_eq(root, new) {
            return;
        }
    }
    if list.iter().any(|f| Arc::ptr_eq(f, new)) {
        return;
    }
    list.push(new.clone());
}

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// The terminal cause of a job. `None` at the API surface means the job
/// completed normally; a `Cause` distinguishes cooperative cancellation
/// from a real failure.
#[derive(Debug, Clone)]
pub enum Cause {
    /// The job was cancelled cooperatively.
    Cancelled(Arc<Cancelled>),
    /// The job failed with a business fault.
    Failed(Arc<Failure>),
}

impl Cause {
    /// `true` when the cause is a cooperative cancellation (including
    /// timeouts), as opposed to a business failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Cause::Cancelled(_))
    }

    /// `true` when the cause is a timeout-driven cancellation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Cause::Cancelled(c) if c.by_timeout())
    }

    /// The root fault when this cause is a failure.
    pub fn root_fault(&self) -> Option<&Fault> {
        match self {
            Cause::Failed(failure) => Some(failure.root()),
            Cause::Cancelled(_) => None,
        }
    }

    /// Convert into the error observed by joining/awaiting code.
    pub fn to_error(&self) -> StrandError {
        match self {
            Cause::Cancelled(c) => StrandError::Cancelled(c.clone()),
            Cause::Failed(failure) => {
                let fault: Fault = failure.clone();
                StrandError::Failed(fault)
            }
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Cancelled(c) => write!(f, "{}", c),
            Cause::Failed(failure) => write!(f, "{}", failure),
        }
    }
}

// ---------------------------------------------------------------------------
// StrandError
// ---------------------------------------------------------------------------

/// The error half of [`Outcome`].
#[derive(Debug, Clone, ThisError)]
pub enum StrandError {
    /// The current job was cancelled; observed at a suspension point.
    #[error("{0}")]
    Cancelled(Arc<Cancelled>),
    /// A business failure raised by task code.
    #[error("{0}")]
    Failed(Fault),
}

impl StrandError {
    /// A failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        StrandError::Failed(fault(message))
    }

    /// A failure wrapping an arbitrary error value.
    pub fn failed<E: Error + Send + Sync + 'static>(error: E) -> Self {
        StrandError::Failed(Arc::new(error))
    }

    /// A plain cancellation with a message.
    pub fn cancelled(message: impl Into<String>) -> Self {
        StrandError::Cancelled(Arc::new(Cancelled::new(message)))
    }

    /// `true` for cooperative cancellation (including timeouts).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StrandError::Cancelled(_))
    }

    /// `true` for timeout-driven cancellation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrandError::Cancelled(c) if c.by_timeout())
    }

    /// The fault carried by a failure, if any.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            StrandError::Failed(fault) => Some(fault),
            StrandError::Cancelled(_) => None,
        }
    }
}

impl From<Arc<Cancelled>> for StrandError {
    fn from(value: Arc<Cancelled>) -> Self {
        StrandError::Cancelled(value)
    }
}

impl From<Cancelled> for StrandError {
    fn from(value: Cancelled) -> Self {
        StrandError::Cancelled(Arc::new(value))
    }
}

/// Render a panic payload as a fault, preserving `&str`/`String` messages.
pub(crate) fn panic_fault(payload: Box<dyn std::any::Any + Send>) -> Fault {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    };
    fault(format!("panic: {message}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_display_and_flags() {
        let plain = Cancelled::new("job was cancelled");
        assert!(!plain.by_timeout());
        assert!(plain.to_string().contains("cancelled"));

        let timed = Cancelled::timeout("deadline passed");
        assert!(timed.by_timeout());
        assert!(timed.to_string().contains("timed out"));
    }

    #[test]
    fn cause_classification() {
        let cancel = Cause::Cancelled(Arc::new(Cancelled::new("stop")));
        assert!(cancel.is_cancellation());
        assert!(!cancel.is_timeout());
        assert!(cancel.root_fault().is_none());

        let fail = Cause::Failed(Arc::new(Failure::new(fault("boom"))));
        assert!(!fail.is_cancellation());
        assert_eq!(fail.root_fault().unwrap().to_string(), "boom");
    }

    #[test]
    fn cause_to_error_round_trip() {
        let fail = Cause::Failed(Arc::new(Failure::new(fault("boom"))));
        let err = fail.to_error();
        assert!(!err.is_cancellation());
        assert!(err.to_string().contains("boom"));

        let timed = Cause::Cancelled(Arc::new(Cancelled::timeout("late")));
        assert!(timed.to_error().is_timeout());
    }

    #[test]
    fn suppressed_deduplicates_by_identity() {
        let root = fault("root");
        let other = fault("other");
        let mut list = Vec::new();

        push_suppressed(&mut list, &other, Some(&root));
        push_suppressed(&mut list, &other, Some(&root));
        push_suppressed(&mut list, &root, Some(&root));
        assert_eq!(list.len(), 1);

        // A different Arc with the same message is a different fault.
        let other2 = fault("other");
        push_suppressed(&mut list, &other2, Some(&root));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn failure_display_counts_suppressed() {
        let failure = Failure::with_suppressed(fault("root"), vec![fault("extra")]);
        let text = failure.to_string();
        assert!(text.contains("root"));
        assert!(text.contains("+1 suppressed"));
    }

    #[test]
    fn panic_fault_extracts_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("deliberate");
        assert!(panic_fault(payload).to_string().contains("deliberate"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert!(panic_fault(payload).to_string().contains("panic"));
    }
}
