//! Provider and callback traits
//!
//! These traits let the orchestration core run against any cloud client:
//! the real API client, a local sandbox, or a fake in tests. Nothing in this
//! crate performs network calls itself.

use crate::report::OpReport;
use crate::types::{Outputs, Properties, ResourceKind};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Categories of provider errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rate limiting (transient, retryable)
    Throttled,
    /// A just-created dependency is not visible yet (transient, retryable)
    NotYetConsistent,
    /// Conflict on create, typically left by a previous partial run (retryable)
    Conflict,
    /// The addressed resource does not exist
    NotFound,
    /// The request itself is invalid; retrying cannot help
    Invalid,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Whether this category is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled | Self::NotYetConsistent | Self::Conflict)
    }

    /// User-facing description of this category
    pub fn description(&self) -> &'static str {
        match self {
            Self::Throttled => "Provider rate limit",
            Self::NotYetConsistent => "Eventual-consistency lag",
            Self::Conflict => "Conflict with existing resource",
            Self::NotFound => "Resource not found",
            Self::Invalid => "Invalid request",
            Self::Other => "Unexpected provider error",
        }
    }
}

/// Errors returned by a [`Provider`]
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("throttled: {0}")]
    Throttled(String),

    #[error("not yet consistent: {0}")]
    NotYetConsistent(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Throttled(_) => ErrorCategory::Throttled,
            Self::NotYetConsistent(_) => ErrorCategory::NotYetConsistent,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Invalid(_) => ErrorCategory::Invalid,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// A resource as reported by the provider after create or lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realized {
    pub identity: String,
    pub outputs: Outputs,
}

impl Realized {
    pub fn new(identity: impl Into<String>, outputs: Outputs) -> Self {
        Self {
            identity: identity.into(),
            outputs,
        }
    }
}

/// Cloud provider client
///
/// Properties passed in are fully resolved: every deferred reference has
/// been substituted by the output resolver. Calls may block for the length
/// of the network round trip; the executor runs them on worker threads.
pub trait Provider: Send + Sync {
    /// Create a resource and return its identity and output attributes
    fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Realized, ProviderError>;

    /// Update a resource in place and return its refreshed outputs
    fn update(
        &self,
        kind: ResourceKind,
        identity: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError>;

    /// Delete a resource
    fn delete(&self, kind: ResourceKind, identity: &str) -> Result<(), ProviderError>;

    /// Find a resource created for `logical_id` by an interrupted run
    ///
    /// The default never finds anything, which makes reconciliation fall
    /// back to a plain create.
    fn lookup(
        &self,
        _kind: ResourceKind,
        _logical_id: &str,
    ) -> Result<Option<Realized>, ProviderError> {
        Ok(None)
    }
}

impl<P: Provider + ?Sized> Provider for &P {
    fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Realized, ProviderError> {
        (**self).create(kind, logical_id, properties)
    }

    fn update(
        &self,
        kind: ResourceKind,
        identity: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        (**self).update(kind, identity, properties)
    }

    fn delete(&self, kind: ResourceKind, identity: &str) -> Result<(), ProviderError> {
        (**self).delete(kind, identity)
    }

    fn lookup(
        &self,
        kind: ResourceKind,
        logical_id: &str,
    ) -> Result<Option<Realized>, ProviderError> {
        (**self).lookup(kind, logical_id)
    }
}

/// Progress callback for execution
///
/// Called from the scheduler thread only, so implementations need not be
/// thread-safe beyond `Send`.
pub trait ProgressCallback: Send {
    /// Called once before dispatch with the number of operations that will run
    fn on_run_start(&mut self, total: usize);

    /// Called when an operation is dispatched to a worker
    fn on_operation_start(&mut self, key: &str, description: &str);

    /// Called when a worker backs off before retrying a transient failure
    fn on_retry(&mut self, key: &str, attempt: u32, error: &ProviderError, delay: Duration);

    /// Called when an operation reaches a terminal state
    fn on_operation_complete(&mut self, report: &OpReport);

    /// Called before a succeeded operation is undone
    fn on_rollback(&mut self, key: &str);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _total: usize) {}
    fn on_operation_start(&mut self, _key: &str, _description: &str) {}
    fn on_retry(&mut self, _key: &str, _attempt: u32, _error: &ProviderError, _delay: Duration) {}
    fn on_operation_complete(&mut self, _report: &OpReport) {}
    fn on_rollback(&mut self, _key: &str) {}
}

/// Cooperative cancellation signal shared between the caller and the executor
///
/// Cancelling stops dispatch of new operations; operations already in
/// flight run to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ProviderError::Throttled("slow down".into()).is_retryable());
        assert!(ProviderError::NotYetConsistent("role".into()).is_retryable());
        assert!(ProviderError::Conflict("exists".into()).is_retryable());
        assert!(!ProviderError::Invalid("bad cidr".into()).is_retryable());
        assert!(!ProviderError::NotFound("gone".into()).is_retryable());
        assert!(!ProviderError::Other("boom".into()).is_retryable());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_deadline() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        let token = CancelToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }
}
