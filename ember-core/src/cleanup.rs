//! Explicit undo stack for multi-step resource construction.
//!
//! Each construction step pushes the future that undoes it. Futures are lazy,
//! so nothing runs until [`CleanupStack::unwind`] drives them last-in,
//! first-out. Every undo must be idempotent: it may run against a resource
//! that was only partially created, or already removed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Error type returned by undo steps.
pub type UndoError = Box<dyn std::error::Error + Send + Sync>;

type UndoFuture = Pin<Box<dyn Future<Output = Result<(), UndoError>> + Send>>;

/// A failed undo step.
#[derive(Debug)]
pub struct CleanupFailure {
    pub label: String,
    pub error: UndoError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.error)
    }
}

/// Labelled undo steps, unwound in reverse push order.
pub struct CleanupStack {
    scope: String,
    steps: Vec<(String, UndoFuture)>,
}

impl CleanupStack {
    /// Create an empty stack; `scope` tags log lines (e.g. the sandbox id).
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            steps: Vec::new(),
        }
    }

    /// Push an undo step. It does not start until [`unwind`](Self::unwind).
    pub fn push<F, E>(&mut self, label: impl Into<String>, undo: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<UndoError>,
    {
        let fut: UndoFuture = Box::pin(async move { undo.await.map_err(Into::into) });
        self.steps.push((label.into(), fut));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Labels in unwind order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().rev().map(|(label, _)| label.as_str())
    }

    /// Drop every step without running it, once the resources have been
    /// handed to a new owner.
    pub fn dismiss(mut self) {
        self.steps.clear();
    }

    /// Run every step in reverse order.
    ///
    /// A failing step is logged and recorded; the remaining steps still run.
    pub async fn unwind(mut self) -> Vec<CleanupFailure> {
        let steps = std::mem::take(&mut self.steps);
        let mut failures = Vec::new();
        for (label, undo) in steps.into_iter().rev() {
            match undo.await {
                Ok(()) => tracing::debug!(scope = %self.scope, step = %label, "cleanup step done"),
                Err(error) => {
                    tracing::warn!(
                        scope = %self.scope,
                        step = %label,
                        %error,
                        "cleanup step failed"
                    );
                    failures.push(CleanupFailure { label, error });
                }
            }
        }
        failures
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field("scope", &self.scope)
            .field("steps", &self.labels().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            let leaked: Vec<&str> = self.labels().collect();
            tracing::warn!(scope = %self.scope, ?leaked, "cleanup stack dropped without unwinding");
        }
    }
}
