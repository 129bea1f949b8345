//! Error taxonomy.
//!
//! Cancellation is not a failure: [`TaskError::Cancelled`] is the
//! control signal a task's own handle observes, while [`ChildFailure`] is the
//! only thing a scope ever records against a child.

use thiserror::Error;

use crate::{Role, ScopeId, TaskId};

fn join_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|role| role.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A scope could not be constructed from the supplied configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A partial role set was supplied and no default role set exists to complete it.
    #[error("incomplete role set: no binding for {}", join_roles(.missing))]
    IncompleteRoles { missing: Vec<Role> },
    /// The production execution substrate could not be started.
    #[error("failed to start execution runtime: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}

impl ConfigurationError {
    /// Roles that were unbound, if that is what went wrong.
    #[must_use]
    pub fn missing_roles(&self) -> &[Role] {
        match self {
            Self::IncompleteRoles { missing } => missing,
            Self::Runtime { .. } => &[],
        }
    }
}

/// An unhandled fault in one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{task} on {role} in {scope} failed: {message}")]
pub struct ChildFailure {
    pub task: TaskId,
    pub scope: ScopeId,
    pub role: Role,
    pub message: String,
}

/// Why a task did not produce its value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task's lifetime was cancelled before it completed.
    #[error("task was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] ChildFailure),
}

impl TaskError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn failure(&self) -> Option<&ChildFailure> {
        match self {
            Self::Cancelled => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

/// A test scope was torn down with work still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "test scope leaked work: {pending} queued unit(s) of work, {unfinished} unfinished task(s)"
)]
pub struct LeakedWorkError {
    /// Units of work queued or scheduled on the virtual clock but never run.
    pub pending: usize,
    /// Spawned tasks that never ran to completion.
    pub unfinished: usize,
}
