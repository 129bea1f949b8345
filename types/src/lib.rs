//! Core domain types for dispatch.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the five dispatcher roles, the
//! supervision and merge policies, element names, identifiers, and the error
//! taxonomy shared by scopes, tasks and test scopes.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod errors;
mod ids;
mod role;

pub use errors::{ChildFailure, ConfigurationError, LeakedWorkError, TaskError};
pub use ids::{ContextId, OwnerId, ScopeId, TaskId};
pub use role::{ROLE_COUNT, Role, RoleMap};

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Supervision & Merge Policies
// ============================================================================

/// How a scope reacts when one of its children fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Supervision {
    /// A failing child is recorded and logged; siblings keep running.
    #[default]
    Isolated,
    /// The first failing child cancels the whole scope (all-or-nothing).
    Shared,
}

impl Supervision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Shared => "shared",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" | "supervisor" => Some(Self::Isolated),
            "shared" | "job" => Some(Self::Shared),
            _ => None,
        }
    }

    #[must_use]
    pub const fn propagates_failure(self) -> bool {
        matches!(self, Self::Shared)
    }
}

impl fmt::Display for Supervision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a merge does when the `ui-immediate` binding does not line up with `ui`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediatePolicy {
    /// Replace a mismatched `ui-immediate` with an immediate wrapper around `ui`.
    #[default]
    Reconcile,
    /// Keep whatever `ui-immediate` binding the merge produced.
    Preserve,
}

impl ImmediatePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reconcile => "reconcile",
            Self::Preserve => "preserve",
        }
    }
}

// ============================================================================
// Element Names
// ============================================================================

/// Name of an extra scope element. Guaranteed non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementName(String);

#[derive(Debug, Error)]
#[error("element name must not be empty")]
pub struct EmptyElementNameError;

impl ElementName {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyElementNameError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyElementNameError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ElementName {
    type Error = EmptyElementNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ElementName {
    type Error = EmptyElementNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ElementName> for String {
    fn from(value: ElementName) -> Self {
        value.0
    }
}

impl Borrow<str> for ElementName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
