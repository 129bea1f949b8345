//! Dispatcher roles and the fixed-size map keyed by them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of dispatcher roles. Every complete role set binds exactly this many.
pub const ROLE_COUNT: usize = 5;

/// A named concurrency purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// CPU-bound general-purpose work.
    General,
    /// Blocking or I/O-bound work.
    Io,
    /// The single ordered UI thread.
    Ui,
    /// The UI thread, running synchronously when already on it.
    UiImmediate,
    /// No thread affinity: runs wherever it is resumed.
    Unconstrained,
}

impl Role {
    pub const ALL: [Role; ROLE_COUNT] = [
        Role::General,
        Role::Io,
        Role::Ui,
        Role::UiImmediate,
        Role::Unconstrained,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Role::General => 0,
            Role::Io => 1,
            Role::Ui => 2,
            Role::UiImmediate => 3,
            Role::Unconstrained => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::General => "general",
            Role::Io => "io",
            Role::Ui => "ui",
            Role::UiImmediate => "ui-immediate",
            Role::Unconstrained => "unconstrained",
        }
    }

    /// Parse a role name. Also accepts the alternate names
    /// (`default`, `main`, `main-immediate`, `unconfined`) as well.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "general" | "default" => Some(Role::General),
            "io" => Some(Role::Io),
            "ui" | "main" => Some(Role::Ui),
            "ui-immediate" | "main-immediate" => Some(Role::UiImmediate),
            "unconstrained" | "unconfined" => Some(Role::Unconstrained),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per role, stored in a fixed array indexed by [`Role::index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMap<T>([T; ROLE_COUNT]);

impl<T> RoleMap<T> {
    pub fn from_fn(mut f: impl FnMut(Role) -> T) -> Self {
        Self(Role::ALL.map(&mut f))
    }

    #[must_use]
    pub fn get(&self, role: Role) -> &T {
        &self.0[role.index()]
    }

    pub fn set(&mut self, role: Role, value: T) {
        self.0[role.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        Role::ALL.into_iter().zip(self.0.iter())
    }

    pub fn map<U>(self, mut f: impl FnMut(Role, T) -> U) -> RoleMap<U> {
        let [general, io, ui, ui_immediate, unconstrained] = self.0;
        RoleMap([
            f(Role::General, general),
            f(Role::Io, io),
            f(Role::Ui, ui),
            f(Role::UiImmediate, ui_immediate),
            f(Role::Unconstrained, unconstrained),
        ])
    }
}

impl<T> RoleMap<Option<T>> {
    /// All-`None` map.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_fn(|_| None)
    }

    /// Roles without a value, in role order.
    #[must_use]
    pub fn missing(&self) -> Vec<Role> {
        self.iter()
            .filter(|(_, value)| value.is_none())
            .map(|(role, _)| role)
            .collect()
    }

    /// Convert to a complete map, or report the missing roles.
    pub fn complete(self) -> Result<RoleMap<T>, Vec<Role>> {
        let missing = self.missing();
        match self.0 {
            [
                Some(general),
                Some(io),
                Some(ui),
                Some(ui_immediate),
                Some(unconstrained),
            ] => Ok(RoleMap([general, io, ui, ui_immediate, unconstrained])),
            _ => Err(missing),
        }
    }
}

impl<T> Default for RoleMap<Option<T>> {
    fn default() -> Self {
        Self::empty()
    }
}
