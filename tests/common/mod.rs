//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use dispatch_core::{ContextRef, DispatcherRoleSet, ImmediateContext, InlineContext};
use dispatch_test::TestExecutor;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary. Filter with
/// `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("warn"))
            .unwrap_or_else(|_| EnvFilter::new("off"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(env_filter)
            .try_init();
    });
}

/// Shared ordered log that units of work append to.
#[derive(Clone)]
pub struct Log<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Log<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().expect("log lock").push(entry);
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().expect("log lock").clone()
    }
}

/// A complete role set where every role is a distinct test executor, with
/// `ui-immediate` wrapping `ui`.
pub struct SplitRoles {
    pub general: TestExecutor,
    pub io: TestExecutor,
    pub ui: TestExecutor,
    pub unconstrained: TestExecutor,
    pub roles: DispatcherRoleSet,
}

pub fn split_roles() -> SplitRoles {
    let general = TestExecutor::new();
    let io = TestExecutor::new();
    let ui = TestExecutor::new();
    let unconstrained = TestExecutor::new();
    let ui_ref = ui.context();
    let roles = DispatcherRoleSet::new(
        general.context(),
        io.context(),
        ui_ref.clone(),
        ImmediateContext::wrap(&ui_ref),
        unconstrained.context(),
    );
    SplitRoles {
        general,
        io,
        ui,
        unconstrained,
        roles,
    }
}

pub fn inline() -> ContextRef {
    InlineContext::shared()
}
