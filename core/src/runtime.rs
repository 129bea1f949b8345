//! Production execution substrate.
//!
//! `general` runs on a tokio multi-thread runtime, `io` on that runtime's
//! blocking pool, and `ui` on one dedicated OS thread draining a FIFO.
//! `ui-immediate` wraps `ui`; `unconstrained` runs inline.

use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;

use dispatch_config::RuntimeConfig;
use dispatch_types::{ConfigurationError, ContextId};

use crate::context::{
    ContextRef, ExecutionContext, ImmediateContext, InlineContext, Job, TimerHandle, next_context_id,
};
use crate::roles::DispatcherRoleSet;

thread_local! {
    static RUNNING_ON: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Marks the current thread as running a job of `id` until dropped.
struct RunningGuard(Option<ContextId>);

impl RunningGuard {
    fn enter(id: ContextId) -> Self {
        Self(RUNNING_ON.with(|cell| cell.replace(Some(id))))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING_ON.with(|cell| cell.set(self.0));
    }
}

fn running_on(id: ContextId) -> bool {
    RUNNING_ON.with(|cell| cell.get() == Some(id))
}

// ============================================================================
// Pool contexts
// ============================================================================

/// `general`: jobs become tasks on the tokio worker pool.
#[derive(Debug)]
pub struct WorkerContext {
    id: ContextId,
    label: String,
    handle: Handle,
}

impl WorkerContext {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            id: next_context_id(),
            label: "general".to_string(),
            handle,
        }
    }
}

impl ExecutionContext for WorkerContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Job) {
        let id = self.id;
        self.handle.spawn(async move {
            let _running = RunningGuard::enter(id);
            job();
        });
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        let id = self.id;
        let sleeper = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _running = RunningGuard::enter(id);
            job();
        });
        TimerHandle::new(move || sleeper.abort())
    }

    fn is_current(&self) -> bool {
        running_on(self.id)
    }
}

/// `io`: jobs run on the blocking pool, capped by `max_io_threads`.
#[derive(Debug)]
pub struct BlockingContext {
    id: ContextId,
    label: String,
    handle: Handle,
}

impl BlockingContext {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            id: next_context_id(),
            label: "io".to_string(),
            handle,
        }
    }
}

impl ExecutionContext for BlockingContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Job) {
        let id = self.id;
        self.handle.spawn_blocking(move || {
            let _running = RunningGuard::enter(id);
            job();
        });
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        let id = self.id;
        let handle = self.handle.clone();
        let sleeper = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            handle.spawn_blocking(move || {
                let _running = RunningGuard::enter(id);
                job();
            });
        });
        TimerHandle::new(move || sleeper.abort())
    }

    fn is_current(&self) -> bool {
        running_on(self.id)
    }
}

// ============================================================================
// UI thread
// ============================================================================

enum UiMessage {
    Run(Job),
    Shutdown,
}

/// `ui`: a single named thread running jobs strictly in submission order.
pub struct UiThreadContext {
    id: ContextId,
    label: String,
    sender: mpsc::UnboundedSender<UiMessage>,
    thread: ThreadId,
    timers: Handle,
}

impl UiThreadContext {
    fn send(&self, job: Job) {
        if self.sender.send(UiMessage::Run(job)).is_err() {
            tracing::debug!(context = %self.id, "UI thread stopped, job dropped");
        }
    }

    fn stop(&self) {
        let _ = self.sender.send(UiMessage::Shutdown);
    }
}

impl ExecutionContext for UiThreadContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Job) {
        self.send(job);
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        let sender = self.sender.clone();
        let sleeper = self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(UiMessage::Run(job));
        });
        TimerHandle::new(move || sleeper.abort())
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }
}

impl fmt::Debug for UiThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiThreadContext")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

fn ui_loop(mut rx: mpsc::UnboundedReceiver<UiMessage>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            UiMessage::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Job panicked on the UI thread");
                }
            }
            UiMessage::Shutdown => break,
        }
    }
    tracing::debug!("UI thread exiting");
}

fn start_ui_thread(
    name: &str,
    timers: Handle,
) -> Result<(Arc<UiThreadContext>, thread::JoinHandle<()>), ConfigurationError> {
    let (sender, rx) = mpsc::unbounded_channel();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || ui_loop(rx))
        .map_err(|source| ConfigurationError::Runtime { source })?;
    let context = Arc::new(UiThreadContext {
        id: next_context_id(),
        label: "ui".to_string(),
        sender,
        thread: join.thread().id(),
        timers,
    });
    Ok((context, join))
}

// ============================================================================
// ProductionRuntime
// ============================================================================

/// Owns the worker runtime and the UI thread behind the production role set.
pub struct ProductionRuntime {
    config: RuntimeConfig,
    roles: DispatcherRoleSet,
    ui: Arc<UiThreadContext>,
    runtime: Mutex<Option<Runtime>>,
    ui_join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProductionRuntime {
    pub fn start(config: &RuntimeConfig) -> Result<Self, ConfigurationError> {
        let mut builder = Builder::new_multi_thread();
        if let Some(workers) = config.worker_threads.filter(|n| *n > 0) {
            builder.worker_threads(workers);
        }
        let runtime = builder
            .max_blocking_threads(config.max_io_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .map_err(|source| ConfigurationError::Runtime { source })?;
        let handle = runtime.handle().clone();

        let (ui, ui_join) = start_ui_thread(&config.ui_thread_name, handle.clone())?;
        let ui_ref: ContextRef = ui.clone();

        let roles = DispatcherRoleSet::new(
            Arc::new(WorkerContext::new(handle.clone())),
            Arc::new(BlockingContext::new(handle)),
            Arc::clone(&ui_ref),
            ImmediateContext::wrap(&ui_ref),
            Arc::new(InlineContext::named("unconstrained")),
        );

        tracing::info!(
            workers = ?config.worker_threads,
            max_io_threads = config.max_io_threads,
            ui_thread = %config.ui_thread_name,
            "Dispatch runtime started"
        );

        Ok(Self {
            config: config.clone(),
            roles,
            ui,
            runtime: Mutex::new(Some(runtime)),
            ui_join: Mutex::new(Some(ui_join)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Complete production bindings for all five roles.
    #[must_use]
    pub fn roles(&self) -> &DispatcherRoleSet {
        &self.roles
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the UI thread and the worker runtime. Later dispatches drop their
    /// jobs, which completes pending tasks as cancelled. Idempotent.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        self.ui.stop();
        let join = self
            .ui_join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join
            && !self.ui.is_current()
            && join.join().is_err()
        {
            tracing::warn!("UI thread panicked during shutdown");
        }

        runtime.shutdown_background();
        tracing::info!("Dispatch runtime stopped");
    }
}

impl Drop for ProductionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ProductionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductionRuntime")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}
