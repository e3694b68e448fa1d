//! The duplicate-and-return state machine
//!
//! ```text
//! Idle -> MenuOpening -> AwaitingSave -> PostSaveRestore -> Idle
//!   \__________\_______________\__________________________/  (abort)
//! ```
//!
//! Each waiting state is a scheduler task polling the host. Progress stops
//! the task and installs the next one; reaching the retry ceiling or a failed
//! simulated click aborts the run with a full cleanup.
//!
//! Every run owns a cancellation token. Cleanup cancels it under the state
//! lock, so work that outlives its timer (the post-save restore) can tell
//! whether the run it belongs to is still the current one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::errors::DuplicatorError;
use crate::host::Host;
use crate::inject::Injector;
use crate::probe::{MenuState, Probes};
use crate::scheduler::{AbortReason, Probe, Scheduler, TaskName, Tick};
use crate::view::{RestoreOutcome, ViewContext, ViewRestorer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    MenuOpening,
    AwaitingSave,
    PostSaveRestore,
}

/// Mutable state of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowState {
    pub phase: Phase,
    pub original_location: Option<String>,
    pub view_context: Option<ViewContext>,
    /// Day picker token seen when the duplicate action was invoked
    pub highlighted_day: Option<String>,
}

impl WorkflowState {
    pub fn is_running(&self) -> bool {
        self.phase != Phase::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Stop timers, remove controls, clear the running flag
    Runtime,
    /// Runtime cleanup plus discarding the captured location and context
    Full,
}

/// One workflow context: state, scheduler and the collaborators it drives.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

struct WorkflowInner {
    probes: Probes,
    restorer: ViewRestorer,
    injector: Injector,
    scheduler: Scheduler<TaskName>,
    config: Config,
    state: Mutex<WorkflowState>,
    /// Token of the current run; only replaced or cancelled with `state` held
    run: Mutex<CancellationToken>,
}

impl Workflow {
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let probes = Probes::new(host, config.markers.clone());
        let injector = Injector::new(probes.clone(), &config);
        Self::with_injector(probes, injector, config)
    }

    pub fn with_injector(probes: Probes, injector: Injector, config: Config) -> Self {
        let restorer = ViewRestorer::new(probes.clone(), &config);
        Self {
            inner: Arc::new(WorkflowInner {
                scheduler: Scheduler::new(config.timings.max_retries),
                probes,
                restorer,
                injector,
                config,
                state: Mutex::new(WorkflowState::default()),
                run: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().is_running()
    }

    pub fn state(&self) -> WorkflowState {
        self.inner.state().clone()
    }

    pub fn scheduler(&self) -> &Scheduler<TaskName> {
        &self.inner.scheduler
    }

    pub fn injector(&self) -> &Injector {
        &self.inner.injector
    }

    /// Begin a run. Returns `Ok(false)` without touching anything when a run
    /// is already active.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<bool, DuplicatorError> {
        {
            let mut state = self.inner.state();
            if state.is_running() {
                debug!(phase = ?state.phase, "Workflow already running; ignoring start");
                return Ok(false);
            }
            state.phase = Phase::MenuOpening;
            let previous = std::mem::replace(&mut *self.inner.run(), CancellationToken::new());
            previous.cancel();
        }
        info!("Starting duplicate workflow");

        let host = self.inner.probes.host();
        let markers = self.inner.probes.markers();
        if let Err(e) = host.set_body_class(&markers.active_body_class, true).await {
            warn!(error = %e, "Could not set active marker");
        }

        let location = match host.location().await {
            Ok(location) => location,
            Err(e) => {
                error!(error = %e, "Cannot read current location; aborting");
                self.cleanup(Cleanup::Full).await;
                return Err(e);
            }
        };

        let item_id = match self.inner.probes.open_panel_item_id().await {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "Could not resolve originating item");
                None
            }
        };
        let context = match self.inner.restorer.capture(item_id.clone()).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "View capture failed; falling back to location only");
                let mut context = ViewContext::from_location(&location, self.inner.restorer.rules());
                context.originating_item_id = item_id;
                context
            }
        };

        {
            let mut state = self.inner.state();
            if state.phase != Phase::MenuOpening {
                // Cleaned up while capturing
                return Ok(false);
            }
            state.original_location = Some(location);
            state.view_context = Some(context);
        }

        self.inner.scheduler.start(
            TaskName::Duplicate,
            self.inner.config.timings.poll_interval(),
            MenuStep {
                workflow: self.clone(),
            },
        );
        Ok(true)
    }

    /// Abandon the current run, if any, with a full cleanup.
    pub async fn abort(&self, reason: &str) {
        if self.is_running() {
            error!(%reason, "Duplicate workflow aborted");
        }
        self.cleanup(Cleanup::Full).await;
    }

    pub async fn cleanup(&self, kind: Cleanup) {
        self.cleanup_run(kind, None).await;
    }

    /// Cleanup on behalf of `run`: skipped when that run has already ended,
    /// so it can never tear down a newer one.
    async fn cleanup_run(&self, kind: Cleanup, run: Option<&CancellationToken>) -> bool {
        {
            let mut state = self.inner.state();
            if run.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            self.inner.run().cancel();
            state.phase = Phase::Idle;
            if kind == Cleanup::Full {
                state.original_location = None;
                state.view_context = None;
                state.highlighted_day = None;
            }
        }
        self.inner.scheduler.stop_all();
        self.inner.scheduler.clear_retries();
        self.inner.injector.stop_healing();

        let host = self.inner.probes.host();
        let markers = self.inner.probes.markers();
        match host.remove_all(&markers.custom_control()).await {
            Ok(removed) => debug!(removed, "Removed injected controls"),
            Err(e) => warn!(error = %e, "Could not remove injected controls"),
        }
        if let Err(e) = host.set_body_class(&markers.active_body_class, false).await {
            warn!(error = %e, "Could not clear active marker");
        }
        debug!(?kind, "Workflow cleaned up");
        true
    }

    fn advance(&self, from: Phase, to: Phase) -> bool {
        let mut state = self.inner.state();
        if state.phase != from {
            return false;
        }
        state.phase = to;
        info!(?from, ?to, "Workflow transition");
        true
    }

    fn start_save(&self) {
        self.inner.scheduler.start(
            TaskName::Save,
            self.inner.config.timings.poll_interval(),
            SaveStep {
                workflow: self.clone(),
            },
        );
    }

    async fn post_save(&self, run: CancellationToken) {
        let context = {
            let mut state = self.inner.state();
            if run.is_cancelled() || state.phase != Phase::PostSaveRestore {
                debug!("Run ended before view restore");
                return;
            }
            state.view_context.take()
        };

        // Let the host finish its own post-save redirects
        tokio::select! {
            _ = run.cancelled() => {
                debug!("Run ended while settling after save");
                return;
            }
            _ = tokio::time::sleep(self.inner.config.timings.post_save_settle()) => {}
        }

        match context {
            Some(context) => match self.inner.restorer.restore(&context, &run).await {
                RestoreOutcome::Restored { reopened } => {
                    info!(reopened, "Duplicate saved and view restored")
                }
                RestoreOutcome::Cancelled => {
                    debug!("Run ended during view restore");
                    return;
                }
                outcome => warn!(?outcome, "Duplicate saved; view restore incomplete"),
            },
            None => warn!("Duplicate saved; no view context to restore"),
        }
        if !self.cleanup_run(Cleanup::Runtime, Some(&run)).await {
            debug!("Run ended during view restore; leaving the current run alone");
        }
    }
}

impl WorkflowInner {
    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) -> MutexGuard<'_, CancellationToken> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `MenuOpening`: open the options menu until the duplicate action shows.
struct MenuStep {
    workflow: Workflow,
}

#[async_trait]
impl Probe for MenuStep {
    async fn poll(&self) -> Tick {
        let wf = &self.workflow;
        if wf.phase() != Phase::MenuOpening {
            return Tick::Done;
        }
        let probes = &wf.inner.probes;
        match probes.menu_state().await {
            Ok(MenuState::DuplicateReady) => {
                match probes.highlighted_day().await {
                    Ok(Some(day)) => {
                        debug!(%day, "Captured highlighted day");
                        wf.inner.state().highlighted_day = Some(day);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Day picker probe failed"),
                }
                match probes.invoke_duplicate().await {
                    Ok(true) => {
                        if wf.advance(Phase::MenuOpening, Phase::AwaitingSave) {
                            wf.start_save();
                        }
                        Tick::Done
                    }
                    Ok(false) => Tick::Retry,
                    Err(e) => Tick::Abort(e.to_string()),
                }
            }
            Ok(MenuState::Closed) => match probes.open_options().await {
                Ok(_) => Tick::Retry,
                Err(e) => Tick::Abort(e.to_string()),
            },
            Ok(MenuState::Absent) => Tick::Retry,
            Err(e) => {
                debug!(error = %e, "Menu probe failed");
                Tick::Retry
            }
        }
    }

    async fn on_abort(&self, reason: AbortReason) {
        error!(task = %TaskName::Duplicate, %reason, "Duplicate step failed");
        self.workflow.abort(&reason.to_string()).await;
    }
}

/// `AwaitingSave`: click save once it appears, then hand over to restore.
struct SaveStep {
    workflow: Workflow,
}

#[async_trait]
impl Probe for SaveStep {
    async fn poll(&self) -> Tick {
        let wf = &self.workflow;
        if wf.phase() != Phase::AwaitingSave {
            return Tick::Done;
        }
        let probes = &wf.inner.probes;
        match probes.save_present().await {
            Ok(true) => {}
            Ok(false) => return Tick::Retry,
            Err(e) => {
                debug!(error = %e, "Save probe failed");
                return Tick::Retry;
            }
        }

        wf.inner.scheduler.stop(&TaskName::Duplicate);
        match probes.click_save().await {
            Ok(true) => {
                if wf.advance(Phase::AwaitingSave, Phase::PostSaveRestore) {
                    let next = wf.clone();
                    let run = wf.inner.run().clone();
                    wf.inner.scheduler.after(
                        TaskName::Restore,
                        wf.inner.config.timings.save_settle(),
                        async move { next.post_save(run).await },
                    );
                }
                Tick::Done
            }
            Ok(false) => Tick::Retry,
            Err(e) => Tick::Abort(e.to_string()),
        }
    }

    async fn on_abort(&self, reason: AbortReason) {
        error!(task = %TaskName::Save, %reason, "Save step failed");
        self.workflow.abort(&reason.to_string()).await;
    }
}
