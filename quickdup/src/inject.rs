//! Injection of the duplicate control into detail panels, with self-healing
//!
//! The host builds detail panels asynchronously and may re-render their
//! children at any time, wiping nodes it does not recognise. Injection is
//! therefore debounced per panel, deferred until the panel looks finished,
//! and followed by a bounded heal window during which the control is put back
//! whenever it disappears. Every binding is keyed by the panel handle and is
//! dropped as soon as the panel leaves the document.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, Timings};
use crate::errors::DuplicatorError;
use crate::host::PanelId;
use crate::locale::duplicate_label;
use crate::markup::{render_control, ControlTemplate};
use crate::probe::Probes;
use crate::scheduler::{AbortReason, Probe, Scheduler, TaskName, Tick};

/// Result of one injection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected,
    /// The control was already there; nothing was inserted
    AlreadyPresent,
    /// The panel is still being built; a new attempt was scheduled
    Deferred,
    /// The panel left the document
    Detached,
}

#[derive(Clone)]
pub struct Injector {
    inner: Arc<InjectorInner>,
}

struct InjectorInner {
    probes: Probes,
    /// Configured label, or the one resolved from the host's language
    label: Mutex<Option<&'static str>>,
    timings: Timings,
    debounce: Scheduler<PanelId>,
    heal: Scheduler<PanelId>,
    panel_wait: Scheduler<TaskName>,
    watchers: Mutex<HashMap<PanelId, JoinHandle<()>>>,
}

impl Injector {
    pub fn new(probes: Probes, config: &Config) -> Self {
        Self {
            inner: Arc::new(InjectorInner {
                probes,
                label: Mutex::new(config.language.as_deref().map(|tag| duplicate_label(Some(tag)))),
                timings: config.timings.clone(),
                // Debounce timers are one-shots and heal rechecks end at their
                // deadline, so neither needs a retry ceiling.
                debounce: Scheduler::new(u32::MAX),
                heal: Scheduler::new(u32::MAX),
                panel_wait: Scheduler::new(config.timings.panel_wait_polls()),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.inner.label().unwrap_or_else(|| duplicate_label(None))
    }

    /// The label to render. Without a configured language the host is asked
    /// once; a failed read falls back to English and is retried next time.
    async fn resolve_label(&self) -> &'static str {
        let cached = *self.inner.label();
        if let Some(label) = cached {
            return label;
        }
        match self.inner.probes.host().language().await {
            Ok(tag) => {
                let label = duplicate_label(tag.as_deref());
                debug!(?tag, %label, "Resolved control label from host language");
                *self.inner.label() = Some(label);
                label
            }
            Err(e) => {
                debug!(error = %e, "Could not read host language");
                duplicate_label(None)
            }
        }
    }

    /// Schedule injection into every open detail panel. When none is open
    /// yet, keep looking for one for the panel wait window.
    #[instrument(skip(self))]
    pub async fn request(&self, item_id: Option<String>) -> Result<usize, DuplicatorError> {
        let markers = self.inner.probes.markers();
        let panels = self
            .inner
            .probes
            .host()
            .panels(&markers.detail_panel())
            .await?;
        if panels.is_empty() {
            debug!("No detail panel yet; waiting for one to appear");
            self.inner.panel_wait.start(
                TaskName::Inject,
                self.inner.timings.poll_interval(),
                PanelWait {
                    injector: self.clone(),
                    item_id,
                },
            );
            return Ok(0);
        }
        let count = panels.len();
        for panel in panels {
            self.schedule(panel, item_id.clone());
        }
        Ok(count)
    }

    /// Debounced injection: repeated calls for the same panel inside the
    /// debounce window collapse into one attempt.
    pub fn schedule(&self, panel: PanelId, item_id: Option<String>) {
        let this = self.clone();
        let key = panel.clone();
        self.inner
            .debounce
            .after(panel, self.inner.timings.injection_debounce(), async move {
                match this.inject_into_panel(&key, item_id.as_deref()).await {
                    Ok(InjectOutcome::Injected) | Ok(InjectOutcome::AlreadyPresent) => {
                        this.start_heal(key, item_id).await;
                    }
                    Ok(InjectOutcome::Deferred) => {}
                    Ok(InjectOutcome::Detached) => this.forget_panel(&key),
                    Err(e) => error!(panel = %key, error = %e, "Injection failed"),
                }
            });
    }

    /// Insert the control into `panel` unless it is already there.
    ///
    /// A panel without its stable marker is still being built by the host;
    /// injection is rescheduled instead of inserting too early.
    pub async fn inject_into_panel(
        &self,
        panel: &PanelId,
        item_id: Option<&str>,
    ) -> Result<InjectOutcome, DuplicatorError> {
        let probes = &self.inner.probes;
        let host = probes.host();
        let markers = probes.markers();

        if !host.is_attached(panel).await? {
            return Ok(InjectOutcome::Detached);
        }
        if host.exists(&markers.custom_control(), Some(panel)).await? {
            return Ok(InjectOutcome::AlreadyPresent);
        }
        if !host.exists(&markers.stable_panel(), Some(panel)).await? {
            debug!(%panel, "Panel not stable yet; deferring injection");
            self.schedule(panel.clone(), item_id.map(str::to_string));
            return Ok(InjectOutcome::Deferred);
        }

        let controls = host
            .labeled_controls(panel, &markers.labeled_control())
            .await?;
        let panel_has_spacer = host.exists(&markers.spacer(), Some(panel)).await?;
        let label = self.resolve_label().await;
        let template = ControlTemplate::adapt(
            &controls,
            label,
            &markers.fallback_button_class,
            panel_has_spacer,
        );
        let markup = render_control(
            &template,
            &markers.custom_control_class,
            &markers.spacer_class,
            item_id,
            label,
        );
        host.prepend(panel, &markup).await?;
        info!(%panel, ?item_id, class = %template.button_class, "Injected duplicate control");
        Ok(InjectOutcome::Injected)
    }

    /// Keep the control in place for the heal window: react to subtree
    /// changes, and recheck on a timer in case a notification is missed.
    pub async fn start_heal(&self, panel: PanelId, item_id: Option<String>) {
        let deadline = Instant::now() + self.inner.timings.heal_window();

        match self.inner.probes.host().observe(&panel).await {
            Ok(mut subscription) => {
                let this = self.clone();
                let key = panel.clone();
                let id = item_id.clone();
                let watcher = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            changed = subscription.changed() => {
                                if !changed || !this.reassert(&key, id.as_deref()).await {
                                    break;
                                }
                            }
                            _ = time::sleep_until(deadline) => break,
                        }
                    }
                    subscription.unsubscribe();
                    debug!(panel = %key, "Heal subscription closed");
                });
                if let Some(previous) = self.inner.watchers().insert(panel.clone(), watcher) {
                    previous.abort();
                }
            }
            Err(e) => {
                warn!(%panel, error = %e, "Cannot observe panel; relying on recheck timer")
            }
        }

        self.inner.heal.start(
            panel.clone(),
            self.inner.timings.heal_recheck(),
            HealRecheck {
                injector: self.clone(),
                panel,
                item_id,
                deadline,
            },
        );
    }

    /// Put the control back if it went missing. Returns `false` once the
    /// panel is gone and healing should stop.
    async fn reassert(&self, panel: &PanelId, item_id: Option<&str>) -> bool {
        match self.inject_into_panel(panel, item_id).await {
            Ok(InjectOutcome::Detached) => false,
            Ok(InjectOutcome::Injected) => {
                debug!(%panel, "Healed removed control");
                true
            }
            Ok(_) => true,
            Err(e) => {
                warn!(%panel, error = %e, "Heal attempt failed");
                true
            }
        }
    }

    pub fn is_healing(&self, panel: &PanelId) -> bool {
        self.inner.heal.is_active(panel)
            || self
                .inner
                .watchers()
                .get(panel)
                .is_some_and(|w| !w.is_finished())
    }

    pub fn has_pending(&self, panel: &PanelId) -> bool {
        self.inner.debounce.is_active(panel)
    }

    pub fn is_waiting_for_panel(&self) -> bool {
        self.inner.panel_wait.is_active(&TaskName::Inject)
    }

    /// Stop every heal window and the panel wait. Pending debounced
    /// injections are left alone.
    pub fn stop_healing(&self) {
        self.inner.heal.stop_all();
        self.inner.panel_wait.stop_all();
        for (_, watcher) in self.inner.watchers().drain() {
            watcher.abort();
        }
    }

    pub fn cancel_all(&self) {
        self.stop_healing();
        self.inner.debounce.stop_all();
    }

    fn forget_panel(&self, panel: &PanelId) {
        self.drop_bindings(panel);
        self.inner.heal.stop(panel);
    }

    /// Everything bound to `panel` except its heal recheck timer.
    fn drop_bindings(&self, panel: &PanelId) {
        self.inner.debounce.stop(panel);
        if let Some(watcher) = self.inner.watchers().remove(panel) {
            watcher.abort();
        }
        debug!(%panel, "Panel detached; bindings dropped");
    }
}

impl InjectorInner {
    fn label(&self) -> MutexGuard<'_, Option<&'static str>> {
        self.label.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<PanelId, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct HealRecheck {
    injector: Injector,
    panel: PanelId,
    item_id: Option<String>,
    deadline: Instant,
}

#[async_trait]
impl Probe for HealRecheck {
    async fn poll(&self) -> Tick {
        if Instant::now() >= self.deadline {
            debug!(panel = %self.panel, "Heal window elapsed");
            return Tick::Done;
        }
        if !self
            .injector
            .reassert(&self.panel, self.item_id.as_deref())
            .await
        {
            self.injector.drop_bindings(&self.panel);
            return Tick::Done;
        }
        Tick::Retry
    }
}

struct PanelWait {
    injector: Injector,
    item_id: Option<String>,
}

#[async_trait]
impl Probe for PanelWait {
    async fn poll(&self) -> Tick {
        let inner = &self.injector.inner;
        let panels = match inner
            .probes
            .host()
            .panels(&inner.probes.markers().detail_panel())
            .await
        {
            Ok(panels) => panels,
            Err(e) => {
                debug!(error = %e, "Panel lookup failed");
                return Tick::Retry;
            }
        };
        if panels.is_empty() {
            return Tick::Retry;
        }
        for panel in panels {
            self.injector.schedule(panel, self.item_id.clone());
        }
        Tick::Done
    }

    async fn on_abort(&self, reason: AbortReason) {
        debug!(%reason, "No detail panel appeared");
    }
}
