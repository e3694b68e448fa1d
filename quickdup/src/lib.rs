//! Duplicate-and-return automation for a calendar web interface
//!
//! The engine adds a "duplicate" control to item detail panels and, when it is
//! activated, drives the host's own options menu, duplicate action and save
//! control, then brings the user back to the view they started from. The host
//! document is only ever reached through the [`Host`] trait; [`BridgeHost`]
//! implements it over a browser extension connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub mod browser_host;
pub mod config;
pub mod errors;
pub mod events;
pub mod extension_bridge;
pub mod host;
pub mod inject;
pub mod locale;
pub mod markup;
pub mod probe;
pub mod scheduler;
pub mod script;
pub mod selector;
#[cfg(test)]
mod tests;
pub mod view;
pub mod workflow;

pub use browser_host::BridgeHost;
pub use config::{Config, LocationRules, Markers, Timings};
pub use errors::DuplicatorError;
pub use events::{HostEvent, Modifiers};
pub use extension_bridge::ExtensionBridge;
pub use host::{Host, NavigationMode, PanelId, Subscription};
pub use inject::{InjectOutcome, Injector};
pub use probe::{MenuState, Probes};
pub use scheduler::{AbortReason, Probe, Scheduler, TaskName, Tick};
pub use selector::Selector;
pub use view::{
    build_target_location, parse_mode_and_date, DateToken, RestoreOutcome, ScrollSnapshot,
    ViewContext, ViewRestorer,
};
pub use workflow::{Cleanup, Phase, Workflow, WorkflowState};

/// Entry point tying host events to injection and the workflow.
#[derive(Clone)]
pub struct Duplicator {
    workflow: Workflow,
}

impl Duplicator {
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        Self {
            workflow: Workflow::new(host, config),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn injector(&self) -> &Injector {
        self.workflow.injector()
    }

    /// React to one host event.
    ///
    /// Activating an item asks for the control to be injected into its panel;
    /// doing so with Alt held starts a run straight away. Activating the
    /// injected control starts a run. Unloading abandons whatever is in flight,
    /// except a view restore, which is what navigates away in the first place.
    #[instrument(skip(self))]
    pub async fn handle_event(&self, event: HostEvent) -> Result<(), DuplicatorError> {
        match event {
            HostEvent::ItemActivated { item_id, modifiers } => {
                let scheduled = self.injector().request(item_id).await?;
                debug!(scheduled, "Injection requested");
                if modifiers.is_duplicate_shortcut() {
                    info!("Duplicate shortcut used");
                    self.workflow.start().await?;
                }
            }
            HostEvent::ControlActivated => {
                self.workflow.start().await?;
            }
            HostEvent::LocationChanged { url } => {
                debug!(%url, "Host location changed");
            }
            HostEvent::Unloading => {
                self.injector().cancel_all();
                if self.workflow.phase() == Phase::PostSaveRestore {
                    // The restore's own navigation; it carries on in the next document
                    debug!("Document unloading during view restore");
                } else {
                    self.workflow.abort("document unloading").await;
                }
            }
        }
        Ok(())
    }

    /// Handle events until the channel closes or `cancel` fires. In-flight
    /// work is cleaned up on the way out.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<HostEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Host event stream closed");
                        break;
                    };
                    if let Err(e) = self.handle_event(event).await {
                        warn!(error = %e, "Event handling failed");
                    }
                }
            }
        }
        self.injector().cancel_all();
        self.workflow.cleanup(Cleanup::Full).await;
    }
}
