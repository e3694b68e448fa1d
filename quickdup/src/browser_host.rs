//! [`Host`] implementation that drives a real tab through the extension bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::Markers;
use crate::errors::DuplicatorError;
use crate::extension_bridge::ExtensionBridge;
use crate::host::{
    ControlInfo, Host, NavigationMode, PanelId, ScrollOffsets, Subscription, FRAME_INTERVAL,
};
use crate::script;
use crate::selector::Selector;

const EVAL_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_TIMEOUT: Duration = Duration::from_millis(250);

pub struct BridgeHost {
    bridge: Arc<ExtensionBridge>,
    markers: Markers,
}

impl BridgeHost {
    pub fn new(bridge: Arc<ExtensionBridge>, markers: Markers) -> Self {
        Self {
            bridge,
            markers,
        }
    }

    async fn eval<T: DeserializeOwned>(&self, code: String) -> Result<T, DuplicatorError> {
        let value = self.bridge.eval(&code, EVAL_TIMEOUT).await?;
        trace!(?value, "Eval result");
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Host for BridgeHost {
    async fn exists(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError> {
        self.eval(script::exists(&selector.to_css()?, scope)).await
    }

    async fn attribute(
        &self,
        selector: &Selector,
        name: &str,
        scope: Option<&PanelId>,
    ) -> Result<Option<String>, DuplicatorError> {
        self.eval(script::attribute(&selector.to_css()?, name, scope))
            .await
    }

    async fn click(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError> {
        self.eval(script::click(&selector.to_css()?, scope)).await
    }

    async fn panels(&self, selector: &Selector) -> Result<Vec<PanelId>, DuplicatorError> {
        let ids: Vec<String> = self.eval(script::panels(&selector.to_css()?)).await?;
        Ok(ids.into_iter().map(PanelId).collect())
    }

    async fn is_attached(&self, panel: &PanelId) -> Result<bool, DuplicatorError> {
        self.eval(script::is_attached(panel)).await
    }

    async fn labeled_controls(
        &self,
        panel: &PanelId,
        selector: &Selector,
    ) -> Result<Vec<ControlInfo>, DuplicatorError> {
        self.eval(script::labeled_controls(
            panel,
            &selector.to_css()?,
            &self.markers.spacer_class,
            &self.markers.custom_control_class,
        ))
        .await
    }

    async fn prepend(&self, panel: &PanelId, markup: &str) -> Result<(), DuplicatorError> {
        let inserted: bool = self.eval(script::prepend(panel, markup)).await?;
        if inserted {
            Ok(())
        } else {
            Err(DuplicatorError::ElementDetached(format!(
                "panel {panel} left the document"
            )))
        }
    }

    async fn remove_all(&self, selector: &Selector) -> Result<usize, DuplicatorError> {
        self.eval(script::remove_all(&selector.to_css()?)).await
    }

    async fn location(&self) -> Result<String, DuplicatorError> {
        self.eval(script::location()).await
    }

    async fn language(&self) -> Result<Option<String>, DuplicatorError> {
        self.eval(script::language()).await
    }

    async fn navigate(&self, url: &str, mode: NavigationMode) -> Result<(), DuplicatorError> {
        let replace = mode == NavigationMode::Replace;
        match self.bridge.eval(&script::navigate(url, replace), EVAL_TIMEOUT).await {
            Ok(_) => Ok(()),
            // The page may unload before it answers
            Err(DuplicatorError::Timeout(_)) | Err(DuplicatorError::Bridge(_)) => {
                debug!(%url, "Navigation issued; no reply from unloading page");
                Ok(())
            }
            Err(e) => Err(DuplicatorError::Navigation(e.to_string())),
        }
    }

    async fn scroll_offsets(
        &self,
        selector: &Selector,
    ) -> Result<Option<ScrollOffsets>, DuplicatorError> {
        self.eval(script::scroll_offsets(&selector.to_css()?)).await
    }

    async fn set_scroll_offsets(
        &self,
        selector: &Selector,
        offsets: ScrollOffsets,
    ) -> Result<bool, DuplicatorError> {
        self.eval(script::set_scroll_offsets(
            &selector.to_css()?,
            offsets.top,
            offsets.left,
        ))
        .await
    }

    async fn set_body_class(&self, class: &str, present: bool) -> Result<(), DuplicatorError> {
        let _: bool = self.eval(script::set_body_class(class, present)).await?;
        Ok(())
    }

    async fn observe(&self, panel: &PanelId) -> Result<Subscription, DuplicatorError> {
        let id = Uuid::new_v4().to_string();
        let changes = self.bridge.register_subscription(&id);
        let observed: bool = match self.eval(script::observe(panel, &id)).await {
            Ok(observed) => observed,
            Err(e) => {
                self.bridge.unregister_subscription(&id);
                return Err(e);
            }
        };
        if !observed {
            self.bridge.unregister_subscription(&id);
            return Err(DuplicatorError::ElementDetached(format!(
                "panel {panel} left the document"
            )));
        }
        debug!(%panel, subscription = %id, "Observing panel");

        let bridge = self.bridge.clone();
        Ok(Subscription::new(changes, move || {
            bridge.unregister_subscription(&id);
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            handle.spawn(async move {
                if let Err(e) = bridge.eval(&script::unobserve(&id), EVAL_TIMEOUT).await {
                    debug!(subscription = %id, error = %e, "Unobserve failed");
                }
            });
        }))
    }

    async fn next_frame(&self) {
        if self
            .bridge
            .eval(&script::next_frame(), FRAME_TIMEOUT)
            .await
            .is_err()
        {
            tokio::time::sleep(FRAME_INTERVAL).await;
        }
    }
}
