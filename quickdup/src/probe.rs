//! Action probes: structural reads of the host plus at most one click
//!
//! Each probe answers one question about the host's current surface or
//! performs one simulated activation. Probes are idempotent. Asking for an
//! action whose goal is already visible is a no-op that reports `false`.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::Markers;
use crate::errors::DuplicatorError;
use crate::host::{Host, PanelId, ScrollOffsets};
use crate::selector::Selector;
use crate::view::ScrollSnapshot;

/// What the item options menu currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuState {
    /// Options control present, duplicate action not yet visible
    Closed,
    /// Duplicate action visible
    DuplicateReady,
    /// Neither control is present
    Absent,
}

#[derive(Clone)]
pub struct Probes {
    host: Arc<dyn Host>,
    markers: Markers,
}

impl Probes {
    pub fn new(host: Arc<dyn Host>, markers: Markers) -> Self {
        Self { host, markers }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub async fn menu_state(&self) -> Result<MenuState, DuplicatorError> {
        if self
            .host
            .exists(&self.markers.duplicate_action(), None)
            .await?
        {
            return Ok(MenuState::DuplicateReady);
        }
        if self
            .host
            .exists(&self.markers.options_control(), None)
            .await?
        {
            return Ok(MenuState::Closed);
        }
        Ok(MenuState::Absent)
    }

    /// Click the options control unless the menu is already open.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_options(&self) -> Result<bool, DuplicatorError> {
        if self.menu_state().await? != MenuState::Closed {
            return Ok(false);
        }
        self.click(&self.markers.options_control()).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn invoke_duplicate(&self) -> Result<bool, DuplicatorError> {
        self.click(&self.markers.duplicate_action()).await
    }

    pub async fn save_present(&self) -> Result<bool, DuplicatorError> {
        self.host.exists(&self.markers.save_control(), None).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn click_save(&self) -> Result<bool, DuplicatorError> {
        self.click(&self.markers.save_control()).await
    }

    /// Day token of the highlighted day in the day picker, if one is shown.
    pub async fn highlighted_day(&self) -> Result<Option<String>, DuplicatorError> {
        let day = self
            .host
            .attribute(
                &self.markers.day_picker(),
                &self.markers.day_attribute,
                None,
            )
            .await?;
        Ok(day.filter(|d| !d.is_empty()))
    }

    /// The first grid-ready candidate present, in configured order.
    pub async fn grid_ready(&self) -> Result<Option<Selector>, DuplicatorError> {
        self.first_present(&self.markers.grid_ready()).await
    }

    /// Identifier of the item shown in the open detail panel: our own control
    /// carries it in `data-id`, otherwise the first action control that has one.
    pub async fn open_panel_item_id(&self) -> Result<Option<String>, DuplicatorError> {
        let panels = self.host.panels(&self.markers.detail_panel()).await?;
        let Some(panel) = panels.first() else {
            return Ok(None);
        };
        let ours = self
            .host
            .attribute(&self.markers.custom_control(), "data-id", Some(panel))
            .await?;
        if let Some(id) = ours.filter(|id| !id.is_empty()) {
            return Ok(Some(id));
        }
        let carried = self
            .host
            .attribute(&self.markers.item_id_carrier(), "data-id", Some(panel))
            .await?;
        Ok(carried.filter(|id| !id.is_empty()))
    }

    /// Click the summary element of `item_id` unless its panel is already open.
    #[instrument(level = "debug", skip(self))]
    pub async fn reopen_item(&self, item_id: &str) -> Result<bool, DuplicatorError> {
        if self.open_panel_item_id().await?.as_deref() == Some(item_id) {
            return Ok(true);
        }
        let selector = self.markers.item_with_id(item_id);
        for candidate in selector.candidates() {
            if self.click(&candidate).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Scroll offsets of the first scroll container present.
    pub async fn scroll_snapshot(&self) -> Result<Option<ScrollSnapshot>, DuplicatorError> {
        for candidate in self.markers.scroll_containers().candidates() {
            if let Some(ScrollOffsets { top, left }) =
                self.host.scroll_offsets(&candidate).await?
            {
                return Ok(Some(ScrollSnapshot {
                    anchor_selector: candidate.to_css()?,
                    offset_top: top,
                    offset_left: left,
                }));
            }
        }
        Ok(None)
    }

    pub async fn panel_attached(&self, panel: &PanelId) -> Result<bool, DuplicatorError> {
        self.host.is_attached(panel).await
    }

    async fn first_present(&self, selector: &Selector) -> Result<Option<Selector>, DuplicatorError> {
        for candidate in selector.candidates() {
            if self.host.exists(&candidate, None).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Host click failures become [`DuplicatorError::ActionFailed`] so callers
    /// can tell a broken dispatch from a missing target.
    async fn click(&self, selector: &Selector) -> Result<bool, DuplicatorError> {
        let clicked = self.host.click(selector, None).await.map_err(|e| match e {
            DuplicatorError::ActionFailed(_) => e,
            other => DuplicatorError::ActionFailed(format!("click on {selector}: {other}")),
        })?;
        debug!(%selector, clicked, "Simulated click");
        Ok(clicked)
    }
}
