//! Runtime configuration
//!
//! Every structural marker the engine relies on lives in [`Markers`], so
//! host markup drift is a one-place edit. Timings and location conventions
//! sit alongside. All fields default to the values the host is known to use
//! today; a JSON file can override any subset of them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::DuplicatorError;
use crate::selector::{css_string, Selector};

pub const CONFIG_PATH_ENV: &str = "QUICKDUP_CONFIG";
pub const BRIDGE_ADDR_ENV: &str = "QUICKDUP_BRIDGE_ADDR";
pub const LANGUAGE_ENV: &str = "QUICKDUP_LANG";
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:17373";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timings: Timings,
    pub markers: Markers,
    pub location: LocationRules,
    /// Click the originating item again once the view is restored
    pub reopen_item_panel: bool,
    /// Language tag used to pick the control label; `None` means English
    pub language: Option<String>,
    pub bridge_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            markers: Markers::default(),
            location: LocationRules::default(),
            reopen_item_panel: true,
            language: None,
            bridge_addr: DEFAULT_BRIDGE_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub injection_debounce_ms: u64,
    pub heal_window_ms: u64,
    pub heal_recheck_ms: u64,
    /// How long an injection request waits for a detail panel to appear
    pub panel_wait_ms: u64,
    pub save_settle_ms: u64,
    pub post_save_settle_ms: u64,
    pub restore_timeout_ms: u64,
    pub reopen_interval_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_retries: 100,
            injection_debounce_ms: 120,
            heal_window_ms: 3000,
            heal_recheck_ms: 60,
            panel_wait_ms: 2000,
            save_settle_ms: 500,
            post_save_settle_ms: 700,
            restore_timeout_ms: 6000,
            reopen_interval_ms: 120,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn injection_debounce(&self) -> Duration {
        Duration::from_millis(self.injection_debounce_ms)
    }

    pub fn heal_window(&self) -> Duration {
        Duration::from_millis(self.heal_window_ms)
    }

    pub fn heal_recheck(&self) -> Duration {
        Duration::from_millis(self.heal_recheck_ms)
    }

    pub fn save_settle(&self) -> Duration {
        Duration::from_millis(self.save_settle_ms)
    }

    pub fn post_save_settle(&self) -> Duration {
        Duration::from_millis(self.post_save_settle_ms)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.reopen_interval_ms)
    }

    /// Number of panel-wait polls that fit in the panel wait window.
    pub fn panel_wait_polls(&self) -> u32 {
        let polls = self.panel_wait_ms / self.poll_interval_ms.max(1);
        u32::try_from(polls.max(1)).unwrap_or(u32::MAX)
    }
}

/// Structural markers of the host document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Markers {
    /// Class carried by the wrapper of the injected control
    pub custom_control_class: String,
    /// Item summary element, without the id attribute
    pub item_summary: String,
    /// Attributes that may carry an item identifier, in lookup order
    pub item_id_attributes: Vec<String>,
    pub detail_panel: String,
    pub options_control: String,
    pub duplicate_action: String,
    pub save_control: String,
    pub day_picker: String,
    pub day_attribute: String,
    pub grid_ready: Vec<String>,
    pub scroll_containers: Vec<String>,
    /// Present once the host has finished building a panel
    pub stable_panel: String,
    /// Labeled action controls inside a panel, used as style reference
    pub labeled_control: String,
    /// Action control inside a panel carrying the item identifier
    pub item_id_carrier: String,
    pub spacer_class: String,
    pub fallback_button_class: String,
    pub active_body_class: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            custom_control_class: "dup-btn".to_string(),
            item_summary: "div[data-eventchip]".to_string(),
            item_id_attributes: vec!["data-eventid".to_string(), "data-event-id".to_string()],
            detail_panel: ".pPTZAe".to_string(),
            options_control: ".d29e1c".to_string(),
            duplicate_action: "[jsname=\"lbYRR\"]".to_string(),
            save_control: "[jsname=\"x8hlje\"]".to_string(),
            day_picker: ".pWJCO".to_string(),
            day_attribute: "data-date".to_string(),
            grid_ready: vec![
                "[role=\"grid\"]".to_string(),
                ".YQXjgd".to_string(),
                ".W0m3G".to_string(),
            ],
            scroll_containers: vec![
                ".W0m3G".to_string(),
                ".YQXjgd".to_string(),
                ".tEhMVd".to_string(),
            ],
            stable_panel: "button[aria-label]".to_string(),
            labeled_control: "button[aria-label]".to_string(),
            item_id_carrier: "button[data-id]".to_string(),
            spacer_class: "VbA1ue".to_string(),
            fallback_button_class: "pYTkkf-Bz112c-LgbsSe".to_string(),
            active_body_class: "gcqd-active".to_string(),
        }
    }
}

impl Markers {
    pub fn custom_control(&self) -> Selector {
        Selector::ClassName(self.custom_control_class.clone())
    }

    pub fn detail_panel(&self) -> Selector {
        Selector::from(&self.detail_panel)
    }

    pub fn options_control(&self) -> Selector {
        Selector::from(&self.options_control)
    }

    pub fn duplicate_action(&self) -> Selector {
        Selector::from(&self.duplicate_action)
    }

    pub fn save_control(&self) -> Selector {
        Selector::from(&self.save_control)
    }

    pub fn day_picker(&self) -> Selector {
        Selector::from(&self.day_picker)
    }

    pub fn grid_ready(&self) -> Selector {
        Selector::any_of(&self.grid_ready)
    }

    pub fn scroll_containers(&self) -> Selector {
        Selector::any_of(&self.scroll_containers)
    }

    pub fn stable_panel(&self) -> Selector {
        Selector::from(&self.stable_panel)
    }

    pub fn labeled_control(&self) -> Selector {
        Selector::from(&self.labeled_control)
    }

    pub fn item_id_carrier(&self) -> Selector {
        Selector::from(&self.item_id_carrier)
    }

    pub fn spacer(&self) -> Selector {
        Selector::ClassName(self.spacer_class.clone())
    }

    /// The item summary element for one specific identifier.
    pub fn item_with_id(&self, item_id: &str) -> Selector {
        let escaped = css_string(item_id);
        Selector::AnyOf(
            self.item_id_attributes
                .iter()
                .map(|attr| Selector::Css(format!("{}[{attr}=\"{escaped}\"]", self.item_summary)))
                .collect(),
        )
    }
}

/// Conventions of the host's navigable location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationRules {
    /// Path segment after which mode and date segments follow
    pub reserved_segment: String,
    /// Path prefix used when the original location has no reserved segment
    pub default_prefix: String,
    /// Substrings marking a location as a transient sub-view
    pub transient_markers: Vec<String>,
}

impl Default for LocationRules {
    fn default() -> Self {
        Self {
            reserved_segment: "r".to_string(),
            default_prefix: "/calendar/u/0".to_string(),
            transient_markers: vec![
                "duplicate".to_string(),
                "eventedit".to_string(),
                "editmode".to_string(),
            ],
        }
    }
}

impl LocationRules {
    pub fn is_transient(&self, location: &str) -> bool {
        self.transient_markers
            .iter()
            .any(|marker| !marker.is_empty() && location.contains(marker.as_str()))
    }
}

impl Config {
    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, DuplicatorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DuplicatorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            DuplicatorError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Build configuration from the environment: an optional JSON file named by
    /// `QUICKDUP_CONFIG`, then individual overrides.
    pub fn from_env() -> Result<Self, DuplicatorError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Config::load(Path::new(path.trim()))?,
            _ => Config::default(),
        };
        if let Ok(addr) = std::env::var(BRIDGE_ADDR_ENV) {
            debug!(%addr, "Bridge address overridden from environment");
            config.bridge_addr = addr;
        }
        if let Ok(lang) = std::env::var(LANGUAGE_ENV) {
            config.language = Some(lang);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DuplicatorError> {
        let t = &self.timings;
        if t.poll_interval_ms == 0 || t.heal_recheck_ms == 0 || t.reopen_interval_ms == 0 {
            return Err(DuplicatorError::Config(
                "polling intervals must be greater than zero".to_string(),
            ));
        }
        if t.max_retries == 0 {
            return Err(DuplicatorError::Config(
                "max_retries must be greater than zero".to_string(),
            ));
        }
        let m = &self.markers;
        if m.grid_ready.is_empty() || m.scroll_containers.is_empty() {
            return Err(DuplicatorError::Config(
                "grid_ready and scroll_containers need at least one candidate".to_string(),
            ));
        }
        if m.item_id_attributes.is_empty() {
            return Err(DuplicatorError::Config(
                "item_id_attributes must not be empty".to_string(),
            ));
        }
        if m.custom_control_class.trim().is_empty() {
            return Err(DuplicatorError::Config(
                "custom_control_class must not be empty".to_string(),
            ));
        }
        if self.location.reserved_segment.is_empty() {
            return Err(DuplicatorError::Config(
                "reserved_segment must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
