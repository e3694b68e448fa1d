mod duplicator_tests;
mod scheduler_tests;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::DuplicatorError;
use crate::host::{ControlInfo, Host, NavigationMode, PanelId, ScrollOffsets, Subscription};
use crate::selector::Selector;

// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

pub const CUSTOM_CSS: &str = ".dup-btn";
pub const STABLE_CSS: &str = "button[aria-label]";
pub const SPACER_CSS: &str = ".VbA1ue";
pub const OPTIONS_CSS: &str = ".d29e1c";
pub const DUPLICATE_CSS: &str = "[jsname=\"lbYRR\"]";
pub const SAVE_CSS: &str = "[jsname=\"x8hlje\"]";
pub const GRID_CSS: &str = "[role=\"grid\"]";
pub const SCROLL_CSS: &str = ".W0m3G";
pub const DAY_PICKER_CSS: &str = ".pWJCO";
pub const CARRIER_CSS: &str = "button[data-id]";

type Reaction = Box<dyn FnMut(&mut FakeState) + Send>;

pub struct FakePanel {
    pub id: PanelId,
    pub attached: bool,
    pub stable: bool,
    pub has_spacer: bool,
    pub controls: Vec<ControlInfo>,
    /// Markup of every insertion, in order
    pub inserted: Vec<String>,
    /// Our control is currently in the panel
    pub has_custom: bool,
    pub custom_item_id: Option<String>,
    /// (css, attribute) -> value for elements inside the panel
    pub attributes: HashMap<(String, String), String>,
}

#[derive(Default)]
pub struct FakeState {
    pub location: String,
    pub present: HashSet<String>,
    pub attributes: HashMap<(String, String), String>,
    pub panels: Vec<FakePanel>,
    pub clicks: Vec<String>,
    pub failing_clicks: HashSet<String>,
    pub reactions: HashMap<String, Vec<Reaction>>,
    pub navigations: Vec<(String, NavigationMode)>,
    pub failing_navigation: HashSet<NavigationModeKey>,
    pub location_fails: bool,
    pub language: Option<String>,
    pub scroll: HashMap<String, ScrollOffsets>,
    pub scroll_writes: Vec<(String, ScrollOffsets)>,
    pub body_classes: HashSet<String>,
    observers: HashMap<PanelId, Vec<(u64, mpsc::UnboundedSender<()>)>>,
    next_observer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationModeKey {
    Replace,
    Assign,
}

impl From<NavigationMode> for NavigationModeKey {
    fn from(mode: NavigationMode) -> Self {
        match mode {
            NavigationMode::Replace => NavigationModeKey::Replace,
            NavigationMode::Assign => NavigationModeKey::Assign,
        }
    }
}

impl FakePanel {
    pub fn new(id: &str, stable: bool) -> Self {
        Self {
            id: PanelId::from(id),
            attached: true,
            stable,
            has_spacer: false,
            controls: Vec::new(),
            inserted: Vec::new(),
            has_custom: false,
            custom_item_id: None,
            attributes: HashMap::new(),
        }
    }
}

impl FakeState {
    pub fn panel_mut(&mut self, id: &str) -> Option<&mut FakePanel> {
        self.panels.iter_mut().find(|p| p.id.0 == id)
    }

    pub fn show(&mut self, css: &str) {
        self.present.insert(css.to_string());
    }

    pub fn hide(&mut self, css: &str) {
        self.present.remove(css);
    }

    /// Wake every observer of `panel`.
    pub fn notify(&mut self, panel: &PanelId) {
        if let Some(list) = self.observers.get_mut(panel) {
            list.retain(|(_, tx)| tx.send(()).is_ok());
        }
    }

    pub fn detach(&mut self, id: &str) {
        if let Some(panel) = self.panel_mut(id) {
            panel.attached = false;
        }
        self.notify(&PanelId::from(id));
    }

    fn exists_in_panel(panel: &FakePanel, css: &str) -> bool {
        match css {
            CUSTOM_CSS => panel.has_custom,
            STABLE_CSS => panel.stable,
            SPACER_CSS => panel.has_spacer,
            _ => panel.attributes.keys().any(|(c, _)| c == css),
        }
    }

    fn exists(&self, css: &str, scope: Option<&PanelId>) -> bool {
        match scope {
            Some(scope) => self
                .panels
                .iter()
                .find(|p| &p.id == scope && p.attached)
                .is_some_and(|p| Self::exists_in_panel(p, css)),
            None => {
                self.present.contains(css)
                    || (css == CUSTOM_CSS && self.panels.iter().any(|p| p.attached && p.has_custom))
            }
        }
    }
}

/// In-memory host document.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHost {
    pub fn new(location: &str) -> Self {
        let host = FakeHost::default();
        host.state().location = location.to_string();
        host
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_panel(&self, id: &str, stable: bool) {
        self.state().panels.push(FakePanel::new(id, stable));
    }

    pub fn set_stable(&self, id: &str) {
        let mut state = self.state();
        if let Some(panel) = state.panel_mut(id) {
            panel.stable = true;
        }
        state.notify(&PanelId::from(id));
    }

    /// The host re-renders the panel and drops our control.
    pub fn wipe_custom(&self, id: &str, notify: bool) {
        let mut state = self.state();
        if let Some(panel) = state.panel_mut(id) {
            panel.has_custom = false;
        }
        if notify {
            state.notify(&PanelId::from(id));
        }
    }

    pub fn detach(&self, id: &str) {
        self.state().detach(id);
    }

    pub fn show(&self, css: &str) {
        self.state().show(css);
    }

    pub fn on_click(&self, css: &str, reaction: impl FnMut(&mut FakeState) + Send + 'static) {
        self.state()
            .reactions
            .entry(css.to_string())
            .or_default()
            .push(Box::new(reaction));
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state().clicks.clone()
    }

    pub fn click_count(&self, css: &str) -> usize {
        self.state().clicks.iter().filter(|c| *c == css).count()
    }

    pub fn inserted(&self, id: &str) -> Vec<String> {
        self.state()
            .panel_mut(id)
            .map(|p| p.inserted.clone())
            .unwrap_or_default()
    }

    pub fn has_custom(&self, id: &str) -> bool {
        self.state().panel_mut(id).is_some_and(|p| p.has_custom)
    }

    pub fn observer_count(&self, id: &str) -> usize {
        self.state()
            .observers
            .get(&PanelId::from(id))
            .map_or(0, Vec::len)
    }

    pub fn has_body_class(&self, class: &str) -> bool {
        self.state().body_classes.contains(class)
    }

    pub fn navigations(&self) -> Vec<(String, NavigationMode)> {
        self.state().navigations.clone()
    }

    pub fn current_location(&self) -> String {
        self.state().location.clone()
    }
}

fn css(selector: &Selector) -> Result<Vec<String>, DuplicatorError> {
    selector.candidates().iter().map(Selector::to_css).collect()
}

fn extract_data_id(markup: &str) -> Option<String> {
    let start = markup.find("data-id=\"")? + "data-id=\"".len();
    let end = markup[start..].find('"')? + start;
    Some(markup[start..end].to_string()).filter(|id| !id.is_empty())
}

#[async_trait]
impl Host for FakeHost {
    async fn exists(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError> {
        let state = self.state();
        Ok(css(selector)?.iter().any(|c| state.exists(c, scope)))
    }

    async fn attribute(
        &self,
        selector: &Selector,
        name: &str,
        scope: Option<&PanelId>,
    ) -> Result<Option<String>, DuplicatorError> {
        let state = self.state();
        for c in css(selector)? {
            let found = match scope {
                Some(scope) => state
                    .panels
                    .iter()
                    .find(|p| &p.id == scope && p.attached)
                    .and_then(|p| {
                        if c == CUSTOM_CSS && name == "data-id" && p.has_custom {
                            p.custom_item_id.clone()
                        } else {
                            p.attributes.get(&(c.clone(), name.to_string())).cloned()
                        }
                    }),
                None => state.attributes.get(&(c.clone(), name.to_string())).cloned(),
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn click(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError> {
        let mut state = self.state();
        for c in css(selector)? {
            if state.failing_clicks.contains(&c) {
                return Err(DuplicatorError::ActionFailed(format!("dispatch failed on {c}")));
            }
            if !state.exists(&c, scope) {
                continue;
            }
            state.clicks.push(c.clone());
            if let Some(mut reactions) = state.reactions.remove(&c) {
                for reaction in reactions.iter_mut() {
                    reaction(&mut *state);
                }
                state.reactions.entry(c).or_default().extend(reactions);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn panels(&self, _selector: &Selector) -> Result<Vec<PanelId>, DuplicatorError> {
        Ok(self
            .state()
            .panels
            .iter()
            .filter(|p| p.attached)
            .map(|p| p.id.clone())
            .collect())
    }

    async fn is_attached(&self, panel: &PanelId) -> Result<bool, DuplicatorError> {
        Ok(self
            .state()
            .panels
            .iter()
            .any(|p| &p.id == panel && p.attached))
    }

    async fn labeled_controls(
        &self,
        panel: &PanelId,
        _selector: &Selector,
    ) -> Result<Vec<ControlInfo>, DuplicatorError> {
        Ok(self
            .state()
            .panels
            .iter()
            .find(|p| &p.id == panel)
            .map(|p| p.controls.clone())
            .unwrap_or_default())
    }

    async fn prepend(&self, panel: &PanelId, markup: &str) -> Result<(), DuplicatorError> {
        let mut state = self.state();
        let Some(target) = state.panels.iter_mut().find(|p| &p.id == panel && p.attached) else {
            return Err(DuplicatorError::ElementDetached(panel.to_string()));
        };
        target.inserted.push(markup.to_string());
        target.has_custom = true;
        target.custom_item_id = extract_data_id(markup);
        state.notify(panel);
        Ok(())
    }

    async fn remove_all(&self, selector: &Selector) -> Result<usize, DuplicatorError> {
        let mut state = self.state();
        let mut removed = 0;
        for c in css(selector)? {
            if state.present.remove(&c) {
                removed += 1;
            }
            if c == CUSTOM_CSS {
                for panel in state.panels.iter_mut().filter(|p| p.has_custom) {
                    panel.has_custom = false;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn location(&self) -> Result<String, DuplicatorError> {
        let state = self.state();
        if state.location_fails {
            return Err(DuplicatorError::Script("location unavailable".to_string()));
        }
        Ok(state.location.clone())
    }

    async fn language(&self) -> Result<Option<String>, DuplicatorError> {
        Ok(self.state().language.clone())
    }

    async fn navigate(&self, url: &str, mode: NavigationMode) -> Result<(), DuplicatorError> {
        let mut state = self.state();
        state.navigations.push((url.to_string(), mode));
        if state.failing_navigation.contains(&NavigationModeKey::from(mode)) {
            return Err(DuplicatorError::Navigation(format!("{mode:?} refused")));
        }
        state.location = url.to_string();
        Ok(())
    }

    async fn scroll_offsets(
        &self,
        selector: &Selector,
    ) -> Result<Option<ScrollOffsets>, DuplicatorError> {
        let state = self.state();
        Ok(css(selector)?
            .iter()
            .find_map(|c| state.scroll.get(c).copied()))
    }

    async fn set_scroll_offsets(
        &self,
        selector: &Selector,
        offsets: ScrollOffsets,
    ) -> Result<bool, DuplicatorError> {
        let mut state = self.state();
        for c in css(selector)? {
            if state.scroll.contains_key(&c) {
                state.scroll.insert(c.clone(), offsets);
                state.scroll_writes.push((c, offsets));
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_body_class(&self, class: &str, present: bool) -> Result<(), DuplicatorError> {
        let mut state = self.state();
        if present {
            state.body_classes.insert(class.to_string());
        } else {
            state.body_classes.remove(class);
        }
        Ok(())
    }

    async fn observe(&self, panel: &PanelId) -> Result<Subscription, DuplicatorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state();
            if !state.panels.iter().any(|p| &p.id == panel && p.attached) {
                return Err(DuplicatorError::ElementDetached(panel.to_string()));
            }
            state.next_observer += 1;
            let id = state.next_observer;
            state
                .observers
                .entry(panel.clone())
                .or_default()
                .push((id, tx));
            id
        };
        let shared = self.state.clone();
        let key = panel.clone();
        Ok(Subscription::new(rx, move || {
            let mut state = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(list) = state.observers.get_mut(&key) {
                list.retain(|(observer, _)| *observer != id);
                if list.is_empty() {
                    state.observers.remove(&key);
                }
            }
        }))
    }
}
