//! The host document, seen only through a narrow probing interface
//!
//! The engine never models the external interface. It asks whether markers
//! exist, reads a handful of attributes, dispatches simulated clicks and
//! subscribes to subtree changes. Everything else about the host stays opaque.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::DuplicatorError;
use crate::selector::Selector;

/// Approximate frame length used when a host cannot pace by animation frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Opaque handle to a detail panel element in the host document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PanelId(pub String);

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PanelId {
    fn from(s: &str) -> Self {
        PanelId(s.to_string())
    }
}

/// A labeled action control found inside a panel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlInfo {
    pub class_name: String,
    pub aria_label: Option<String>,
    /// The previous sibling carries the spacer class
    pub preceded_by_spacer: bool,
    /// The control sits inside our own injected wrapper
    pub inside_custom: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollOffsets {
    pub top: f64,
    pub left: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationMode {
    /// Replace the current history entry
    Replace,
    /// Push a new history entry
    Assign,
}

/// Subtree change notifications for one panel, bounded by the holder.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    changes: mpsc::UnboundedReceiver<()>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        changes: mpsc::UnboundedReceiver<()>,
        on_unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            changes,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    /// Wait for the next change. Returns `false` once the host stops
    /// delivering notifications.
    pub async fn changed(&mut self) -> bool {
        if self.changes.recv().await.is_none() {
            return false;
        }
        // Coalesce a burst of mutations into one wake-up
        while self.changes.try_recv().is_ok() {}
        true
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.changes.close();
        if let Some(hook) = self.on_unsubscribe.take() {
            hook();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.on_unsubscribe.is_some())
            .finish()
    }
}

/// Probing interface onto the host document.
///
/// `scope` narrows a query to the subtree of one panel. Queries against a
/// selector that matches nothing return `Ok(false)` / `Ok(None)`; `Err` is
/// reserved for the host itself failing.
#[async_trait]
pub trait Host: Send + Sync {
    async fn exists(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError>;

    /// Attribute of the first element matching `selector`.
    async fn attribute(
        &self,
        selector: &Selector,
        name: &str,
        scope: Option<&PanelId>,
    ) -> Result<Option<String>, DuplicatorError>;

    /// Dispatch pointer-down, pointer-up and an activation event on the first
    /// match. Returns `Ok(false)` when nothing matched.
    async fn click(
        &self,
        selector: &Selector,
        scope: Option<&PanelId>,
    ) -> Result<bool, DuplicatorError>;

    /// All elements matching `selector`, as stable panel handles.
    async fn panels(&self, selector: &Selector) -> Result<Vec<PanelId>, DuplicatorError>;

    async fn is_attached(&self, panel: &PanelId) -> Result<bool, DuplicatorError>;

    /// Labeled controls inside a panel, in document order.
    async fn labeled_controls(
        &self,
        panel: &PanelId,
        selector: &Selector,
    ) -> Result<Vec<ControlInfo>, DuplicatorError>;

    /// Insert markup as the first child of the panel.
    async fn prepend(&self, panel: &PanelId, markup: &str) -> Result<(), DuplicatorError>;

    /// Remove every element matching `selector`, returning how many went.
    async fn remove_all(&self, selector: &Selector) -> Result<usize, DuplicatorError>;

    async fn location(&self) -> Result<String, DuplicatorError>;

    /// UI language tag of the document, if it reports one.
    async fn language(&self) -> Result<Option<String>, DuplicatorError>;

    async fn navigate(&self, url: &str, mode: NavigationMode) -> Result<(), DuplicatorError>;

    async fn scroll_offsets(
        &self,
        selector: &Selector,
    ) -> Result<Option<ScrollOffsets>, DuplicatorError>;

    /// Returns `Ok(false)` when the container is not present.
    async fn set_scroll_offsets(
        &self,
        selector: &Selector,
        offsets: ScrollOffsets,
    ) -> Result<bool, DuplicatorError>;

    async fn set_body_class(&self, class: &str, present: bool) -> Result<(), DuplicatorError>;

    /// Subscribe to child-list changes anywhere in the panel's subtree.
    async fn observe(&self, panel: &PanelId) -> Result<Subscription, DuplicatorError>;

    /// Suspend until the host is about to paint its next frame.
    async fn next_frame(&self) {
        tokio::time::sleep(FRAME_INTERVAL).await;
    }
}
