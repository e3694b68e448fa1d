//! Signals arriving from the host document

use serde::{Deserialize, Serialize};

/// Modifier keys held during an activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    pub alt: bool,
    pub shift: bool,
    pub ctrl: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const ALT: Modifiers = Modifiers {
        alt: true,
        shift: false,
        ctrl: false,
        meta: false,
    };

    /// The duplicate shortcut: Alt held alone.
    pub fn is_duplicate_shortcut(&self) -> bool {
        self.alt && !self.shift && !self.ctrl && !self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// An item summary element was activated
    ItemActivated {
        item_id: Option<String>,
        modifiers: Modifiers,
    },
    /// The injected duplicate control was activated
    ControlActivated,
    LocationChanged { url: String },
    /// The document is going away
    Unloading,
}
