//! View context capture and restoration
//!
//! Before the workflow touches the host, the current view is recorded: the
//! navigational mode and date encoded in the location, the scroll offsets of
//! the main grid, and the item whose detail panel was open. After the
//! duplicate is saved the host has usually redirected somewhere else; the
//! restorer rebuilds the original location, waits for the grid, replays the
//! scroll offsets and reopens the item. Every stage is best-effort.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{Config, LocationRules};
use crate::errors::DuplicatorError;
use crate::host::{NavigationMode, ScrollOffsets};
use crate::probe::Probes;
use crate::selector::Selector;

/// A calendar day normalised to `YYYYMMDD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateToken(String);

impl DateToken {
    pub fn from_parts(year: u32, month: u32, day: u32) -> Option<Self> {
        if year > 9999 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return None;
        }
        Some(DateToken(format!("{year:04}{month:02}{day:02}")))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = raw[0..4].parse().ok()?;
        let month = raw[4..6].parse().ok()?;
        let day = raw[6..8].parse().ok()?;
        DateToken::from_parts(year, month, day)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year(&self) -> &str {
        &self.0[0..4]
    }

    /// Month without leading zero.
    pub fn month(&self) -> u32 {
        self.0[4..6].parse().unwrap_or(1)
    }

    /// Day of month without leading zero.
    pub fn day(&self) -> u32 {
        self.0[6..8].parse().unwrap_or(1)
    }
}

impl fmt::Display for DateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DateToken {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DateToken::parse(&value).ok_or_else(|| format!("not a YYYYMMDD date: {value:?}"))
    }
}

impl From<DateToken> for String {
    fn from(token: DateToken) -> Self {
        token.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollSnapshot {
    /// Selector of the container the offsets were read from
    pub anchor_selector: String,
    pub offset_top: f64,
    pub offset_left: f64,
}

/// Everything needed to return to the view the user started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewContext {
    pub mode: Option<String>,
    pub date_token: Option<DateToken>,
    pub originating_item_id: Option<String>,
    pub original_location: String,
    pub scroll: Option<ScrollSnapshot>,
}

impl ViewContext {
    /// Context derived from a location alone, without scroll or item.
    pub fn from_location(location: &str, rules: &LocationRules) -> Self {
        let ModeAndDate { mode, date_token } = parse_mode_and_date(location, rules);
        Self {
            mode,
            date_token,
            originating_item_id: None,
            original_location: location.to_string(),
            scroll: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeAndDate {
    pub mode: Option<String>,
    pub date_token: Option<DateToken>,
}

/// Extract the view mode and date from a host location.
///
/// Query parameters `mode` and `date` are read first. Path segments after the
/// reserved segment then supply the mode (when none was found and the first
/// segment is alphabetic) and the date (the first three numeric segments as
/// year, month, day). A path date wins over a query date. Transient sub-views
/// never count as a mode.
pub fn parse_mode_and_date(location: &str, rules: &LocationRules) -> ModeAndDate {
    let mut result = ModeAndDate::default();
    let url = match Url::parse(location) {
        Ok(url) => url,
        Err(e) => {
            debug!(%location, error = %e, "Location is not an absolute URL");
            return result;
        }
    };

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "mode" if result.mode.is_none() && !value.is_empty() => {
                result.mode = Some(value.into_owned());
            }
            "date" if result.date_token.is_none() => {
                result.date_token = DateToken::parse(&value);
            }
            _ => {}
        }
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    if let Some(pos) = segments
        .iter()
        .position(|seg| *seg == rules.reserved_segment)
    {
        let after = &segments[pos + 1..];
        if let Some(first) = after.first() {
            if result.mode.is_none()
                && first.chars().all(|c| c.is_ascii_alphabetic())
                && !rules.is_transient(first)
            {
                result.mode = Some((*first).to_string());
            }
            let numbers: Vec<u32> = after[1..]
                .iter()
                .filter_map(|seg| seg.parse::<u32>().ok())
                .collect();
            if let [year, month, day, ..] = numbers[..] {
                if let Some(token) = DateToken::from_parts(year, month, day) {
                    result.date_token = Some(token);
                }
            }
        }
    }

    if result.mode.as_deref().is_some_and(|m| rules.is_transient(m)) {
        result.mode = None;
    }
    result
}

/// The location to return to after the workflow.
///
/// A non-transient original location is the most faithful target and is
/// reused verbatim. Otherwise the target is synthesised from mode and date.
pub fn build_target_location(context: &ViewContext, rules: &LocationRules) -> String {
    if !rules.is_transient(&context.original_location) {
        return context.original_location.clone();
    }

    let (origin, prefix) = origin_and_prefix(&context.original_location, rules);
    let base = format!("{origin}{prefix}/{}", rules.reserved_segment);
    match (&context.mode, &context.date_token) {
        (Some(mode), Some(date)) => format!(
            "{base}/{mode}/{}/{}/{}",
            date.year(),
            date.month(),
            date.day()
        ),
        (Some(mode), None) => format!("{base}/{mode}"),
        _ => base,
    }
}

/// Origin and the path prefix in front of the reserved segment.
fn origin_and_prefix(location: &str, rules: &LocationRules) -> (String, String) {
    let Ok(url) = Url::parse(location) else {
        return (String::new(), rules.default_prefix.clone());
    };
    let origin = url.origin().ascii_serialization();
    let origin = if origin == "null" { String::new() } else { origin };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let prefix = match segments
        .iter()
        .position(|seg| *seg == rules.reserved_segment)
    {
        Some(0) => String::new(),
        Some(pos) => format!("/{}", segments[..pos].join("/")),
        None => rules.default_prefix.clone(),
    };
    (origin, prefix)
}

/// How far restoration got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// View restored; `reopened` tells whether the item panel was reopened
    Restored { reopened: bool },
    /// Navigation to the target location failed
    NavigationFailed,
    /// No grid-ready marker appeared before the deadline
    GridTimeout,
    /// The run ended while restoring; the remaining stages were skipped
    Cancelled,
}

#[derive(Clone)]
pub struct ViewRestorer {
    probes: Probes,
    rules: LocationRules,
    restore_timeout: Duration,
    reopen_interval: Duration,
    reopen_item_panel: bool,
}

impl ViewRestorer {
    pub fn new(probes: Probes, config: &Config) -> Self {
        Self {
            probes,
            rules: config.location.clone(),
            restore_timeout: config.timings.restore_timeout(),
            reopen_interval: config.timings.reopen_interval(),
            reopen_item_panel: config.reopen_item_panel,
        }
    }

    pub fn rules(&self) -> &LocationRules {
        &self.rules
    }

    /// Record the current view. Only the location read is required; scroll
    /// capture failures degrade to no snapshot.
    #[instrument(skip(self))]
    pub async fn capture(
        &self,
        originating_item_id: Option<String>,
    ) -> Result<ViewContext, DuplicatorError> {
        let location = self.probes.host().location().await?;
        let mut context = ViewContext::from_location(&location, &self.rules);
        context.originating_item_id = originating_item_id;
        context.scroll = match self.probes.scroll_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not snapshot scroll offsets");
                None
            }
        };
        info!(
            mode = ?context.mode,
            date = ?context.date_token,
            item_id = ?context.originating_item_id,
            scrolled = context.scroll.is_some(),
            "Captured view context"
        );
        Ok(context)
    }

    /// Return the host to `context`. Never fails; the outcome says how far it got.
    ///
    /// `run` is checked between stages and inside every wait, so a run that
    /// ends mid-restore stops touching the host.
    #[instrument(skip(self, context, run))]
    pub async fn restore(&self, context: &ViewContext, run: &CancellationToken) -> RestoreOutcome {
        let host = self.probes.host();
        let target = build_target_location(context, &self.rules);

        let current = match host.location().await {
            Ok(current) => Some(current),
            Err(e) => {
                warn!(error = %e, "Could not read current location; navigating anyway");
                None
            }
        };
        if current.as_deref() != Some(target.as_str()) {
            info!(%target, "Navigating back to view context location");
            if let Err(e) = host.navigate(&target, NavigationMode::Replace).await {
                warn!(error = %e, "History replace failed, falling back to assign");
                if let Err(e) = host.navigate(&target, NavigationMode::Assign).await {
                    warn!(error = %e, "Could not navigate to view context location");
                    return RestoreOutcome::NavigationFailed;
                }
            }
        }
        if run.is_cancelled() {
            return RestoreOutcome::Cancelled;
        }

        let Some(grid) = self.wait_for_grid(run).await else {
            if run.is_cancelled() {
                return RestoreOutcome::Cancelled;
            }
            warn!(
                timeout_ms = self.restore_timeout.as_millis() as u64,
                "Grid not ready within timeout"
            );
            return RestoreOutcome::GridTimeout;
        };
        debug!(%grid, "Grid ready");

        if run.is_cancelled() {
            return RestoreOutcome::Cancelled;
        }
        if let Some(scroll) = &context.scroll {
            self.restore_scroll(scroll).await;
        }

        if !self.reopen_item_panel {
            return RestoreOutcome::Restored { reopened: false };
        }
        let reopened = match &context.originating_item_id {
            Some(item_id) => self.reopen(item_id, run).await,
            None => false,
        };
        if run.is_cancelled() {
            return RestoreOutcome::Cancelled;
        }
        if reopened {
            info!(item_id = ?context.originating_item_id, "Reopened original item panel");
        } else if context.originating_item_id.is_some() {
            warn!(item_id = ?context.originating_item_id, "Could not reopen original item (timeout)");
        }
        RestoreOutcome::Restored { reopened }
    }

    /// Check once per frame for any grid-ready candidate.
    async fn wait_for_grid(&self, run: &CancellationToken) -> Option<Selector> {
        let start = Instant::now();
        loop {
            if run.is_cancelled() {
                return None;
            }
            match self.probes.grid_ready().await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Grid probe failed"),
            }
            if start.elapsed() > self.restore_timeout {
                return None;
            }
            self.probes.host().next_frame().await;
        }
    }

    async fn restore_scroll(&self, scroll: &ScrollSnapshot) {
        let anchor = Selector::from(scroll.anchor_selector.as_str());
        let offsets = ScrollOffsets {
            top: scroll.offset_top,
            left: scroll.offset_left,
        };
        match self.probes.host().set_scroll_offsets(&anchor, offsets).await {
            Ok(true) => debug!(%anchor, "Scroll offsets restored"),
            Ok(false) => debug!(%anchor, "Scroll container missing; skipping scroll restore"),
            Err(e) => debug!(%anchor, error = %e, "Scroll restore failed"),
        }
    }

    async fn reopen(&self, item_id: &str, run: &CancellationToken) -> bool {
        let start = Instant::now();
        loop {
            if run.is_cancelled() {
                return false;
            }
            match self.probes.reopen_item(item_id).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Reopening original item failed");
                    return false;
                }
            }
            if start.elapsed() > self.restore_timeout {
                return false;
            }
            tokio::select! {
                _ = run.cancelled() => return false,
                _ = tokio::time::sleep(self.reopen_interval) => {}
            }
        }
    }
}
