use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{HostEvent, Modifiers};
use crate::host::Host;
use crate::tests::workflow_tests::{calendar, ITEM_CSS};
use crate::tests::{FakeHost, GRID_CSS, OPTIONS_CSS, SAVE_CSS};
use crate::workflow::Phase;
use crate::Duplicator;

const WEEK: &str = "https://calendar.google.com/calendar/u/0/r/week/2024/3/14";

fn duplicator(host: &FakeHost) -> Duplicator {
    let host: Arc<dyn Host> = Arc::new(host.clone());
    Duplicator::new(host, Config::default())
}

fn activated(modifiers: Modifiers) -> HostEvent {
    HostEvent::ItemActivated {
        item_id: Some("evt1".to_string()),
        modifiers,
    }
}

#[tokio::test(start_paused = true)]
async fn plain_activation_only_injects() {
    let host = FakeHost::new(WEEK);
    host.add_panel("p1", true);
    let dup = duplicator(&host);

    dup.handle_event(activated(Modifiers::default())).await.unwrap();
    assert!(!dup.workflow().is_running());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.inserted("p1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn alt_activation_starts_a_run() {
    let host = FakeHost::new(WEEK);
    host.add_panel("p1", true);
    host.show(OPTIONS_CSS);
    let dup = duplicator(&host);

    dup.handle_event(activated(Modifiers::ALT)).await.unwrap();
    assert_eq!(dup.workflow().phase(), Phase::MenuOpening);
}

#[tokio::test(start_paused = true)]
async fn other_modifier_combinations_do_not_start() {
    let host = FakeHost::new(WEEK);
    let dup = duplicator(&host);
    let alt_shift = Modifiers {
        alt: true,
        shift: true,
        ..Modifiers::default()
    };
    dup.handle_event(activated(alt_shift)).await.unwrap();
    assert!(!dup.workflow().is_running());
}

#[tokio::test(start_paused = true)]
async fn control_activation_starts_and_unloading_aborts() {
    let host = FakeHost::new(WEEK);
    host.show(OPTIONS_CSS);
    let dup = duplicator(&host);

    dup.handle_event(HostEvent::ControlActivated).await.unwrap();
    assert!(dup.workflow().is_running());

    dup.handle_event(HostEvent::Unloading).await.unwrap();
    assert!(!dup.workflow().is_running());
    assert!(dup.workflow().state().original_location.is_none());
    assert_eq!(dup.workflow().scheduler().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unloading_from_the_restore_navigation_keeps_the_run() {
    let host = calendar();
    host.on_click(SAVE_CSS, |s| s.hide(GRID_CSS));
    let dup = duplicator(&host);

    dup.handle_event(HostEvent::ControlActivated).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert_eq!(dup.workflow().phase(), Phase::PostSaveRestore);
    assert_eq!(host.navigations().len(), 1);

    dup.handle_event(HostEvent::Unloading).await.unwrap();
    assert_eq!(dup.workflow().phase(), Phase::PostSaveRestore);

    host.show(GRID_CSS);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dup.workflow().phase(), Phase::Idle);
    assert_eq!(host.click_count(ITEM_CSS), 1);
    assert!(dup.workflow().state().original_location.is_some());
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_cancel_and_cleans_up() {
    let host = FakeHost::new(WEEK);
    host.show(OPTIONS_CSS);
    let dup = duplicator(&host);
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let runner = {
        let dup = dup.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dup.run(rx, cancel).await })
    };

    tx.send(HostEvent::ControlActivated).unwrap();
    tx.send(HostEvent::LocationChanged {
        url: WEEK.to_string(),
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(dup.workflow().is_running());

    cancel.cancel();
    runner.await.unwrap();
    assert!(!dup.workflow().is_running());
    assert!(!host.has_body_class("gcqd-active"));
}

#[tokio::test(start_paused = true)]
async fn run_loop_ends_when_events_close() {
    let host = FakeHost::new(WEEK);
    let dup = duplicator(&host);
    let (tx, rx) = mpsc::unbounded_channel::<HostEvent>();
    drop(tx);
    dup.run(rx, CancellationToken::new()).await;
    assert_eq!(dup.workflow().phase(), Phase::Idle);
}

#[test]
fn shortcut_requires_alt_alone() {
    assert!(Modifiers::ALT.is_duplicate_shortcut());
    assert!(!Modifiers::default().is_duplicate_shortcut());
    assert!(!Modifiers {
        alt: true,
        meta: true,
        ..Modifiers::default()
    }
    .is_duplicate_shortcut());
}
