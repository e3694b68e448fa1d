use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::scheduler::{AbortReason, Probe, Scheduler, TaskName, Tick};

#[derive(Default)]
struct Record {
    polls: AtomicU32,
    aborts: Mutex<Vec<AbortReason>>,
}

/// Answers with `script` in order, then repeats its last entry.
struct Scripted {
    record: Arc<Record>,
    script: Vec<Tick>,
}

#[async_trait]
impl Probe for Scripted {
    async fn poll(&self) -> Tick {
        let n = self.record.polls.fetch_add(1, Ordering::SeqCst) as usize;
        self.script
            .get(n)
            .or(self.script.last())
            .cloned()
            .unwrap_or(Tick::Retry)
    }

    async fn on_abort(&self, reason: AbortReason) {
        self.record.aborts.lock().unwrap().push(reason);
    }
}

fn scripted(script: Vec<Tick>) -> (Scripted, Arc<Record>) {
    let record = Arc::new(Record::default());
    (
        Scripted {
            record: record.clone(),
            script,
        },
        record,
    )
}

const INTERVAL: Duration = Duration::from_millis(50);

#[tokio::test(start_paused = true)]
async fn retries_until_ceiling_then_aborts_once() {
    let scheduler: Scheduler = Scheduler::new(3);
    let (probe, record) = scripted(vec![Tick::Retry]);
    scheduler.start(TaskName::Duplicate, INTERVAL, probe);
    assert!(scheduler.is_active(&TaskName::Duplicate));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(record.polls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *record.aborts.lock().unwrap(),
        vec![AbortReason::Exhausted { attempts: 3 }]
    );
    assert!(!scheduler.is_active(&TaskName::Duplicate));
    assert!(scheduler.has_exceeded(&TaskName::Duplicate));
}

#[tokio::test(start_paused = true)]
async fn first_poll_waits_one_interval() {
    let scheduler: Scheduler = Scheduler::new(10);
    let (probe, record) = scripted(vec![Tick::Retry]);
    scheduler.start(TaskName::Save, INTERVAL, probe);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(record.polls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(record.polls.load(Ordering::SeqCst), 1);
    scheduler.stop_all();
}

#[tokio::test(start_paused = true)]
async fn done_stops_the_task_without_abort() {
    let scheduler: Scheduler = Scheduler::new(10);
    let (probe, record) = scripted(vec![Tick::Retry, Tick::Done]);
    scheduler.start(TaskName::Save, INTERVAL, probe);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(record.polls.load(Ordering::SeqCst), 2);
    assert!(record.aborts.lock().unwrap().is_empty());
    assert!(!scheduler.is_active(&TaskName::Save));
    assert_eq!(scheduler.retry_count(&TaskName::Save), Some(1));
}

#[tokio::test(start_paused = true)]
async fn probe_failure_reports_reason() {
    let scheduler: Scheduler = Scheduler::new(10);
    let (probe, record) = scripted(vec![Tick::Abort("dispatch failed".to_string())]);
    scheduler.start(TaskName::Duplicate, INTERVAL, probe);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        *record.aborts.lock().unwrap(),
        vec![AbortReason::Failed("dispatch failed".to_string())]
    );
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn restarting_a_name_replaces_the_previous_timer() {
    let scheduler: Scheduler = Scheduler::new(100);
    let (first, first_record) = scripted(vec![Tick::Retry]);
    scheduler.start(TaskName::Duplicate, INTERVAL, first);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(first_record.polls.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.retry_count(&TaskName::Duplicate), Some(2));

    let (second, second_record) = scripted(vec![Tick::Retry]);
    scheduler.start(TaskName::Duplicate, INTERVAL, second);
    assert_eq!(scheduler.retry_count(&TaskName::Duplicate), None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(first_record.polls.load(Ordering::SeqCst), 2);
    assert!(second_record.polls.load(Ordering::SeqCst) >= 9);
    assert_eq!(scheduler.active_count(), 1);
    scheduler.stop_all();
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_shot_can_be_cancelled() {
    let scheduler: Scheduler = Scheduler::new(10);
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    scheduler.after(TaskName::Restore, Duration::from_millis(100), async move {
        flag.store(true, Ordering::SeqCst);
    });
    assert!(scheduler.stop(&TaskName::Restore));
    assert!(!scheduler.stop(&TaskName::Restore));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn one_shot_leaves_the_table_when_it_fires() {
    let scheduler: Scheduler = Scheduler::new(10);
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    let inner = scheduler.clone();
    scheduler.after(TaskName::Restore, Duration::from_millis(100), async move {
        flag.store(!inner.is_active(&TaskName::Restore), Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fired.load(Ordering::SeqCst));
    assert!(!scheduler.is_active(&TaskName::Restore));
}

/// Stops everything from its abort hook and keeps working afterwards.
struct CleansUp {
    scheduler: Scheduler,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Probe for CleansUp {
    async fn poll(&self) -> Tick {
        Tick::Retry
    }

    async fn on_abort(&self, _reason: AbortReason) {
        self.scheduler.stop_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn cleanup_from_abort_hook_does_not_cancel_itself() {
    let scheduler: Scheduler = Scheduler::new(2);
    let finished = Arc::new(AtomicBool::new(false));
    let (other, other_record) = scripted(vec![Tick::Retry]);

    scheduler.start(
        TaskName::Duplicate,
        INTERVAL,
        CleansUp {
            scheduler: scheduler.clone(),
            finished: finished.clone(),
        },
    );
    scheduler.start(TaskName::Inject, Duration::from_secs(10), other);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(scheduler.active_count(), 0);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(other_record.polls.load(Ordering::SeqCst), 0);
}

#[test]
fn retry_counters_are_per_name() {
    let scheduler: Scheduler = Scheduler::new(2);
    assert_eq!(scheduler.increment_retry(&TaskName::Save), 1);
    assert_eq!(scheduler.increment_retry(&TaskName::Save), 2);
    assert_eq!(scheduler.increment_retry(&TaskName::Duplicate), 1);
    assert!(scheduler.has_exceeded(&TaskName::Save));
    assert!(!scheduler.has_exceeded(&TaskName::Duplicate));

    scheduler.reset_retry(&TaskName::Save);
    assert_eq!(scheduler.retry_count(&TaskName::Save), None);
    scheduler.clear_retries();
    assert_eq!(scheduler.retry_count(&TaskName::Duplicate), None);
}

#[test]
fn task_names_display_lowercase() {
    let names: Vec<String> = [
        TaskName::Duplicate,
        TaskName::Save,
        TaskName::Restore,
        TaskName::Inject,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    assert_eq!(names, ["duplicate", "save", "restore", "inject"]);
}
