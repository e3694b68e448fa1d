//! Named, bounded-retry polling timers
//!
//! Every step of the workflow waits on the host the same way: poll a probe at
//! a fixed cadence, count the polls that made no progress, and give up once a
//! ceiling is reached. [`Scheduler`] owns those timers. It keeps at most one
//! live timer per key, so restarting a task always cancels its predecessor.
//!
//! A timer that finishes (its probe reports [`Tick::Done`], it aborts, or a
//! one-shot fires) removes itself from the table *before* running any
//! follow-up work. Cleanup triggered from inside a timer can therefore call
//! [`Scheduler::stop_all`] without cancelling the very task doing the cleanup.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Scheduler keys used by the duplication workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskName {
    /// Open the options menu and invoke the duplicate action
    Duplicate,
    /// Wait for and click the save control
    Save,
    /// Post-save settle and view restoration
    Restore,
    /// Wait for a detail panel to appear before injecting
    Inject,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskName::Duplicate => "duplicate",
            TaskName::Save => "save",
            TaskName::Restore => "restore",
            TaskName::Inject => "inject",
        };
        f.write_str(name)
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing conclusive happened; counts against the retry ceiling
    Retry,
    /// The task reached its goal and stops
    Done,
    /// The task cannot continue
    Abort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The retry ceiling was reached
    Exhausted { attempts: u32 },
    /// The probe reported a fatal failure
    Failed(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Exhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            AbortReason::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// A repeating check driven by the scheduler.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn poll(&self) -> Tick;

    /// Runs exactly once when the task is abandoned, after it has already
    /// been removed from the scheduler.
    async fn on_abort(&self, _reason: AbortReason) {}
}

/// Key bound for scheduler tables.
pub trait TaskKey: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

impl<K> TaskKey for K where K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct TaskTable<K> {
    timers: HashMap<K, TimerEntry>,
    retries: HashMap<K, u32>,
    next_generation: u64,
}

struct SchedulerInner<K> {
    ceiling: u32,
    table: Mutex<TaskTable<K>>,
}

/// Named repeating and one-shot timers with per-key retry counters.
pub struct Scheduler<K: TaskKey = TaskName> {
    inner: Arc<SchedulerInner<K>>,
}

impl<K: TaskKey> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: TaskKey> fmt::Debug for Scheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("ceiling", &self.inner.ceiling)
            .field("active", &self.active_count())
            .finish()
    }
}

impl<K: TaskKey> Scheduler<K> {
    pub fn new(ceiling: u32) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ceiling,
                table: Mutex::new(TaskTable {
                    timers: HashMap::new(),
                    retries: HashMap::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.inner.ceiling
    }

    /// Start polling `probe` every `interval` under `name`.
    ///
    /// Cancels any timer already registered under `name` and clears its retry
    /// counter. The first poll happens one interval after the call.
    pub fn start<P: Probe>(&self, name: K, interval: Duration, probe: P) {
        let inner = self.inner.clone();
        let mut table = self.inner.lock();
        let generation = table.claim(&name);
        table.retries.remove(&name);

        let key = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !inner.is_current(&key, generation) {
                    return;
                }

                let attempts = inner.retry_count(&key).unwrap_or(0);
                if attempts >= inner.ceiling {
                    inner.forget(&key, generation);
                    warn!(task = %key, attempts, "Retry ceiling reached");
                    probe.on_abort(AbortReason::Exhausted { attempts }).await;
                    return;
                }

                match probe.poll().await {
                    Tick::Retry => {
                        let count = inner.increment_retry(&key);
                        debug!(task = %key, count, "Poll made no progress");
                    }
                    Tick::Done => {
                        inner.forget(&key, generation);
                        debug!(task = %key, "Task finished");
                        return;
                    }
                    Tick::Abort(reason) => {
                        inner.forget(&key, generation);
                        probe.on_abort(AbortReason::Failed(reason)).await;
                        return;
                    }
                }
            }
        });
        table.timers.insert(name, TimerEntry { generation, handle });
    }

    /// Run `action` once after `delay` under `name`.
    ///
    /// The timer leaves the table the moment it fires, so `action` may stop
    /// or restart any task, including its own name.
    pub fn after<F>(&self, name: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        let mut table = self.inner.lock();
        let generation = table.claim(&name);

        let key = name.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            if !inner.forget(&key, generation) {
                return;
            }
            debug!(task = %key, "One-shot timer fired");
            action.await;
        });
        table.timers.insert(name, TimerEntry { generation, handle });
    }

    /// Cancel the timer registered under `name`. Returns whether one existed.
    pub fn stop(&self, name: &K) -> bool {
        let entry = self.inner.lock().timers.remove(name);
        match entry {
            Some(entry) => {
                entry.handle.abort();
                debug!(task = %name, "Timer stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<(K, TimerEntry)> = self.inner.lock().timers.drain().collect();
        for (name, entry) in drained {
            entry.handle.abort();
            debug!(task = %name, "Timer stopped");
        }
    }

    pub fn increment_retry(&self, name: &K) -> u32 {
        self.inner.increment_retry(name)
    }

    pub fn reset_retry(&self, name: &K) {
        self.inner.lock().retries.remove(name);
    }

    pub fn clear_retries(&self) {
        self.inner.lock().retries.clear();
    }

    /// `None` when the task has not made an unproductive poll since it started.
    pub fn retry_count(&self, name: &K) -> Option<u32> {
        self.inner.retry_count(name)
    }

    pub fn has_exceeded(&self, name: &K) -> bool {
        self.retry_count(name).unwrap_or(0) >= self.inner.ceiling
    }

    pub fn is_active(&self, name: &K) -> bool {
        self.inner.lock().timers.contains_key(name)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().timers.len()
    }
}

impl<K: TaskKey> TaskTable<K> {
    /// Cancel whatever runs under `name` and hand out a fresh generation.
    fn claim(&mut self, name: &K) -> u64 {
        if let Some(previous) = self.timers.remove(name) {
            previous.handle.abort();
            debug!(task = %name, "Replacing running timer");
        }
        self.next_generation += 1;
        self.next_generation
    }
}

impl<K: TaskKey> SchedulerInner<K> {
    fn lock(&self) -> MutexGuard<'_, TaskTable<K>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, name: &K, generation: u64) -> bool {
        self.lock()
            .timers
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Drop the entry for `name` without aborting it, if it still belongs to
    /// `generation`. Used by a task to retire itself.
    fn forget(&self, name: &K, generation: u64) -> bool {
        let mut table = self.lock();
        match table.timers.get(name) {
            Some(entry) if entry.generation == generation => {
                table.timers.remove(name);
                true
            }
            _ => false,
        }
    }

    fn increment_retry(&self, name: &K) -> u32 {
        let mut table = self.lock();
        let count = table.retries.entry(name.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn retry_count(&self, name: &K) -> Option<u32> {
        self.lock().retries.get(name).copied()
    }
}
