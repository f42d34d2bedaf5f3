//! Delayed and periodic task scheduling with tag coalescing.
//!
//! Every delayed task carries a string tag. Scheduling a tag that already
//! has a pending task replaces it, so a burst of reschedules collapses to
//! a single invocation - the coalescing behavior the sync core and the
//! recovery path rely on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

/// The single timer source shared by the sync core, fetch manager, and
/// content server.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`. A pending task with the same tag is
    /// replaced, resetting its timer.
    pub fn schedule<F>(&self, tag: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            task.await;
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, h| !h.is_finished());
            if let Some(old) = tasks.insert(tag.to_string(), handle) {
                old.abort();
            }
        }
    }

    /// Run `make_task` every `every`, starting one period from now.
    pub fn schedule_periodic<F, Fut>(&self, tag: &str, every: Duration, mut make_task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.tick().await; // the immediate first tick
            loop {
                timer.tick().await;
                make_task().await;
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old) = tasks.insert(tag.to_string(), handle) {
                old.abort();
            }
        }
    }

    /// Cancel the pending task with `tag`. Returns whether one existed.
    pub fn cancel(&self, tag: &str) -> bool {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(tag) {
                let live = !handle.is_finished();
                handle.abort();
                return live;
            }
        }
        false
    }

    /// Number of tracked (possibly finished) tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether no tasks are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every pending task.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("len", &self.len()).finish()
    }
}

/// A scheduler behind an `Arc`, the shape every component takes it in.
pub type SchedulerHandle = Arc<Scheduler>;
