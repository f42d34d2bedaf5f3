//! Scheduling and retry of fetchers under a global in-flight budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;

use chronoshare_types::Name;

use crate::fetcher::{FetchOptions, Fetcher, SegmentSink};
use crate::scheduler::Scheduler;
use crate::Face;

/// One queued retrieval: a contiguous range under a base name, delivered
/// to a sink.
pub struct FetchJob {
    /// The name all requested segments live under.
    pub base_name: Name,
    /// First sequence to fetch.
    pub min_seq: u64,
    /// Last sequence to fetch (inclusive).
    pub max_seq: u64,
    /// Where arrived segments go.
    pub sink: Arc<dyn SegmentSink>,
}

impl std::fmt::Debug for FetchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchJob")
            .field("base_name", &self.base_name)
            .field("range", &(self.min_seq, self.max_seq))
            .finish()
    }
}

/// Notifications about finished jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Every segment of the job arrived.
    Complete {
        /// The job's base name.
        base_name: Name,
        /// First fetched sequence.
        min_seq: u64,
        /// Last fetched sequence.
        max_seq: u64,
    },
    /// The job kept failing and was abandoned.
    Failed {
        /// The job's base name.
        base_name: Name,
        /// How many runs were attempted.
        attempts: u32,
    },
}

/// Owns the queue of fetch jobs, runs up to `max_parallel` fetchers at a
/// time over a shared in-flight interest budget, and retries failed jobs
/// with capped exponential backoff.
pub struct FetchManager {
    face: Arc<dyn Face>,
    scheduler: Arc<Scheduler>,
    options: FetchOptions,
    budget: Arc<Semaphore>,
    forwarding_hint: Mutex<Option<Name>>,
    queue: Mutex<VecDeque<(FetchJob, u32)>>,
    running: AtomicUsize,
    events: Option<UnboundedSender<FetchEvent>>,
}

impl FetchManager {
    /// Create a manager. `events`, when present, receives a notification
    /// per finished job.
    pub fn new(
        face: Arc<dyn Face>,
        scheduler: Arc<Scheduler>,
        options: FetchOptions,
        events: Option<UnboundedSender<FetchEvent>>,
    ) -> Arc<Self> {
        let budget = Arc::new(Semaphore::new(options.budget.max(1)));
        Arc::new(Self {
            face,
            scheduler,
            options,
            budget,
            forwarding_hint: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            events,
        })
    }

    /// Set the forwarding hint prepended to new fetchers' interests.
    pub fn set_forwarding_hint(&self, hint: Option<Name>) {
        if let Ok(mut current) = self.forwarding_hint.lock() {
            *current = hint;
        }
    }

    /// Queue a job. Starts immediately when a fetcher slot is free.
    pub fn enqueue(self: Arc<Self>, job: FetchJob) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back((job, 0));
        }
        self.pump();
    }

    /// Number of jobs currently running.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn requeue(self: Arc<Self>, job: FetchJob, attempt: u32) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back((job, attempt));
        }
        self.pump();
    }

    fn pump(self: Arc<Self>) {
        loop {
            if self.running.load(Ordering::SeqCst) >= self.options.max_parallel {
                return;
            }
            let (job, attempt) = match self.queue.lock().ok().and_then(|mut q| q.pop_front()) {
                Some(entry) => entry,
                None => return,
            };
            self.running.fetch_add(1, Ordering::SeqCst);
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager.run_job(job, attempt).await;
            });
        }
    }

    async fn run_job(self: Arc<Self>, job: FetchJob, attempt: u32) {
        let hint = self.forwarding_hint.lock().ok().and_then(|h| h.clone());
        let fetcher = Fetcher::new(
            Arc::clone(&self.face),
            job.base_name.clone(),
            job.min_seq,
            job.max_seq,
            self.options.clone(),
        )
        .with_forwarding_hint(hint)
        .with_budget(Arc::clone(&self.budget));

        let result = fetcher.run(&*job.sink).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                tracing::debug!(
                    "fetch complete: {} [{}..{}]",
                    job.base_name,
                    job.min_seq,
                    job.max_seq
                );
                self.emit(FetchEvent::Complete {
                    base_name: job.base_name.clone(),
                    min_seq: job.min_seq,
                    max_seq: job.max_seq,
                });
            }
            Err(e) => {
                let attempts = attempt + 1;
                if attempts <= self.options.max_retries {
                    let delay = retry_backoff(attempts, self.options.max_retry_delay);
                    tracing::warn!(
                        "fetch of {} failed ({}), retry {} in {:?}",
                        job.base_name,
                        e,
                        attempts,
                        delay
                    );
                    let tag = format!("fetch-retry:{}", job.base_name);
                    let manager = Arc::clone(&self);
                    self.scheduler.schedule(&tag, delay, async move {
                        manager.requeue(job, attempts);
                    });
                } else {
                    tracing::error!(
                        "fetch of {} abandoned after {} attempts: {}",
                        job.base_name,
                        attempts,
                        e
                    );
                    self.emit(FetchEvent::Failed {
                        base_name: job.base_name.clone(),
                        attempts,
                    });
                }
            }
        }

        self.pump();
    }

    fn emit(&self, event: FetchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for FetchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchManager")
            .field("running", &self.running())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Exponential backoff capped at `max`: 2^attempt seconds.
fn retry_backoff(attempt: u32, max: Duration) -> Duration {
    let base = Duration::from_secs(2u64.pow(attempt.min(16)));
    base.min(max)
}
