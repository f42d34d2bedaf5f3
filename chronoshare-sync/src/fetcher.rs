//! Pipelined retrieval of one contiguous segment range.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use chronoshare_types::{DataObject, Name};

use crate::{Face, FaceError, FetchError};

/// Tuning for fetchers and the fetch manager.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum outstanding interests per fetcher.
    pub pipeline: usize,
    /// Lifetime of each segment interest.
    pub segment_lifetime: Duration,
    /// Timeouts per segment before abandoning the forwarding hint.
    pub hint_retries: u32,
    /// A fetcher with no successful arrival for this long is failed.
    pub max_no_activity: Duration,
    /// Global in-flight interest budget shared by all fetchers.
    pub budget: usize,
    /// Fetchers run concurrently by the manager.
    pub max_parallel: usize,
    /// Retries of a failed fetcher before giving up.
    pub max_retries: u32,
    /// Ceiling for the exponential retry backoff.
    pub max_retry_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            pipeline: 6,
            segment_lifetime: Duration::from_secs(2),
            hint_retries: 3,
            max_no_activity: Duration::from_secs(30),
            budget: 20,
            max_parallel: 3,
            max_retries: 3,
            max_retry_delay: Duration::from_secs(32),
        }
    }
}

/// Receives segments as they arrive. Delivery order follows arrival, not
/// sequence order; implementations key their writes by the sequence
/// number, so this does not matter.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    /// Handle one arrived segment.
    async fn on_segment(&self, seq: u64, data: DataObject) -> Result<(), FetchError>;
}

/// One pipelined retrieval of the segments `[min_seq, max_seq]` under a
/// base name.
///
/// Keeps up to `pipeline` interests in flight; tracks the in-order
/// high-water mark and the out-of-order arrivals above it; on repeated
/// per-segment timeouts abandons the forwarding hint, and fails entirely
/// once nothing has arrived for `max_no_activity`.
pub struct Fetcher {
    face: Arc<dyn Face>,
    base_name: Name,
    forwarding_hint: Option<Name>,
    min_seq: u64,
    max_seq: u64,
    options: FetchOptions,
    budget: Option<Arc<Semaphore>>,
}

impl Fetcher {
    /// Create a fetcher for `[min_seq, max_seq]` under `base_name`.
    pub fn new(
        face: Arc<dyn Face>,
        base_name: Name,
        min_seq: u64,
        max_seq: u64,
        options: FetchOptions,
    ) -> Self {
        Self {
            face,
            base_name,
            forwarding_hint: None,
            min_seq,
            max_seq,
            options,
            budget: None,
        }
    }

    /// Prepend a forwarding hint to each interest until it proves useless.
    pub fn with_forwarding_hint(mut self, hint: Option<Name>) -> Self {
        self.forwarding_hint = hint;
        self
    }

    /// Draw in-flight permits from a shared budget.
    pub fn with_budget(mut self, budget: Arc<Semaphore>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// The base name the fetched range lives under.
    pub fn base_name(&self) -> &Name {
        &self.base_name
    }

    /// Drive the pipeline to completion, delivering segments to `sink`.
    pub async fn run(&self, sink: &dyn SegmentSink) -> Result<(), FetchError> {
        let (tx, mut rx) = mpsc::channel::<(u64, Result<DataObject, FaceError>)>(
            self.options.pipeline.max(1),
        );

        let mut next_send = self.min_seq;
        let mut next_expected = self.min_seq;
        let mut received_above: BTreeSet<u64> = BTreeSet::new();
        let mut retries: HashMap<u64, u32> = HashMap::new();
        let mut in_flight = 0usize;
        let mut use_hint = self.forwarding_hint.is_some();
        let mut last_activity = Instant::now();

        loop {
            while in_flight < self.options.pipeline && next_send <= self.max_seq {
                self.express(next_send, use_hint, &tx).await?;
                in_flight += 1;
                next_send += 1;
            }

            if next_expected > self.max_seq {
                return Ok(());
            }

            let (seq, result) = match rx.recv().await {
                Some(msg) => msg,
                None => return Err(FetchError::Face(FaceError::Closed)),
            };
            in_flight -= 1;

            match result {
                Ok(data) => {
                    last_activity = Instant::now();
                    retries.remove(&seq);
                    let data = self.unwrap_hinted(data);
                    if seq >= next_expected && !received_above.contains(&seq) {
                        sink.on_segment(seq, data).await?;
                        received_above.insert(seq);
                        while received_above.remove(&next_expected) {
                            next_expected += 1;
                        }
                    }
                }
                Err(FaceError::Timeout(name)) => {
                    if last_activity.elapsed() >= self.options.max_no_activity {
                        tracing::warn!("fetcher for {} went inactive", self.base_name);
                        return Err(FetchError::NoActivity(
                            self.options.max_no_activity.as_secs(),
                        ));
                    }
                    let attempts = retries.entry(seq).or_insert(0);
                    *attempts += 1;
                    tracing::debug!("timeout on {} (attempt {})", name, attempts);
                    if use_hint && *attempts >= self.options.hint_retries {
                        tracing::debug!(
                            "abandoning forwarding hint for {}",
                            self.base_name
                        );
                        use_hint = false;
                    }
                    self.express(seq, use_hint, &tx).await?;
                    in_flight += 1;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    async fn express(
        &self,
        seq: u64,
        use_hint: bool,
        tx: &mpsc::Sender<(u64, Result<DataObject, FaceError>)>,
    ) -> Result<(), FetchError> {
        let permit: Option<OwnedSemaphorePermit> = match &self.budget {
            Some(budget) => Some(
                Arc::clone(budget)
                    .acquire_owned()
                    .await
                    .map_err(|_| FaceError::Closed)?,
            ),
            None => None,
        };

        let name = self.segment_name(seq, use_hint);
        let face = Arc::clone(&self.face);
        let lifetime = self.options.segment_lifetime;
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = face.express_interest(&name, lifetime).await;
            drop(permit);
            let _ = tx.send((seq, result)).await;
        });
        Ok(())
    }

    fn segment_name(&self, seq: u64, use_hint: bool) -> Name {
        match (&self.forwarding_hint, use_hint) {
            (Some(hint), true) => hint
                .clone()
                .append_name(&self.base_name)
                .append_number(seq),
            _ => self.base_name.clone().append_number(seq),
        }
    }

    /// Data served through a forwarding hint wraps the original signed
    /// object; peel it back to the canonical one.
    fn unwrap_hinted(&self, data: DataObject) -> DataObject {
        match &self.forwarding_hint {
            Some(hint) if hint.is_prefix_of(&data.name) => {
                DataObject::from_bytes(&data.content).unwrap_or(data)
            }
            _ => data,
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("base_name", &self.base_name)
            .field("range", &(self.min_seq, self.max_seq))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaceHub;
    use std::sync::Mutex;

    fn quick_options() -> FetchOptions {
        FetchOptions {
            pipeline: 3,
            segment_lifetime: Duration::from_millis(50),
            hint_retries: 2,
            max_no_activity: Duration::from_millis(400),
            ..FetchOptions::default()
        }
    }

    /// Collects delivered (seq, payload) pairs.
    #[derive(Default)]
    struct CollectingSink {
        segments: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    #[async_trait]
    impl SegmentSink for CollectingSink {
        async fn on_segment(&self, seq: u64, data: DataObject) -> Result<(), FetchError> {
            self.segments.lock().unwrap().push((seq, data.content));
            Ok(())
        }
    }

    fn base() -> Name {
        "/alice/laptop/chronoshare/file/h".parse().unwrap()
    }

    async fn publish_segments(hub: &FaceHub, base: &Name, range: std::ops::RangeInclusive<u64>) {
        let face = hub.face();
        for seq in range {
            let name = base.clone().append_number(seq);
            face.put(DataObject::new(name, format!("segment {seq}").into_bytes()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fetches_full_range_in_order() {
        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 0..=4).await;

        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 4, quick_options());
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();

        let segments = sink.segments.lock().unwrap();
        assert_eq!(segments.len(), 5);
        let mut seqs: Vec<u64> = segments.iter().map(|(s, _)| *s).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn single_segment_range() {
        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 7..=7).await;

        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 7, 7, quick_options());
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();

        assert_eq!(sink.segments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_published_segment_is_retried() {
        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 0..=1).await;

        let face = hub.face();
        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 2, quick_options());

        // Publish the last segment only after the first timeout round.
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            face.put(DataObject::new(
                base().append_number(2),
                b"late".to_vec(),
            ))
            .await
            .unwrap();
        });

        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();
        publisher.await.unwrap();

        assert_eq!(sink.segments.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_segment_fails_after_no_activity() {
        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 0..=0).await;

        // Segment 1 never appears.
        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 1, quick_options());
        let sink = CollectingSink::default();
        let result = fetcher.run(&sink).await;

        assert!(matches!(result, Err(FetchError::NoActivity(_))));
        // Segment 0 still made it through.
        assert_eq!(sink.segments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_from_useless_forwarding_hint() {
        let hub = FaceHub::new();
        // Data exists only under the base name, not under the hint.
        publish_segments(&hub, &base(), 0..=2).await;

        let hint: Name = "/isp/pop7".parse().unwrap();
        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 2, quick_options())
            .with_forwarding_hint(Some(hint));
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();

        assert_eq!(sink.segments.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hinted_data_is_unwrapped() {
        let hub = FaceHub::new();
        let hint: Name = "/isp/pop7".parse().unwrap();

        // A peer re-serves the signed object wrapped under the hint name.
        let server = hub.face();
        let inner = DataObject::new(base().append_number(0), b"inner".to_vec());
        let wrapped = DataObject::new(
            hint.clone().append_name(&base()).append_number(0),
            inner.to_bytes().unwrap(),
        );
        server.put(wrapped).await.unwrap();

        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 0, quick_options())
            .with_forwarding_hint(Some(hint));
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();

        let segments = sink.segments.lock().unwrap();
        assert_eq!(segments[0].1, b"inner");
    }

    #[tokio::test]
    async fn respects_shared_budget() {
        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 0..=9).await;

        // A budget of one interest at a time still completes.
        let budget = Arc::new(Semaphore::new(1));
        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 9, quick_options())
            .with_budget(budget);
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();

        assert_eq!(sink.segments.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn empty_range_completes_immediately() {
        let hub = FaceHub::new();
        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 3, 2, quick_options());
        let sink = CollectingSink::default();
        fetcher.run(&sink).await.unwrap();
        assert!(sink.segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_error_aborts_the_run() {
        struct FailingSink;

        #[async_trait]
        impl SegmentSink for FailingSink {
            async fn on_segment(&self, _: u64, _: DataObject) -> Result<(), FetchError> {
                Err(FetchError::Sink("store is broken".into()))
            }
        }

        let hub = FaceHub::new();
        publish_segments(&hub, &base(), 0..=2).await;

        let fetcher = Fetcher::new(Arc::new(hub.face()), base(), 0, 2, quick_options());
        let result = fetcher.run(&FailingSink).await;
        assert!(matches!(result, Err(FetchError::Sink(_))));
    }
}
