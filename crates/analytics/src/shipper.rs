// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching shipper.
//!
//! Producers hand slices of events to [`Shipper::write_events`], which only
//! enqueues them on a bounded channel. A single worker task owns every piece of
//! batching state: it encodes each event into a pooled buffer, appends it to the
//! batch of the stream its category routes to, and flushes a stream once its
//! batch is big enough or old enough, unless a recent whole-call failure put the
//! shipper in backoff. A ticker enqueues a wakeup every second so age-based
//! flushes fire without traffic.
//!
//! Per-record failures stay at the head of their batch and are retried with the
//! next flush of that stream; whole-call failures keep the batch intact.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ShipperError, SinkError};
use crate::event::Event;
use crate::metrics::{Counter, Gauge, Histogram, Registry};
use crate::pool::Pool;
use crate::sink::Sink;
use crate::stream::{BatchSink, Record, MAX_BATCH};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 128;
pub const DEFAULT_MAX_BATCH_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// Pause applied to all streams after a whole-call put failure.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(10);

const WAKEUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Category to stream name. The empty category is the default route.
    pub category_to_stream: HashMap<String, String>,
    pub max_batch_size: usize,
    pub max_batch_duration: Duration,
    /// Capacity of the inbound channel, counted in `write_events` calls.
    pub event_buffer_size: usize,
    /// Drop and count writes that find the inbound channel full instead of
    /// waiting for room.
    pub lossy: bool,
}

impl ShipperConfig {
    pub fn new(category_to_stream: HashMap<String, String>) -> Self {
        Self {
            category_to_stream,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_duration: DEFAULT_MAX_BATCH_DURATION,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            lossy: false,
        }
    }

    fn normalized(mut self) -> Self {
        if self.max_batch_size == 0 {
            self.max_batch_size = DEFAULT_MAX_BATCH_SIZE;
        }
        self.max_batch_size = self.max_batch_size.min(MAX_BATCH);
        if self.max_batch_duration.is_zero() {
            self.max_batch_duration = DEFAULT_MAX_BATCH_DURATION;
        }
        if self.event_buffer_size == 0 {
            self.event_buffer_size = DEFAULT_EVENT_BUFFER_SIZE;
        }
        self
    }
}

struct ShipperMetrics {
    events_in: Arc<Counter>,
    events_success: Arc<Counter>,
    events_failure: Arc<Counter>,
    events_lost: Arc<Counter>,
    encode_failure: Arc<Counter>,
    put_success: Arc<Counter>,
    put_failure: Arc<Counter>,
    put_batchsize: Arc<Histogram>,
    batchsize: Arc<Gauge>,
}

impl ShipperMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            events_in: registry.counter("events/in"),
            events_success: registry.counter("events/success"),
            events_failure: registry.counter("events/failure"),
            events_lost: registry.counter("events/lost"),
            encode_failure: registry.counter("events/encode_failure"),
            put_success: registry.counter("put/success"),
            put_failure: registry.counter("put/failure"),
            put_batchsize: registry.histogram("put/batchsize"),
            batchsize: registry.gauge("batchsize"),
        }
    }
}

#[derive(Debug)]
enum ShipperCommand {
    Events(Vec<Event>),
    Tick,
    Pending(oneshot::Sender<HashMap<String, usize>>),
    Shutdown,
}

#[derive(Clone)]
struct Routes {
    by_category: HashMap<String, Arc<str>>,
    default: Option<Arc<str>>,
}

impl Routes {
    fn resolve(&self, category: &str) -> Option<&Arc<str>> {
        self.by_category.get(category).or(self.default.as_ref())
    }

    fn streams(&self) -> impl Iterator<Item = &Arc<str>> {
        self.by_category.values().chain(self.default.iter())
    }
}

struct RunningWorker {
    worker: JoinHandle<()>,
    ticker: CancellationToken,
}

/// [`Sink`] that batches events per stream and ships them through a
/// [`BatchSink`].
pub struct Shipper {
    client: Arc<dyn BatchSink>,
    routes: Routes,
    config: ShipperConfig,
    metrics: Arc<ShipperMetrics>,
    tx: OnceLock<mpsc::Sender<ShipperCommand>>,
    stopped: AtomicBool,
    running: Mutex<Option<RunningWorker>>,
}

impl Shipper {
    /// Validates the stream map and registers the shipper metrics in
    /// `registry`. Nothing runs until [`Sink::start`].
    pub fn new(
        client: Arc<dyn BatchSink>,
        config: ShipperConfig,
        registry: &Registry,
    ) -> Result<Self, ShipperError> {
        let config = config.normalized();
        if config.category_to_stream.is_empty() {
            return Err(ShipperError::EmptyStreamMap);
        }

        let mut by_category = HashMap::new();
        let mut default = None;
        let mut interned: HashMap<&str, Arc<str>> = HashMap::new();
        for (category, stream) in &config.category_to_stream {
            if stream.is_empty() {
                return Err(ShipperError::EmptyStreamName(category.clone()));
            }
            let stream = interned
                .entry(stream.as_str())
                .or_insert_with(|| Arc::from(stream.as_str()))
                .clone();
            if category.is_empty() {
                default = Some(stream);
            } else {
                by_category.insert(category.clone(), stream);
            }
        }

        Ok(Self {
            client,
            routes: Routes {
                by_category,
                default,
            },
            metrics: Arc::new(ShipperMetrics::new(registry)),
            config,
            tx: OnceLock::new(),
            stopped: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Number of buffered events per stream, as seen by the worker once every
    /// previously enqueued write has been processed.
    pub async fn pending(&self) -> Result<HashMap<String, usize>, SinkError> {
        let tx = self.tx.get().ok_or(SinkError::NotStarted)?;
        let (response_tx, response_rx) = oneshot::channel();
        tx.send(ShipperCommand::Pending(response_tx))
            .await
            .map_err(|_| SinkError::NotStarted)?;
        response_rx.await.map_err(|_| SinkError::NotStarted)
    }

    fn lose(&self, n: usize, reason: &str) {
        self.metrics.events_lost.inc(n as u64);
        warn!("Dropped {} analytics events: {}", n, reason);
    }
}

#[async_trait]
impl Sink for Shipper {
    async fn start(&self) -> Result<(), SinkError> {
        let mut running = self.running.lock().await;
        let (tx, rx) = mpsc::channel(self.config.event_buffer_size);
        if self.tx.set(tx.clone()).is_err() {
            return Err(SinkError::AlreadyStarted);
        }

        let worker = Worker::new(
            self.client.clone(),
            self.routes.clone(),
            &self.config,
            self.metrics.clone(),
        );
        let ticker = CancellationToken::new();
        tokio::spawn(run_ticker(tx, ticker.clone()));
        let worker = tokio::spawn(worker.run(rx));

        *running = Some(RunningWorker { worker, ticker });
        info!(
            "Analytics shipper started with max batch size {} and max batch duration {:?}",
            self.config.max_batch_size, self.config.max_batch_duration
        );
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let Some(running) = self.running.lock().await.take() else {
            debug!("Analytics shipper stop called while not running");
            return;
        };

        running.ticker.cancel();
        if let Some(tx) = self.tx.get() {
            if tx.send(ShipperCommand::Shutdown).await.is_err() {
                error!("Analytics shipper worker exited before shutdown");
            }
        }
        if let Err(e) = running.worker.await {
            error!("Analytics shipper worker failed: {}", e);
        }
        info!("Analytics shipper stopped");
    }

    async fn write_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let Some(tx) = self.tx.get() else {
            self.lose(events.len(), "shipper not started");
            return;
        };
        if self.stopped.load(Ordering::SeqCst) {
            self.lose(events.len(), "shipper stopped");
            return;
        }

        let n = events.len();
        if self.config.lossy {
            match tx.try_send(ShipperCommand::Events(events)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.lose(n, "inbound channel full"),
                Err(TrySendError::Closed(_)) => self.lose(n, "inbound channel closed"),
            }
        } else if tx.send(ShipperCommand::Events(events)).await.is_err() {
            self.lose(n, "inbound channel closed");
        }
    }
}

async fn run_ticker(tx: mpsc::Sender<ShipperCommand>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WAKEUP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => match tx.try_send(ShipperCommand::Tick) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Inbound channel full, skipping wakeup"),
                Err(TrySendError::Closed(_)) => break,
            },
        }
    }
}

/// The sole owner of batches, put times and backoff.
struct Worker {
    client: Arc<dyn BatchSink>,
    routes: Routes,
    max_batch_size: usize,
    max_batch_duration: Duration,
    batches: HashMap<Arc<str>, Vec<BytesMut>>,
    last_put: HashMap<Arc<str>, Instant>,
    backoff: Duration,
    failed_at: Option<Instant>,
    buffers: Pool<BytesMut>,
    records: Pool<Record>,
    sequence: u64,
    metrics: Arc<ShipperMetrics>,
}

impl Worker {
    fn new(
        client: Arc<dyn BatchSink>,
        routes: Routes,
        config: &ShipperConfig,
        metrics: Arc<ShipperMetrics>,
    ) -> Self {
        let now = Instant::now();
        let mut batches = HashMap::new();
        let mut last_put = HashMap::new();
        for stream in routes.streams() {
            batches.insert(stream.clone(), Vec::new());
            last_put.insert(stream.clone(), now);
        }
        Self {
            client,
            routes,
            max_batch_size: config.max_batch_size,
            max_batch_duration: config.max_batch_duration,
            batches,
            last_put,
            backoff: Duration::ZERO,
            failed_at: None,
            buffers: Pool::new(),
            records: Pool::new(),
            sequence: 0,
            metrics,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ShipperCommand>) {
        debug!("Analytics shipper worker started");
        while let Some(command) = rx.recv().await {
            match command {
                ShipperCommand::Events(events) => {
                    self.metrics.events_in.inc(events.len() as u64);
                    self.append(events);
                    self.flush_ready(Instant::now()).await;
                }
                ShipperCommand::Tick => self.flush_ready(Instant::now()).await,
                ShipperCommand::Pending(response_tx) => {
                    if response_tx.send(self.pending()).is_err() {
                        debug!("Pending batch size requester went away");
                    }
                }
                ShipperCommand::Shutdown => {
                    rx.close();
                    break;
                }
            }
        }
        while let Some(command) = rx.recv().await {
            match command {
                ShipperCommand::Events(events) => {
                    self.metrics.events_in.inc(events.len() as u64);
                    self.append(events);
                }
                ShipperCommand::Pending(response_tx) => {
                    if response_tx.send(self.pending()).is_err() {
                        debug!("Pending batch size requester went away");
                    }
                }
                ShipperCommand::Tick | ShipperCommand::Shutdown => {}
            }
        }
        self.drain().await;
        debug!("Analytics shipper worker exited");
    }

    fn append(&mut self, events: Vec<Event>) {
        for event in events {
            let Some(stream) = self.routes.resolve(event.category()) else {
                continue;
            };
            let mut buf = self.buffers.get();
            buf.clear();
            if let Err(e) = serde_json::to_writer((&mut buf).writer(), &event) {
                error!("Failed to encode {} event: {}", event.category(), e);
                self.metrics.encode_failure.inc(1);
                self.buffers.put(buf);
                continue;
            }
            buf.put_u8(b'\n');
            self.batches.entry(stream.clone()).or_default().push(buf);
        }
    }

    async fn flush_ready(&mut self, now: Instant) {
        let ready: Vec<Arc<str>> = self
            .batches
            .iter()
            .filter(|(stream, batch)| !batch.is_empty() && self.should_flush(stream, batch.len(), now))
            .map(|(stream, _)| stream.clone())
            .collect();

        for stream in ready {
            // An earlier put in this pass may have started a backoff.
            let len = self.batches.get(&stream).map_or(0, Vec::len);
            if !self.should_flush(&stream, len, now) {
                continue;
            }
            self.last_put.insert(stream.clone(), now);
            let batch = self.batches.remove(&stream).unwrap_or_default();
            let batch = self.flush(&stream, batch, now).await;
            self.batches.insert(stream, batch);
        }
        self.update_gauge();
    }

    fn should_flush(&self, stream: &Arc<str>, len: usize, now: Instant) -> bool {
        let since = self
            .last_put
            .get(stream)
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(*t));
        let due = len >= self.max_batch_size || since > self.max_batch_duration;
        let backoff_elapsed = self.backoff.is_zero()
            || (since > self.backoff
                && self
                    .failed_at
                    .map_or(true, |t| now.saturating_duration_since(t) > self.backoff));
        due && backoff_elapsed
    }

    /// Puts up to [`MAX_BATCH`] records of `batch` and returns what is left to
    /// ship for the stream: failed records first, then the unsent overflow.
    async fn flush(&mut self, stream: &str, mut batch: Vec<BytesMut>, now: Instant) -> Vec<BytesMut> {
        if batch.is_empty() {
            return batch;
        }
        let overflow = if batch.len() > MAX_BATCH {
            batch.split_off(MAX_BATCH)
        } else {
            Vec::new()
        };
        self.metrics.put_batchsize.update(batch.len() as i64);

        let mut records: Vec<Record> = Vec::with_capacity(batch.len());
        for data in batch.drain(..) {
            let mut record = self.records.get();
            record.data = data;
            record.partition_key.clear();
            record.partition_key.push_str(&format!("{:x}", self.sequence));
            self.sequence = self.sequence.wrapping_add(1);
            records.push(record);
        }

        match self.client.put_batch(stream, &records).await {
            Err(e) => {
                warn!(
                    "Failed to put {} records on stream {}: {}",
                    records.len(),
                    stream,
                    e
                );
                self.metrics.put_failure.inc(1);
                self.backoff = FAILURE_BACKOFF;
                self.failed_at = Some(now);
                batch.extend(records.iter_mut().map(|r| mem::take(&mut r.data)));
            }
            Ok(statuses) => {
                self.metrics.put_success.inc(1);
                self.backoff = Duration::ZERO;
                self.failed_at = None;

                let mut succeeded = 0;
                for (i, record) in records.iter_mut().enumerate() {
                    let data = mem::take(&mut record.data);
                    match statuses.get(i) {
                        Some(status) if status.is_success() => {
                            succeeded += 1;
                            self.buffers.put(data);
                        }
                        Some(status) => {
                            debug!(
                                "Record rejected by stream {}: {} {}",
                                stream, status.error_code, status.error_message
                            );
                            batch.push(data);
                        }
                        None => batch.push(data),
                    }
                }
                self.metrics.events_success.inc(succeeded);
                self.metrics.events_failure.inc(batch.len() as u64);
                if !batch.is_empty() {
                    warn!(
                        "{} of {} records failed on stream {}, retrying later",
                        batch.len(),
                        records.len(),
                        stream
                    );
                }
            }
        }

        for mut record in records {
            record.data = BytesMut::new();
            record.partition_key.clear();
            self.records.put(record);
        }
        batch.extend(overflow);
        batch
    }

    /// Final flush of every stream. Backoff is ignored and each stream is
    /// flushed again for as long as the previous attempt shrank its batch.
    async fn drain(&mut self) {
        let streams: Vec<Arc<str>> = self.batches.keys().cloned().collect();
        for stream in streams {
            loop {
                let batch = self.batches.remove(&stream).unwrap_or_default();
                let before = batch.len();
                if before == 0 {
                    self.batches.insert(stream.clone(), batch);
                    break;
                }
                let now = Instant::now();
                self.last_put.insert(stream.clone(), now);
                let batch = self.flush(&stream, batch, now).await;
                let after = batch.len();
                self.batches.insert(stream.clone(), batch);
                if after >= before {
                    warn!(
                        "Dropping {} unshipped events for stream {} on shutdown",
                        after, stream
                    );
                    break;
                }
            }
        }
        self.update_gauge();
    }

    fn pending(&self) -> HashMap<String, usize> {
        self.batches
            .iter()
            .map(|(stream, batch)| (stream.to_string(), batch.len()))
            .collect()
    }

    fn update_gauge(&self) {
        let total: usize = self.batches.values().map(Vec::len).sum();
        self.metrics.batchsize.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::errors::PutBatchError;
    use crate::event::{ClientEvent, ServerEvent};
    use crate::metrics::MetricSnapshot;
    use crate::stream::RecordStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    struct PutCall {
        stream: String,
        records: Vec<String>,
        partition_keys: Vec<String>,
    }

    enum Reply {
        Fail,
        Statuses(Vec<RecordStatus>),
    }

    #[derive(Default)]
    struct MockBatchSink {
        calls: StdMutex<Vec<PutCall>>,
        replies: StdMutex<VecDeque<Reply>>,
    }

    impl MockBatchSink {
        fn reply(&self, reply: Reply) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> Vec<PutCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for MockBatchSink {
        async fn put_batch(
            &self,
            stream: &str,
            records: &[Record],
        ) -> Result<Vec<RecordStatus>, PutBatchError> {
            self.calls.lock().unwrap().push(PutCall {
                stream: stream.to_string(),
                records: records
                    .iter()
                    .map(|r| String::from_utf8(r.data.to_vec()).unwrap())
                    .collect(),
                partition_keys: records.iter().map(|r| r.partition_key.clone()).collect(),
            });
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Fail) => Err(PutBatchError::Transport("connection reset".to_string())),
                Some(Reply::Statuses(statuses)) => Ok(statuses),
                None => Ok(vec![RecordStatus::success(); records.len()]),
            }
        }
    }

    fn ts() -> Timestamp {
        Timestamp::parse("2015-11-23 17:42:09.123").unwrap()
    }

    fn server_event(name: &str) -> Event {
        ServerEvent::new(name, ts()).into()
    }

    fn streams(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(c, s)| (c.to_string(), s.to_string()))
            .collect()
    }

    fn client_server_config(max_batch_size: usize) -> ShipperConfig {
        let mut config = ShipperConfig::new(streams(&[
            ("client", "clientstream"),
            ("server", "serverstream"),
        ]));
        config.max_batch_size = max_batch_size;
        config
    }

    async fn started(
        config: ShipperConfig,
    ) -> (Shipper, Arc<MockBatchSink>, Registry) {
        let mock = Arc::new(MockBatchSink::default());
        let registry = Registry::new();
        let shipper = Shipper::new(mock.clone(), config, &registry).unwrap();
        shipper.start().await.unwrap();
        (shipper, mock, registry)
    }

    fn counter(registry: &Registry, name: &str) -> u64 {
        match registry.snapshot().get(name) {
            Some(MetricSnapshot::Counter(n)) => *n,
            other => panic!("{name} is not a counter: {other:?}"),
        }
    }

    fn test_worker(mock: Arc<MockBatchSink>, config: ShipperConfig, registry: &Registry) -> Worker {
        let shipper = Shipper::new(mock, config, registry).unwrap();
        Worker::new(
            shipper.client.clone(),
            shipper.routes.clone(),
            &shipper.config,
            shipper.metrics.clone(),
        )
    }

    #[test]
    fn test_new_rejects_empty_stream_map() {
        let result = Shipper::new(
            Arc::new(MockBatchSink::default()),
            ShipperConfig::new(HashMap::new()),
            &Registry::new(),
        );
        assert_eq!(result.err(), Some(ShipperError::EmptyStreamMap));
    }

    #[test]
    fn test_new_rejects_empty_stream_name() {
        let result = Shipper::new(
            Arc::new(MockBatchSink::default()),
            ShipperConfig::new(streams(&[("client", "")])),
            &Registry::new(),
        );
        assert_eq!(
            result.err(),
            Some(ShipperError::EmptyStreamName("client".to_string()))
        );
    }

    #[test]
    fn test_config_normalization() {
        let mut config = ShipperConfig::new(streams(&[("", "d")]));
        config.max_batch_size = 0;
        config.max_batch_duration = Duration::ZERO;
        config.event_buffer_size = 0;
        let config = config.normalized();
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.max_batch_duration, DEFAULT_MAX_BATCH_DURATION);
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);

        let mut config = ShipperConfig::new(streams(&[("", "d")]));
        config.max_batch_size = 10_000;
        assert_eq!(config.normalized().max_batch_size, MAX_BATCH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_flushes_at_batch_size_one() {
        let (shipper, mock, _) = started(client_server_config(1)).await;

        shipper.write_events(vec![server_event("test")]).await;
        let pending = shipper.pending().await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![PutCall {
                stream: "serverstream".to_string(),
                records: vec![
                    "{\"event\":\"test\",\"time\":\"2015-11-23 17:42:09.123\"}\n".to_string()
                ],
                partition_keys: vec!["0".to_string()],
            }]
        );
        assert_eq!(pending["serverstream"], 0);
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_threshold_holds_then_flushes_in_order() {
        let (shipper, mock, registry) = started(client_server_config(2)).await;

        shipper.write_events(vec![server_event("test")]).await;
        let pending = shipper.pending().await.unwrap();
        assert!(mock.calls().is_empty());
        assert_eq!(pending["serverstream"], 1);

        shipper.write_events(vec![server_event("test2")]).await;
        let pending = shipper.pending().await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].records.len(), 2);
        assert!(calls[0].records[0].contains("\"test\""));
        assert!(calls[0].records[1].contains("\"test2\""));
        assert_eq!(pending["serverstream"], 0);

        assert_eq!(counter(&registry, "events/in"), 2);
        assert_eq!(counter(&registry, "events/success"), 2);
        assert_eq!(counter(&registry, "put/success"), 1);
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_call_failure_retains_batch() {
        let (shipper, mock, registry) = started(client_server_config(2)).await;
        mock.reply(Reply::Fail);

        shipper
            .write_events(vec![server_event("test3"), server_event("test4")])
            .await;
        let pending = shipper.pending().await.unwrap();

        assert_eq!(mock.calls().len(), 1);
        assert_eq!(pending["serverstream"], 2);
        assert_eq!(counter(&registry, "put/failure"), 1);
        assert_eq!(counter(&registry, "events/success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_blocks_all_streams_until_elapsed() {
        let (shipper, mock, registry) = started(client_server_config(1)).await;
        mock.reply(Reply::Fail);

        shipper.write_events(vec![server_event("a")]).await;
        shipper.pending().await.unwrap();
        assert_eq!(mock.calls().len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        shipper.write_events(vec![server_event("b")]).await;
        shipper
            .write_events(vec![ClientEvent::new("c", ts()).into()])
            .await;
        tokio::time::sleep(Duration::from_millis(6500)).await;
        let pending = shipper.pending().await.unwrap();
        assert_eq!(mock.calls().len(), 1, "no put while backing off");
        assert_eq!(pending["serverstream"], 2);
        assert_eq!(pending["clientstream"], 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let pending = shipper.pending().await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        let server_call = calls[1..]
            .iter()
            .find(|c| c.stream == "serverstream")
            .unwrap();
        assert_eq!(server_call.records.len(), 2);
        assert!(server_call.records[0].contains("\"a\""));
        assert!(server_call.records[1].contains("\"b\""));
        assert_eq!(pending["serverstream"], 0);
        assert_eq!(pending["clientstream"], 0);
        assert_eq!(counter(&registry, "put/failure"), 1);
        assert_eq!(counter(&registry, "put/success"), 2);
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_threshold_flushes_on_tick() {
        let (shipper, mock, _) = started(client_server_config(128)).await;

        shipper.write_events(vec![server_event("lonely")]).await;
        tokio::time::sleep(Duration::from_millis(5500)).await;
        shipper.pending().await.unwrap();
        assert!(mock.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let pending = shipper.pending().await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stream, "serverstream");
        assert_eq!(calls[0].records.len(), 1);
        assert_eq!(pending["serverstream"], 0);
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_stream_routing() {
        let mut config = ShipperConfig::new(streams(&[("", "defaultstream")]));
        config.max_batch_size = 2;
        let (shipper, mock, _) = started(config).await;

        shipper
            .write_events(vec![
                ClientEvent::new("from_client", ts()).into(),
                server_event("from_server"),
            ])
            .await;
        shipper.pending().await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stream, "defaultstream");
        assert!(calls[0].records[0].contains("from_client"));
        assert!(calls[0].records[1].contains("from_server"));
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_category_is_skipped() {
        let mut config = ShipperConfig::new(streams(&[("client", "clientstream")]));
        config.max_batch_size = 1;
        let (shipper, mock, registry) = started(config).await;

        shipper.write_events(vec![server_event("nowhere")]).await;
        let pending = shipper.pending().await.unwrap();
        shipper.stop().await;

        assert!(mock.calls().is_empty());
        assert_eq!(pending.values().sum::<usize>(), 0);
        assert_eq!(counter(&registry, "events/in"), 1);
        assert_eq!(counter(&registry, "events/success"), 0);
        assert_eq!(counter(&registry, "events/failure"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_keeps_failed_records_at_head() {
        let (shipper, mock, registry) = started(client_server_config(3)).await;
        mock.reply(Reply::Statuses(vec![
            RecordStatus::success(),
            RecordStatus::failure("ProvisionedThroughputExceeded", "slow down"),
            RecordStatus::success(),
        ]));

        shipper
            .write_events(vec![server_event("a"), server_event("b"), server_event("c")])
            .await;
        let pending = shipper.pending().await.unwrap();
        assert_eq!(pending["serverstream"], 1);
        assert_eq!(counter(&registry, "events/success"), 2);
        assert_eq!(counter(&registry, "events/failure"), 1);

        shipper
            .write_events(vec![server_event("d"), server_event("e")])
            .await;
        shipper.pending().await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].records[0].contains("\"b\""));
        assert!(calls[1].records[1].contains("\"d\""));
        assert!(calls[1].records[2].contains("\"e\""));
        assert_eq!(calls[1].partition_keys, vec!["3", "4", "5"]);
        shipper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_pending_batches() {
        let (shipper, mock, registry) = started(client_server_config(10)).await;
        shipper
            .write_events(vec![server_event("x"), ClientEvent::new("y", ts()).into()])
            .await;
        shipper.stop().await;

        let mut streams: Vec<String> = mock.calls().into_iter().map(|c| c.stream).collect();
        streams.sort();
        assert_eq!(streams, vec!["clientstream", "serverstream"]);
        assert_eq!(registry.gauge("batchsize").value(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_despite_backoff() {
        let (shipper, mock, _) = started(client_server_config(1)).await;
        mock.reply(Reply::Fail);
        shipper.write_events(vec![server_event("retry_me")]).await;
        shipper.pending().await.unwrap();

        shipper.stop().await;
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].records, calls[1].records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_outside_lifecycle_are_lost() {
        let mock = Arc::new(MockBatchSink::default());
        let registry = Registry::new();
        let shipper = Shipper::new(mock.clone(), client_server_config(1), &registry).unwrap();

        shipper.write_events(vec![server_event("early")]).await;
        assert_eq!(counter(&registry, "events/lost"), 1);

        shipper.start().await.unwrap();
        assert!(matches!(
            shipper.start().await,
            Err(SinkError::AlreadyStarted)
        ));
        shipper.stop().await;

        shipper.write_events(vec![server_event("late"), server_event("later")]).await;
        assert_eq!(counter(&registry, "events/lost"), 3);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_drops_when_channel_full() {
        let mut config = client_server_config(128);
        config.event_buffer_size = 1;
        config.lossy = true;
        let (shipper, _mock, registry) = started(config).await;

        // The worker cannot run until this task yields, so the channel fills.
        for name in ["a", "b", "c"] {
            shipper.write_events(vec![server_event(name)]).await;
        }
        assert!(counter(&registry, "events/lost") >= 2);
        shipper.stop().await;
    }

    #[tokio::test]
    async fn test_flush_clamps_to_max_batch_and_requeues_overflow() {
        let mock = Arc::new(MockBatchSink::default());
        let registry = Registry::new();
        let mut worker = test_worker(mock.clone(), client_server_config(500), &registry);

        let events: Vec<Event> = (0..600).map(|i| server_event(&format!("e{i}"))).collect();
        worker.append(events);
        let stream: Arc<str> = Arc::from("serverstream");
        let batch = worker.batches.remove(&stream).unwrap();
        let rest = worker.flush(&stream, batch, Instant::now()).await;

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].records.len(), MAX_BATCH);
        assert!(calls[0].records[0].contains("\"e0\""));
        assert_eq!(rest.len(), 100);
        assert!(String::from_utf8_lossy(&rest[0]).contains("\"e500\""));
        assert!(String::from_utf8_lossy(&rest[99]).contains("\"e599\""));
        assert_eq!(worker.buffers.idle(), MAX_BATCH);
        assert_eq!(worker.records.idle(), MAX_BATCH);
    }

    #[tokio::test]
    async fn test_whole_call_failure_keeps_order_with_overflow() {
        let mock = Arc::new(MockBatchSink::default());
        mock.reply(Reply::Fail);
        let registry = Registry::new();
        let mut worker = test_worker(mock.clone(), client_server_config(500), &registry);

        worker.append((0..501).map(|i| server_event(&format!("e{i}"))).collect());
        let stream: Arc<str> = Arc::from("serverstream");
        let batch = worker.batches.remove(&stream).unwrap();
        let rest = worker.flush(&stream, batch, Instant::now()).await;

        assert_eq!(rest.len(), 501);
        for (i, buf) in rest.iter().enumerate() {
            assert!(String::from_utf8_lossy(buf).contains(&format!("\"e{i}\"")));
        }
        assert_eq!(worker.backoff, FAILURE_BACKOFF);
        assert_eq!(worker.buffers.idle(), 0);
    }

    #[tokio::test]
    async fn test_drain_repeats_until_empty() {
        let mock = Arc::new(MockBatchSink::default());
        let registry = Registry::new();
        let mut worker = test_worker(mock.clone(), client_server_config(500), &registry);

        worker.append((0..1200).map(|i| server_event(&format!("e{i}"))).collect());
        worker.drain().await;

        let sizes: Vec<usize> = mock.calls().iter().map(|c| c.records.len()).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(worker.pending()["serverstream"], 0);
        assert_eq!(counter(&registry, "events/success"), 1200);
    }

    #[tokio::test]
    async fn test_drain_stops_when_no_progress() {
        let mock = Arc::new(MockBatchSink::default());
        mock.reply(Reply::Statuses(vec![RecordStatus::failure("Err", "nope")]));
        let registry = Registry::new();
        let mut worker = test_worker(mock.clone(), client_server_config(500), &registry);

        worker.append(vec![server_event("stuck")]);
        worker.drain().await;

        assert_eq!(mock.calls().len(), 1);
        assert_eq!(worker.pending()["serverstream"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_streams_later_in_same_pass() {
        let (shipper, mock, registry) = started(client_server_config(1)).await;
        mock.reply(Reply::Fail);
        mock.reply(Reply::Fail);

        shipper
            .write_events(vec![server_event("a"), ClientEvent::new("c", ts()).into()])
            .await;
        let pending = shipper.pending().await.unwrap();

        assert_eq!(mock.calls().len(), 1);
        assert_eq!(counter(&registry, "put/failure"), 1);
        assert_eq!(pending.values().sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_worker_drains_events_queued_behind_shutdown() {
        let mock = Arc::new(MockBatchSink::default());
        let registry = Registry::new();
        let worker = test_worker(mock.clone(), client_server_config(10), &registry);

        let (tx, rx) = mpsc::channel(8);
        tx.send(ShipperCommand::Events(vec![server_event("before")]))
            .await
            .unwrap();
        tx.send(ShipperCommand::Shutdown).await.unwrap();
        tx.send(ShipperCommand::Events(vec![server_event("after")]))
            .await
            .unwrap();
        worker.run(rx).await;

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].records.len(), 2);
        assert!(calls[0].records[0].contains("\"before\""));
        assert!(calls[0].records[1].contains("\"after\""));
        assert_eq!(counter(&registry, "events/in"), 2);
        assert_eq!(counter(&registry, "events/success"), 2);
    }
}
