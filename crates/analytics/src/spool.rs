// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File spool sink.
//!
//! Writes events as JSON lines to `<root>/<category>/YYYY/MM/DD/<id>.js.tmp`,
//! one open file per category and UTC event day. A file is closed once it holds
//! `max_events_per_file` events, once it is older than `max_file_age`, when a
//! sync fails, or on stop. Closing drops the `.tmp` suffix with a rename, so any
//! file without the suffix is complete. Files still carrying the suffix at
//! startup were left behind by a crash and are renamed by a recovery sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::SinkError;
use crate::event::Event;
use crate::metrics::{Counter, Registry};
use crate::sink::Sink;

pub const LIVE_SUFFIX: &str = ".tmp";
const FILE_EXTENSION: &str = "js";

pub const DEFAULT_MAX_EVENTS_PER_FILE: u64 = 100 << 10;
pub const DEFAULT_MAX_FILE_AGE: Duration = Duration::from_secs(600);
const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;
const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FileSpoolConfig {
    pub root: PathBuf,
    pub max_events_per_file: u64,
    pub max_file_age: Duration,
    pub event_buffer_size: usize,
}

impl FileSpoolConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_events_per_file: DEFAULT_MAX_EVENTS_PER_FILE,
            max_file_age: DEFAULT_MAX_FILE_AGE,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

struct SpoolMetrics {
    events: Arc<Counter>,
    files_opened: Arc<Counter>,
    files_closed: Arc<Counter>,
    write_errors: Arc<Counter>,
    lost: Arc<Counter>,
}

impl SpoolMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            events: registry.counter("spool/events"),
            files_opened: registry.counter("spool/files_opened"),
            files_closed: registry.counter("spool/files_closed"),
            write_errors: registry.counter("spool/write_errors"),
            lost: registry.counter("events/lost"),
        }
    }
}

enum SpoolCommand {
    Events(Vec<Event>),
    Tick,
    Shutdown,
}

struct RunningWorker {
    worker: JoinHandle<()>,
    ticker: CancellationToken,
}

pub struct FileSpoolSink {
    config: FileSpoolConfig,
    metrics: Arc<SpoolMetrics>,
    tx: OnceLock<mpsc::Sender<SpoolCommand>>,
    stopped: AtomicBool,
    running: Mutex<Option<RunningWorker>>,
}

impl FileSpoolSink {
    pub fn new(config: FileSpoolConfig, registry: &Registry) -> Self {
        Self {
            config,
            metrics: Arc::new(SpoolMetrics::new(registry)),
            tx: OnceLock::new(),
            stopped: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    fn lose(&self, n: usize, reason: &str) {
        self.metrics.lost.inc(n as u64);
        warn!("Dropped {} analytics events: {}", n, reason);
    }
}

#[async_trait]
impl Sink for FileSpoolSink {
    async fn start(&self) -> Result<(), SinkError> {
        let mut running = self.running.lock().await;
        if self.tx.get().is_some() {
            return Err(SinkError::AlreadyStarted);
        }

        fs::create_dir_all(&self.config.root).await?;
        let recovered = recover_live_files(&self.config.root).await?;
        if recovered > 0 {
            info!("Recovered {} spool files left open by a previous run", recovered);
        }

        let (tx, rx) = mpsc::channel(self.config.event_buffer_size.max(1));
        if self.tx.set(tx.clone()).is_err() {
            return Err(SinkError::AlreadyStarted);
        }

        let worker = SpoolWorker::new(
            self.config.clone(),
            self.metrics.clone(),
            Arc::new(DataSync),
        );
        let ticker = CancellationToken::new();
        tokio::spawn(run_ticker(tx, ticker.clone()));
        let worker = tokio::spawn(worker.run(rx));
        *running = Some(RunningWorker { worker, ticker });

        info!("Analytics spool started at {}", self.config.root.display());
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.ticker.cancel();
        if let Some(tx) = self.tx.get() {
            if tx.send(SpoolCommand::Shutdown).await.is_err() {
                error!("Analytics spool worker exited before shutdown");
            }
        }
        if let Err(e) = running.worker.await {
            error!("Analytics spool worker failed: {}", e);
        }
        info!("Analytics spool stopped");
    }

    async fn write_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let Some(tx) = self.tx.get() else {
            self.lose(events.len(), "spool not started");
            return;
        };
        if self.stopped.load(Ordering::SeqCst) {
            self.lose(events.len(), "spool stopped");
            return;
        }
        let n = events.len();
        if tx.send(SpoolCommand::Events(events)).await.is_err() {
            self.lose(n, "spool worker gone");
        }
    }
}

async fn run_ticker(tx: mpsc::Sender<SpoolCommand>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ROTATION_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(SpoolCommand::Tick) {
                    break;
                }
            }
        }
    }
}

/// Renames every `*.tmp` file under `root` to its final name. Returns how many
/// files were renamed.
pub async fn recover_live_files(root: &Path) -> Result<usize, SinkError> {
    let mut recovered = 0;
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(final_name) = name.strip_suffix(LIVE_SUFFIX) {
                let final_path = path.with_file_name(final_name);
                fs::rename(&path, &final_path).await?;
                debug!("Recovered spool file {}", final_path.display());
                recovered += 1;
            }
        }
    }
    Ok(recovered)
}

type FileKey = (&'static str, NaiveDate);

/// Makes buffered spool writes durable.
#[async_trait]
trait FileSync: Send + Sync {
    async fn sync(&self, writer: &mut BufWriter<File>) -> std::io::Result<()>;
}

/// Flushes the buffer and `fdatasync`s the file.
struct DataSync;

#[async_trait]
impl FileSync for DataSync {
    async fn sync(&self, writer: &mut BufWriter<File>) -> std::io::Result<()> {
        writer.flush().await?;
        writer.get_ref().sync_data().await
    }
}

struct OpenFile {
    live_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    events: u64,
    opened_at: Instant,
}

struct SpoolWorker {
    config: FileSpoolConfig,
    files: HashMap<FileKey, OpenFile>,
    metrics: Arc<SpoolMetrics>,
    syncer: Arc<dyn FileSync>,
}

impl SpoolWorker {
    fn new(
        config: FileSpoolConfig,
        metrics: Arc<SpoolMetrics>,
        syncer: Arc<dyn FileSync>,
    ) -> Self {
        Self {
            config,
            files: HashMap::new(),
            metrics,
            syncer,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SpoolCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SpoolCommand::Events(events) => self.write(events).await,
                SpoolCommand::Tick => self.close_expired().await,
                SpoolCommand::Shutdown => {
                    rx.close();
                    break;
                }
            }
        }
        while let Some(command) = rx.recv().await {
            if let SpoolCommand::Events(events) = command {
                self.write(events).await;
            }
        }
        let keys: Vec<FileKey> = self.files.keys().copied().collect();
        for key in keys {
            self.close(key).await;
        }
    }

    async fn write(&mut self, events: Vec<Event>) {
        let mut groups: Vec<(FileKey, Vec<Vec<u8>>)> = Vec::new();
        for event in &events {
            let key = (event.category(), event.time().as_datetime().date_naive());
            let mut line = match serde_json::to_vec(event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode {} event: {}", event.category(), e);
                    self.metrics.write_errors.inc(1);
                    continue;
                }
            };
            line.push(b'\n');
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, lines)) => lines.push(line),
                None => groups.push((key, vec![line])),
            }
        }

        for (key, lines) in groups {
            let mut remaining = lines.as_slice();
            while !remaining.is_empty() {
                let open_events = match self.open(key).await {
                    Ok(file) => file.events,
                    Err(e) => {
                        error!("Failed to open spool file for {}: {}", key.0, e);
                        self.metrics.write_errors.inc(remaining.len() as u64);
                        break;
                    }
                };
                let room = self
                    .config
                    .max_events_per_file
                    .saturating_sub(open_events)
                    .max(1);
                let take = remaining.len().min(usize::try_from(room).unwrap_or(usize::MAX));
                let (chunk, rest) = remaining.split_at(take);
                remaining = rest;
                self.append(key, chunk).await;
            }
        }
    }

    async fn open(&mut self, key: FileKey) -> std::io::Result<&mut OpenFile> {
        if !self.files.contains_key(&key) {
            let (category, date) = key;
            let dir = self
                .config
                .root
                .join(category)
                .join(format!("{:04}", date.year()))
                .join(format!("{:02}", date.month()))
                .join(format!("{:02}", date.day()));
            fs::create_dir_all(&dir).await?;

            let name = format!("{}.{}", Uuid::new_v4(), FILE_EXTENSION);
            let final_path = dir.join(&name);
            let live_path = dir.join(format!("{name}{LIVE_SUFFIX}"));
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&live_path)
                .await?;
            debug!("Opened spool file {}", live_path.display());
            self.metrics.files_opened.inc(1);
            self.files.insert(
                key,
                OpenFile {
                    live_path,
                    final_path,
                    writer: BufWriter::new(file),
                    events: 0,
                    opened_at: Instant::now(),
                },
            );
        }
        self.files
            .get_mut(&key)
            .ok_or_else(|| std::io::Error::other("spool file vanished"))
    }

    async fn append(&mut self, key: FileKey, lines: &[Vec<u8>]) {
        let Some(file) = self.files.get_mut(&key) else {
            return;
        };
        let mut written = 0;
        let mut result = Ok(());
        for line in lines {
            if let Err(e) = file.writer.write_all(line).await {
                result = Err(e);
                break;
            }
            written += 1;
        }
        file.events += written;
        self.metrics.events.inc(written);

        if let Err(e) = result {
            error!("Failed to write spool file {}: {}", file.live_path.display(), e);
            self.metrics.write_errors.inc(lines.len() as u64 - written);
            self.close(key).await;
            return;
        }
        if let Err(e) = self.syncer.sync(&mut file.writer).await {
            warn!(
                "Failed to sync spool file {}, rotating: {}",
                file.live_path.display(),
                e
            );
            self.metrics.write_errors.inc(1);
            self.close(key).await;
            return;
        }
        if file.events >= self.config.max_events_per_file {
            self.close(key).await;
        }
    }

    async fn close_expired(&mut self) {
        let expired: Vec<FileKey> = self
            .files
            .iter()
            .filter(|(_, f)| f.opened_at.elapsed() >= self.config.max_file_age)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.close(key).await;
        }
    }

    async fn close(&mut self, key: FileKey) {
        let Some(mut file) = self.files.remove(&key) else {
            return;
        };
        if let Err(e) = self.syncer.sync(&mut file.writer).await {
            warn!("Failed to sync spool file {} on close: {}", file.live_path.display(), e);
            self.metrics.write_errors.inc(1);
        }
        drop(file.writer);
        match fs::rename(&file.live_path, &file.final_path).await {
            Ok(()) => {
                debug!(
                    "Closed spool file {} with {} events",
                    file.final_path.display(),
                    file.events
                );
                self.metrics.files_closed.inc(1);
            }
            Err(e) => {
                error!("Failed to close spool file {}: {}", file.live_path.display(), e);
                self.metrics.write_errors.inc(1);
            }
        }
    }
}
