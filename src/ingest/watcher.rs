//! File Watcher: one task per configured source
//!
//! Main loop:
//! 1. Read the next complete line from the source
//! 2. Parse and classify it; rejected lines go to the unprocessed sink
//! 3. Buffer typed records, flushing when a buffer reaches the batch size
//! 4. When no data is available, flush and sleep one poll interval
//!
//! Recoverable I/O errors are logged and retried after one poll interval;
//! the task only returns on the stop signal, after a final flush.

use super::classifier::{process_line, ClassifiedRecord, Classification};
use super::tail_reader::{LineSource, TailReader};
use super::tcp_reader::TcpLineReader;
use super::unprocessed::UnprocessedSink;
use crate::pipeline::config::{PipelineConfig, SourceDefinition, SourceKind};
use crate::pipeline::db::{IngestBatch, IngestSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Pause between a failed flush and the next attempt
    pub db_write_suspend: Duration,
}

impl WatcherSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            db_write_suspend: config.db_write_suspend,
        }
    }
}

/// Per-source counters, logged at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherStats {
    pub lines_read: u64,
    pub lines_ignored: u64,
    pub lines_rejected: u64,
    pub records_flushed: u64,
    pub flush_failures: u64,
    /// Records still buffered when the final flush failed
    pub records_dropped: u64,
}

/// Line source for a configured definition
pub fn build_line_source(definition: &SourceDefinition) -> Box<dyn LineSource> {
    match &definition.kind {
        SourceKind::File(path) => Box::new(TailReader::new(path.clone())),
        SourceKind::Tcp { host, port } => Box::new(TcpLineReader::new(host.clone(), *port)),
    }
}

pub struct SourceWatcher {
    name: String,
    source: Box<dyn LineSource>,
    sink: Arc<dyn IngestSink>,
    unprocessed: UnprocessedSink,
    settings: WatcherSettings,
    batch: IngestBatch,
    stats: WatcherStats,
    suspended_until: Option<Instant>,
}

impl SourceWatcher {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn LineSource>,
        sink: Arc<dyn IngestSink>,
        unprocessed: UnprocessedSink,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            sink,
            unprocessed,
            settings,
            batch: IngestBatch::default(),
            stats: WatcherStats::default(),
            suspended_until: None,
        }
    }

    /// Sleep for `duration` unless cancelled first; true when cancelled
    async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Run until `cancel` fires, then flush and return the counters
    pub async fn run(mut self, cancel: CancellationToken) -> WatcherStats {
        log::info!("👀 Watching {} ({})", self.name, self.source.describe());

        let mut opened = false;

        while !cancel.is_cancelled() {
            if !opened {
                match self.source.open().await {
                    Ok(()) => opened = true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        log::error!("❌ Log file not found for {}: {}", self.name, self.source.describe());
                        if Self::pause(&cancel, self.settings.poll_interval).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        log::error!("❌ Cannot open {} ({}): {}", self.name, self.source.describe(), e);
                        if Self::pause(&cancel, self.settings.poll_interval).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.source.next_line().await {
                Ok(Some(line)) => {
                    self.handle_line(&line).await;
                    if self.batch.largest_buffer() >= self.settings.batch_size {
                        self.flush(false).await;
                    }
                }
                Ok(None) => {
                    self.flush(false).await;
                    if Self::pause(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    log::error!(
                        "❌ Error while tailing {} ({}): {}",
                        self.name,
                        self.source.describe(),
                        e
                    );
                    opened = false;
                    if Self::pause(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                }
            }
        }

        self.flush(true).await;
        if !self.batch.is_empty() {
            self.stats.records_dropped = self.batch.len() as u64;
            log::error!(
                "❌ {} dropped {} buffered records at shutdown",
                self.name,
                self.batch.len()
            );
        }

        log::info!(
            "🛑 Watcher {} stopped: {} lines read, {} records flushed, {} rejected, {} ignored",
            self.name,
            self.stats.lines_read,
            self.stats.records_flushed,
            self.stats.lines_rejected,
            self.stats.lines_ignored
        );
        self.stats
    }

    async fn handle_line(&mut self, line: &str) {
        self.stats.lines_read += 1;

        match process_line(&self.name, line) {
            Classification::Ignored => self.stats.lines_ignored += 1,
            Classification::Accepted(records) => {
                for record in records {
                    match record {
                        ClassifiedRecord::Log(log) => self.batch.logs.push(log),
                        ClassifiedRecord::Transfer(transfer) => self.batch.transfers.push(transfer),
                        ClassifiedRecord::Reputation(rep) => self.batch.reputations.push(rep),
                    }
                }
            }
            Classification::Rejected(reason) => {
                self.stats.lines_rejected += 1;
                log::debug!("Unprocessed line from {} ({})", self.name, reason);
                if let Err(e) = self.unprocessed.record(&self.name, line).await {
                    log::warn!(
                        "⚠️  Cannot write unprocessed line for {} to {}: {}",
                        self.name,
                        self.unprocessed.path_for(&self.name).display(),
                        e
                    );
                }
            }
        }
    }

    /// Write buffered records; `force` ignores an active suspension
    async fn flush(&mut self, force: bool) {
        if self.batch.is_empty() {
            return;
        }
        if !force && self.suspended_until.is_some_and(|until| Instant::now() < until) {
            return;
        }

        match self.sink.write_batch(&self.batch).await {
            Ok(()) => {
                log::debug!(
                    "✅ {} flushed {} records to {}",
                    self.name,
                    self.batch.len(),
                    self.sink.backend_type()
                );
                self.stats.records_flushed += self.batch.len() as u64;
                self.batch.clear();
                self.suspended_until = None;
            }
            Err(e) => {
                self.stats.flush_failures += 1;
                self.suspended_until = Some(Instant::now() + self.settings.db_write_suspend);
                log::error!(
                    "❌ {} failed to flush {} records, retrying in {:?}: {}",
                    self.name,
                    self.batch.len(),
                    self.settings.db_write_suspend,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::StoreError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted line source: yields queued results, then idles
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<std::io::Result<Option<String>>>>>,
        opens: Arc<AtomicUsize>,
        fail_first_open: bool,
    }

    #[async_trait]
    impl LineSource for ScriptedSource {
        async fn open(&mut self) -> std::io::Result<()> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_open && n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
            }
            Ok(())
        }

        async fn next_line(&mut self) -> std::io::Result<Option<String>> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Sink that records batches and can be told to fail
    #[derive(Default)]
    struct MemorySink {
        batches: Mutex<Vec<IngestBatch>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl IngestSink for MemorySink {
        async fn write_batch(&self, batch: &IngestBatch) -> Result<(), StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Poisoned);
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "memory"
        }
    }

    fn transfer_line(piece: &str) -> String {
        format!(
            "2025-10-25T12:00:00Z\tINFO\tpiecestore\tdownloaded\t{{\"Piece ID\":\"{}\",\"Satellite ID\":\"s1\",\"Size\":10}}",
            piece
        )
    }

    fn settings(batch_size: usize, suspend: Duration) -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(5),
            batch_size,
            db_write_suspend: suspend,
        }
    }

    fn scripted(lines: Vec<std::io::Result<Option<String>>>, fail_first_open: bool) -> (Box<dyn LineSource>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            script: Arc::new(Mutex::new(lines.into_iter().collect())),
            opens: opens.clone(),
            fail_first_open,
        };
        (Box::new(source), opens)
    }

    async fn run_for(watcher: SourceWatcher, duration: Duration) -> WatcherStats {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));
        tokio::time::sleep(duration).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lines_are_batched_and_routed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (source, _) = scripted(
            vec![
                Ok(Some(transfer_line("p1"))),
                Ok(Some(transfer_line("p2"))),
                Ok(Some("garbage".to_string())),
                Ok(Some("2025-10-25T12:00:00Z\tDEBUG\tx\ty\t{}".to_string())),
                Ok(Some("2025-10-25T12:00:00Z\tINFO\tcollector\tstatus\t{}".to_string())),
            ],
            false,
        );
        let watcher = SourceWatcher::new(
            "node-a",
            source,
            sink.clone(),
            UnprocessedSink::new(dir.path()),
            settings(2, Duration::from_secs(60)),
        );

        let stats = run_for(watcher, Duration::from_millis(100)).await;

        assert_eq!(stats.lines_read, 5);
        assert_eq!(stats.lines_ignored, 1);
        assert_eq!(stats.lines_rejected, 1);
        assert_eq!(stats.records_flushed, 3);

        let batches = sink.batches.lock().unwrap();
        // batch size reached after two transfers, then the idle flush
        assert_eq!(batches[0].transfers.len(), 2);
        assert_eq!(batches.iter().map(|b| b.logs.len()).sum::<usize>(), 1);

        let rejects = std::fs::read_to_string(dir.path().join("unprocessed-node-a.log")).unwrap();
        assert_eq!(rejects, "garbage\n");
    }

    #[tokio::test]
    async fn test_missing_source_retried_until_available() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (source, opens) = scripted(vec![Ok(Some(transfer_line("p1")))], true);
        let watcher = SourceWatcher::new(
            "node",
            source,
            sink.clone(),
            UnprocessedSink::new(dir.path()),
            settings(10, Duration::from_secs(60)),
        );

        let stats = run_for(watcher, Duration::from_millis(100)).await;

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(stats.records_flushed, 1);
    }

    #[tokio::test]
    async fn test_read_error_reopens_source() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (source, opens) = scripted(
            vec![
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
                Ok(Some(transfer_line("p1"))),
            ],
            false,
        );
        let watcher = SourceWatcher::new(
            "node",
            source,
            sink.clone(),
            UnprocessedSink::new(dir.path()),
            settings(10, Duration::from_secs(60)),
        );

        let stats = run_for(watcher, Duration::from_millis(100)).await;

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(stats.records_flushed, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer_and_suspends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let (source, _) = scripted(vec![Ok(Some(transfer_line("p1")))], false);
        let watcher = SourceWatcher::new(
            "node",
            source,
            sink.clone(),
            UnprocessedSink::new(dir.path()),
            // suspension outlasts the run, so only the shutdown flush retries
            settings(10, Duration::from_secs(60)),
        );

        let stats = run_for(watcher, Duration::from_millis(100)).await;

        assert_eq!(stats.flush_failures, 1);
        assert_eq!(stats.records_flushed, 1);
        assert_eq!(stats.records_dropped, 0);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_dropped_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        sink.failures_left.store(usize::MAX, Ordering::SeqCst);
        let (source, _) = scripted(vec![Ok(Some(transfer_line("p1")))], false);
        let watcher = SourceWatcher::new(
            "node",
            source,
            sink.clone(),
            UnprocessedSink::new(dir.path()),
            settings(10, Duration::from_millis(1)),
        );

        let stats = run_for(watcher, Duration::from_millis(50)).await;

        assert!(stats.flush_failures >= 2);
        assert_eq!(stats.records_flushed, 0);
        assert_eq!(stats.records_dropped, 1);
    }
}
