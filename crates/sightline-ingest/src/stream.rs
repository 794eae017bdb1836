//! The ingestion loop.
//!
//! A single sequential task that owns the partition cursor and is the only
//! writer of the [`IdentityStore`]:
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──▶ Polling ⇄ Backoff
//!        ▲                           │
//!        └──── resolve failed ───────┘
//! ```
//!
//! Fetch failures never advance the cursor and never end the loop; the next
//! poll sleeps for the backoff delay and retries the same position.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sightline_core::RecordDecoder;
use tokio::time::MissedTickBehavior;

use crate::backoff::{Backoff, BackoffConfig};
use crate::source::{Batch, Partition, Position};
use crate::store::{BatchStats, IdentityStore};
use crate::{Error, Result};

/// Configuration for [`IngestionLoop`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub backoff: BackoffConfig,

    /// Time between poll cycles in [`IngestionLoop::run`].
    pub poll_interval: Duration,

    /// Consecutive empty batches that end priming.
    pub prime_empty_batches: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            poll_interval: Duration::from_millis(1000),
            prime_empty_batches: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Uninitialized,
    Initializing,
    Polling,
    Backoff,
}

/// Partition position plus backoff state.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub position: Position,
    pub backoff: Backoff,
}

/// Loop progress as seen from outside the loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub backoff_delay_ms: u64,
    pub batches: u64,
    pub records_received: u64,
    pub records_undecodable: u64,
    pub fetch_errors: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Uninitialized,
            backoff_delay_ms: 0,
            batches: 0,
            records_received: 0,
            records_undecodable: 0,
            fetch_errors: 0,
            last_fetch_at: None,
        }
    }
}

/// Shared handle for stopping the loop and reading its status.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    running: Arc<AtomicBool>,
    status: Arc<RwLock<LoopStatus>>,
}

impl LoopHandle {
    /// Ask the loop to stop after the current poll cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LoopStatus {
        self.status.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut LoopStatus)) {
        f(&mut self.status.write());
    }
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            status: Arc::new(RwLock::new(LoopStatus::default())),
        }
    }
}

/// Result of one fetched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub undecodable: usize,
    pub stats: BatchStats,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Fetched(BatchReport),
    /// The fetch failed; the next poll waits `delay` first.
    Failed { delay: Duration },
}

/// Totals from [`IngestionLoop::prime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrimeReport {
    pub batches: usize,
    pub records: usize,
    pub failures: usize,
}

/// Pulls batches from a partition and feeds them into the store.
pub struct IngestionLoop<P> {
    partition: P,
    store: IdentityStore,
    decoder: RecordDecoder,
    config: IngestConfig,
    state: LoopState,
    cursor: Option<Cursor>,
    handle: LoopHandle,
}

impl<P: Partition> IngestionLoop<P> {
    pub fn new(partition: P, store: IdentityStore, config: IngestConfig) -> Self {
        Self {
            partition,
            store,
            decoder: RecordDecoder::new(),
            config,
            state: LoopState::Uninitialized,
            cursor: None,
            handle: LoopHandle::default(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        self.handle.update(|s| s.state = state);
    }

    /// Resolve the starting position for `at`.
    ///
    /// Failures are returned as [`Error::Initialization`] and leave the loop
    /// uninitialized; they are not retried.
    pub async fn initialize(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.set_state(LoopState::Initializing);
        tracing::info!(partition = self.partition.name(), start = %at, "initializing ingestion loop");

        match self.partition.resolve(at).await {
            Ok(position) => {
                self.cursor = Some(Cursor {
                    position,
                    backoff: Backoff::new(self.config.backoff.clone()),
                });
                self.set_state(LoopState::Polling);
                Ok(())
            }
            Err(e) => {
                self.cursor = None;
                self.set_state(LoopState::Uninitialized);
                tracing::error!(partition = self.partition.name(), error = %e, "initialization failed");
                Err(match e {
                    Error::Initialization(_) => e,
                    other => Error::Initialization(other.to_string()),
                })
            }
        }
    }

    /// Run one poll cycle: wait out any backoff, fetch, and apply.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let cursor = self.cursor.as_mut().ok_or(Error::NotInitialized)?;

        let delay = cursor.backoff.delay();
        if !delay.is_zero() {
            tracing::warn!(delay_ms = delay.as_millis() as u64, "backing off before fetch");
            tokio::time::sleep(delay).await;
        }

        match self.partition.fetch(&cursor.position).await {
            Ok(batch) => {
                let next = batch.next_position.clone();
                let report = self.apply(batch);

                if let Some(cursor) = self.cursor.as_mut() {
                    cursor.position = next;
                    let delay = cursor.backoff.on_success();
                    metrics::gauge!("ingest_backoff_delay_ms").set(delay.as_millis() as f64);
                    self.handle.update(|s| {
                        s.backoff_delay_ms = delay.as_millis() as u64;
                        s.batches += 1;
                        s.records_received += report.received as u64;
                        s.records_undecodable += report.undecodable as u64;
                        s.last_fetch_at = Some(Utc::now());
                    });
                }
                self.set_state(LoopState::Polling);
                Ok(PollOutcome::Fetched(report))
            }
            Err(e) => {
                let delay = cursor.backoff.on_failure();
                tracing::warn!(
                    partition = self.partition.name(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, retrying from the same position"
                );
                metrics::counter!("ingest_fetch_errors_total").increment(1);
                metrics::gauge!("ingest_backoff_delay_ms").set(delay.as_millis() as f64);
                self.handle.update(|s| {
                    s.backoff_delay_ms = delay.as_millis() as u64;
                    s.fetch_errors += 1;
                });
                self.set_state(LoopState::Backoff);
                Ok(PollOutcome::Failed { delay })
            }
        }
    }

    fn apply(&mut self, batch: Batch) -> BatchReport {
        let received = batch.records.len();
        metrics::counter!("ingest_records_total").increment(received as u64);
        metrics::histogram!("ingest_batch_size").record(received as f64);

        let mut undecodable = 0;
        let mut decoded = Vec::with_capacity(received);
        for record in batch.records {
            match self
                .decoder
                .decode(&record.sequence_number, &record.data, record.arrival)
            {
                Ok(raw) => decoded.push(Arc::new(raw)),
                Err(e) => {
                    tracing::warn!(
                        sequence = %record.sequence_number,
                        error = %e,
                        "dropping undecodable record"
                    );
                    metrics::counter!("ingest_records_dropped_total", "reason" => "decode")
                        .increment(1);
                    undecodable += 1;
                }
            }
        }

        let stats = self.store.apply_batch(decoded);
        if received > 0 {
            tracing::debug!(
                received,
                applied = stats.applied,
                duplicates = stats.duplicates,
                dropped = stats.dropped + undecodable,
                "applied batch"
            );
        }

        BatchReport {
            received,
            undecodable,
            stats,
        }
    }

    /// Catch up from the initialized position until the partition has
    /// returned `prime_empty_batches` empty batches in a row.
    pub async fn prime(&mut self) -> Result<PrimeReport> {
        let mut report = PrimeReport::default();
        let mut empty_streak = 0;

        tracing::info!(partition = self.partition.name(), "priming from historical start");

        while empty_streak < self.config.prime_empty_batches && self.is_running() {
            match self.poll_once().await? {
                PollOutcome::Fetched(batch) if batch.received == 0 => {
                    empty_streak += 1;
                    report.batches += 1;
                }
                PollOutcome::Fetched(batch) => {
                    empty_streak = 0;
                    report.batches += 1;
                    report.records += batch.received;
                    if report.batches % 100 == 0 {
                        tracing::info!(
                            batches = report.batches,
                            records = report.records,
                            "priming progress"
                        );
                    }
                }
                PollOutcome::Failed { .. } => report.failures += 1,
            }
        }

        tracing::info!(
            batches = report.batches,
            records = report.records,
            failures = report.failures,
            "priming complete"
        );
        Ok(report)
    }

    /// Poll every `poll_interval` until stopped.
    ///
    /// A stop request takes effect between poll cycles; an in-flight fetch is
    /// never interrupted.
    pub async fn run(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            return Err(Error::NotInitialized);
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            self.poll_once().await?;
        }

        tracing::info!(partition = self.partition.name(), "ingestion loop stopped");
        Ok(())
    }
}
