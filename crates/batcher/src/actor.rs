// Copyright (C) 2025-present The Tallyboard Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Batcher Actor Module
//!
//! The batcher runs as a single actor task that exclusively owns the
//! [DedupeFilter], the [Accumulator], the [WindowScheduler] and the
//! [WaiterRegistry]. All bookkeeping happens inside one `select!` loop, so
//! no two ingestions or an ingestion and a flush reset ever interleave.
//!
//! ## Flush coordination
//!
//! The actor is either **idle** or **flushing**, the latter while a spawned
//! task is running the [FlushSink] for the previous batch:
//!
//! 1. When the window deadline expires while idle and the open batch is not
//!    empty, the accumulator is reset into a [BatchSnapshot], the waiters of
//!    that batch are drained, and the sink is spawned.
//! 2. A deadline expiring while flushing is ignored. Once the in-flight flush
//!    completes, a batch accumulated in the meantime gets its deadline
//!    re-derived from its own first/last event.
//! 3. On success the drained waiters receive the snapshot, on failure they
//!    all receive the same [BatcherError::Flush]. The batch is never retried.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tallyboard_batcher::{BatchSnapshot, BatcherConfig, BatcherHandle, DonationEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let meter = opentelemetry::global::meter("tallyboard");
//!     let (join_handle, handle) = BatcherHandle::new(
//!         BatcherConfig::default(),
//!         |snapshot: BatchSnapshot| async move {
//!             println!("{} donations, {} total", snapshot.count, snapshot.sum);
//!             Ok::<_, anyhow::Error>(())
//!         },
//!         either::Either::Left(meter),
//!     );
//!     let accepted = handle.submit(DonationEvent::new(1, 100.0)).await.unwrap();
//!     assert!(accepted);
//!     handle.shutdown().await.unwrap();
//!     join_handle.await.unwrap().unwrap();
//! }
//! ```

use crate::{
    accumulator::Accumulator,
    config::BatcherConfig,
    dedupe::DedupeFilter,
    waiters::{PendingWaiter, WaiterId, WaiterRegistry, WaiterResult},
    window::WindowScheduler,
    BatchSnapshot, BatcherError, DonationEvent, FlushSink,
};
use either::Either;
use futures::future::OptionFuture;
use opentelemetry::metrics::{Counter, Meter};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct BatcherStats {
    pub received_events: Counter<u64>,
    pub accepted_events: Counter<u64>,
    pub duplicate_events: Counter<u64>,
    pub invalid_events: Counter<u64>,
    pub flushes: Counter<u64>,
    pub flush_errors: Counter<u64>,
    pub flushed_events: Counter<u64>,
    pub cancelled_waiters: Counter<u64>,
}

impl BatcherStats {
    pub fn new(meter: Meter) -> Self {
        let received_events = meter
            .u64_counter("tallyboard.batcher.received.events")
            .with_description("Number of donation events submitted to the batcher")
            .build();
        let accepted_events = meter
            .u64_counter("tallyboard.batcher.accepted.events")
            .with_description("Number of donation events added to a batch")
            .build();
        let duplicate_events = meter
            .u64_counter("tallyboard.batcher.duplicate.events")
            .with_description("Number of donation events rejected as duplicates")
            .build();
        let invalid_events = meter
            .u64_counter("tallyboard.batcher.invalid.events")
            .with_description("Number of donation events dropped for a non-positive amount")
            .build();
        let flushes = meter
            .u64_counter("tallyboard.batcher.flushes")
            .with_description("Number of batches handed to the flush sink")
            .build();
        let flush_errors = meter
            .u64_counter("tallyboard.batcher.flush.errors")
            .with_description("Number of batches the flush sink failed to deliver")
            .build();
        let flushed_events = meter
            .u64_counter("tallyboard.batcher.flushed.events")
            .with_description("Number of donation events delivered within successful flushes")
            .build();
        let cancelled_waiters = meter
            .u64_counter("tallyboard.batcher.cancelled.waiters")
            .with_description("Number of waiters cancelled before their batch was flushed")
            .build();
        Self {
            received_events,
            accepted_events,
            duplicate_events,
            invalid_events,
            flushes,
            flush_errors,
            flushed_events,
            cancelled_waiters,
        }
    }
}

/// Point in time view of the batcher, used for health probes
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatcherStatus {
    pub pending_count: u64,
    pub pending_sum: f64,
    pub pending_waiters: usize,
    pub flushing: bool,
    pub tracked_ids: usize,
    pub flushed_batches: u64,
}

type WaitSlot = Option<(WaiterId, oneshot::Receiver<WaiterResult>)>;

#[derive(Debug, strum_macros::Display)]
pub(crate) enum BatcherCommand {
    Submit(DonationEvent, oneshot::Sender<bool>),
    /// Submit and, if accepted, join the open batch as a waiter
    SubmitAndWait(DonationEvent, oneshot::Sender<WaitSlot>),
    Cancel(WaiterId),
    Status(oneshot::Sender<BatcherStatus>),
    /// Flush what is pending and terminate
    Shutdown(oneshot::Sender<()>),
}

struct InFlightFlush {
    batch_id: u64,
    snapshot: BatchSnapshot,
    waiters: Vec<PendingWaiter>,
    join_handle: JoinHandle<anyhow::Result<()>>,
}

struct BatcherActor {
    cmd_rx: mpsc::Receiver<BatcherCommand>,
    dedupe: DedupeFilter,
    accumulator: Accumulator,
    scheduler: WindowScheduler,
    waiters: WaiterRegistry,
    sink: Arc<dyn FlushSink>,
    in_flight: Option<InFlightFlush>,
    stats: BatcherStats,
    flushed_batches: u64,
}

impl BatcherActor {
    fn new(
        cmd_rx: mpsc::Receiver<BatcherCommand>,
        config: &BatcherConfig,
        sink: Arc<dyn FlushSink>,
        stats: BatcherStats,
    ) -> Self {
        Self {
            cmd_rx,
            dedupe: DedupeFilter::new(config.dedupe_ttl),
            accumulator: Accumulator::default(),
            scheduler: WindowScheduler::new(config),
            waiters: WaiterRegistry::default(),
            sink,
            in_flight: None,
            stats,
            flushed_batches: 0,
        }
    }

    async fn run(mut self) -> anyhow::Result<String> {
        loop {
            tokio::select! {
                biased;
                Some(outcome) = OptionFuture::from(self.in_flight.as_mut().map(|flush| &mut flush.join_handle)) => {
                    self.complete_flush(outcome);
                }
                _ = self.scheduler.expired() => {
                    self.on_deadline();
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Some(tx) = self.handle_cmd(cmd) {
                                info!("[Batcher] Received shutdown command, flushing pending batch");
                                self.drain().await;
                                let _ = tx.send(());
                                return Ok("Batcher terminated successfully".to_string());
                            }
                        }
                        None => {
                            info!("[Batcher] Command channel closed, flushing pending batch");
                            self.drain().await;
                            return Ok("Batcher terminated successfully".to_string());
                        }
                    }
                }
            }
        }
    }

    /// Returns the reply channel when the command asks the actor to stop
    fn handle_cmd(&mut self, cmd: BatcherCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            BatcherCommand::Submit(event, tx) => {
                let accepted = self.ingest(&event);
                let _ = tx.send(accepted);
            }
            BatcherCommand::SubmitAndWait(event, tx) => {
                let slot = self.ingest(&event).then(|| self.waiters.register());
                let _ = tx.send(slot);
            }
            BatcherCommand::Cancel(waiter_id) => {
                if self.waiters.cancel(waiter_id) {
                    debug!("[Batcher] Waiter {waiter_id} cancelled before flush");
                    self.stats.cancelled_waiters.add(1, &[]);
                }
            }
            BatcherCommand::Status(tx) => {
                let _ = tx.send(self.status());
            }
            BatcherCommand::Shutdown(tx) => return Some(tx),
        }
        None
    }

    fn ingest(&mut self, event: &DonationEvent) -> bool {
        let now = Instant::now();
        self.stats.received_events.add(1, &[]);
        if !self.dedupe.accept(event.id, now) {
            debug!("[Batcher] Dropping duplicate donation {}", event.id);
            self.stats.duplicate_events.add(1, &[]);
            return false;
        }
        if !event.has_valid_amount() {
            warn!(
                "[Batcher] Dropping donation {} with invalid amount {}",
                event.id, event.amount
            );
            self.stats.invalid_events.add(1, &[]);
            return false;
        }
        self.accumulator.ingest(event.amount, now);
        self.scheduler.rearm(&self.accumulator);
        self.stats.accepted_events.add(1, &[]);
        debug!(
            "[Batcher] Accepted donation {} ({}), open batch holds {} events",
            event.id,
            event.amount,
            self.accumulator.count()
        );
        true
    }

    fn on_deadline(&mut self) {
        if let Some(flush) = &self.in_flight {
            debug!(
                "[Batcher] Deadline reached while batch {} is still flushing, deferring",
                flush.batch_id
            );
            return;
        }
        if self.accumulator.is_empty() {
            return;
        }
        self.start_flush();
    }

    fn start_flush(&mut self) {
        let snapshot = self.accumulator.reset();
        self.scheduler.disarm();
        let waiters = self.waiters.drain_all();
        self.flushed_batches += 1;
        let batch_id = self.flushed_batches;
        info!(
            "[Batcher] Flushing batch {batch_id}: {} events, sum {}, {} waiters",
            snapshot.count,
            snapshot.sum,
            waiters.len()
        );
        self.stats.flushes.add(1, &[]);
        let span = tracing::info_span!("flush", batch_id, count = snapshot.count);
        let join_handle = tokio::spawn(self.sink.flush(snapshot).instrument(span));
        self.in_flight = Some(InFlightFlush {
            batch_id,
            snapshot,
            waiters,
            join_handle,
        });
    }

    fn complete_flush(&mut self, outcome: Result<anyhow::Result<()>, JoinError>) {
        let Some(flush) = self.in_flight.take() else {
            return;
        };
        let result = outcome.unwrap_or_else(|err| Err(anyhow::anyhow!("flush task failed: {err}")));
        match result {
            Ok(()) => {
                debug!(
                    "[Batcher] Batch {} flushed, notifying {} waiters",
                    flush.batch_id,
                    flush.waiters.len()
                );
                self.stats.flushed_events.add(flush.snapshot.count, &[]);
                for waiter in flush.waiters {
                    waiter.settle(flush.snapshot);
                }
            }
            Err(err) => {
                error!(
                    "[Batcher] Flush of batch {} failed, dropping {} events: {err:#}",
                    flush.batch_id, flush.snapshot.count
                );
                self.stats.flush_errors.add(1, &[]);
                let err = BatcherError::Flush(Arc::new(err));
                for waiter in flush.waiters {
                    waiter.fail(err.clone());
                }
            }
        }
        // Back to idle, a batch opened during the flush gets its own deadline
        if !self.accumulator.is_empty() {
            self.scheduler.rearm(&self.accumulator);
        }
    }

    /// Waits for the in-flight flush and flushes the open batch one last time
    async fn drain(&mut self) {
        if let Some(flush) = self.in_flight.as_mut() {
            let outcome = (&mut flush.join_handle).await;
            self.complete_flush(outcome);
        }
        if !self.accumulator.is_empty() {
            self.start_flush();
            if let Some(flush) = self.in_flight.as_mut() {
                let outcome = (&mut flush.join_handle).await;
                self.complete_flush(outcome);
            }
        }
        self.scheduler.disarm();
    }

    fn status(&self) -> BatcherStatus {
        BatcherStatus {
            pending_count: self.accumulator.count(),
            pending_sum: self.accumulator.sum(),
            pending_waiters: self.waiters.len(),
            flushing: self.in_flight.is_some(),
            tracked_ids: self.dedupe.len(),
            flushed_batches: self.flushed_batches,
        }
    }
}

/// Cloneable handle to the single batcher instance of the process
#[derive(Debug, Clone)]
pub struct BatcherHandle {
    cmd_tx: mpsc::Sender<BatcherCommand>,
}

impl BatcherHandle {
    /// Spawns the batcher actor, must be called within a tokio runtime
    pub fn new<S: FlushSink>(
        config: BatcherConfig,
        sink: S,
        stats: Either<Meter, BatcherStats>,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.cmd_buffer_size.max(1));
        let stats = match stats {
            Either::Left(meter) => BatcherStats::new(meter),
            Either::Right(stats) => stats,
        };
        info!(
            "[Batcher] Starting with window={:?} max_wait={:?} dedupe_ttl={:?}",
            config.effective_batch_window(),
            config.effective_max_batch_wait(),
            config.dedupe_ttl
        );
        let actor = BatcherActor::new(cmd_rx, &config, Arc::new(sink), stats);
        let join_handle = tokio::spawn(actor.run().instrument(tracing::info_span!("batcher")));
        (join_handle, Self { cmd_tx })
    }

    /// Returns `false` when the event was dropped as a duplicate or for an
    /// invalid amount
    pub async fn submit(&self, event: DonationEvent) -> Result<bool, BatcherError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Submit(event, tx))
            .await
            .map_err(|_| BatcherError::SendError)?;
        rx.await.map_err(|_| BatcherError::ReceiveError)
    }

    /// Submits the event and waits until the batch it joined is flushed.
    ///
    /// Returns `Ok(None)` if the event was not accepted. Cancelling `cancel`
    /// before the batch is flushed fails with [BatcherError::Cancelled]; once
    /// the batch is already being flushed its outcome is returned instead.
    pub async fn submit_and_await(
        &self,
        event: DonationEvent,
        cancel: CancellationToken,
    ) -> Result<Option<BatchSnapshot>, BatcherError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::SubmitAndWait(event, tx))
            .await
            .map_err(|_| BatcherError::SendError)?;
        let Some((waiter_id, mut result_rx)) = rx.await.map_err(|_| BatcherError::ReceiveError)?
        else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            result = &mut result_rx => {
                return result.map_err(|_| BatcherError::ReceiveError)?.map(Some);
            }
            _ = cancel.cancelled() => {}
        }
        // The actor fails the waiter with Cancelled, unless it was drained already
        let _ = self.cmd_tx.send(BatcherCommand::Cancel(waiter_id)).await;
        result_rx
            .await
            .map_err(|_| BatcherError::ReceiveError)?
            .map(Some)
    }

    pub async fn status(&self) -> Result<BatcherStatus, BatcherError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Status(tx))
            .await
            .map_err(|_| BatcherError::SendError)?;
        rx.await.map_err(|_| BatcherError::ReceiveError)
    }

    /// Flushes the open batch, waits for it to settle and stops the actor
    pub async fn shutdown(&self) -> Result<(), BatcherError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BatcherCommand::Shutdown(tx))
            .await
            .map_err(|_| BatcherError::SendError)?;
        rx.await.map_err(|_| BatcherError::ReceiveError)
    }
}
