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

//! Coalesces a high-frequency stream of donation events into aggregate
//! batches, so that a slow, rate-limited sink sees at most one update per
//! window.
//!
//! The main components are:
//! - [dedupe::DedupeFilter]: rejects event ids seen within a trailing TTL
//! - [accumulator::Accumulator]: running count/sum of the open batch
//! - [window::WindowScheduler]: sliding quiet-period deadline capped by a hard
//!   ceiling measured from the first event of the batch
//! - [waiters::WaiterRegistry]: callers waiting for the batch they joined
//! - [actor::BatcherHandle]: the single-flight flush coordinator, running as
//!   an actor that owns all the above

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::{future::Future, sync::Arc};

pub mod accumulator;
pub mod actor;
pub mod config;
pub mod dedupe;
pub mod waiters;
pub mod window;

#[cfg(test)]
mod tests;

pub use actor::{BatcherHandle, BatcherStats, BatcherStatus};
pub use config::BatcherConfig;

pub type DonationId = u64;

/// A single confirmed donation as handed over by the ingestion front end
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DonationEvent {
    pub id: DonationId,
    pub amount: f64,
    pub observed_at: DateTime<Utc>,
}

impl DonationEvent {
    pub fn new(id: DonationId, amount: f64) -> Self {
        Self {
            id,
            amount,
            observed_at: Utc::now(),
        }
    }

    /// Only finite, strictly positive amounts are accumulated
    pub fn has_valid_amount(&self) -> bool {
        self.amount.is_finite() && self.amount > 0.0
    }
}

/// Immutable aggregate of one flushed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchSnapshot {
    pub count: u64,
    pub sum: f64,
}

impl BatchSnapshot {
    pub const fn new(count: u64, sum: f64) -> Self {
        Self { count, sum }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BatcherError {
    #[error("failed to send command to the batcher")]
    SendError,

    #[error("batcher dropped the reply channel")]
    ReceiveError,

    #[error("batch flush failed: {0:#}")]
    Flush(Arc<anyhow::Error>),

    #[error("waiter cancelled before its batch was flushed")]
    Cancelled,
}

/// The downstream consumer of flushed batches.
///
/// A failing flush must be reported through the returned error, the batch is
/// not retried.
pub trait FlushSink: Send + Sync + 'static {
    fn flush(&self, snapshot: BatchSnapshot) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> FlushSink for F
where
    F: Fn(BatchSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn flush(&self, snapshot: BatchSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(snapshot))
    }
}
