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

//! Flush deadline computation for the open batch.
//!
//! Two deadlines compete:
//! - the sliding window deadline `last_event_at + batch_window`, pushed
//!   forward by every new event
//! - the ceiling `first_event_at + max_batch_wait`, fixed once the batch
//!   received its first event
//!
//! The earlier of the two wins, so a steady trickle of events still flushes
//! within `max_batch_wait` of the first one. A single [Sleep] is kept armed
//! for that deadline.

use crate::{accumulator::Accumulator, config::BatcherConfig};
use std::{pin::Pin, time::Duration};
use tokio::time::{Instant, Sleep};

#[derive(Debug)]
pub struct WindowScheduler {
    batch_window: Duration,
    max_batch_wait: Duration,
    timer: Pin<Box<Sleep>>,
    armed: bool,
}

impl WindowScheduler {
    /// Must be called within a tokio runtime
    pub fn new(config: &BatcherConfig) -> Self {
        Self {
            batch_window: config.effective_batch_window(),
            max_batch_wait: config.effective_max_batch_wait(),
            timer: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// `None` when the batch is empty
    pub fn due_at(
        batch_window: Duration,
        max_batch_wait: Duration,
        acc: &Accumulator,
    ) -> Option<Instant> {
        let window_deadline = acc.last_event_at()? + batch_window;
        let max_deadline = acc.first_event_at()? + max_batch_wait;
        Some(window_deadline.min(max_deadline))
    }

    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Drops any outstanding deadline and arms the timer for the one derived
    /// from `acc`. A deadline already in the past fires on the next poll.
    pub fn rearm(&mut self, acc: &Accumulator) -> Option<Instant> {
        match Self::due_at(self.batch_window, self.max_batch_wait, acc) {
            Some(due_at) => {
                self.timer.as_mut().reset(due_at);
                self.armed = true;
                Some(due_at)
            }
            None => {
                self.armed = false;
                None
            }
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Resolves once the armed deadline is reached, never if disarmed.
    ///
    /// Cancel safe, dropping the future leaves the timer armed.
    pub async fn expired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.timer.as_mut().await;
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);
    const MAX_WAIT: Duration = Duration::from_millis(1000);

    #[test]
    fn test_due_at_empty_batch() {
        let acc = Accumulator::default();
        assert_eq!(WindowScheduler::due_at(WINDOW, MAX_WAIT, &acc), None);
    }

    #[test]
    fn test_due_at_lone_event_uses_window() {
        let start = Instant::now();
        let mut acc = Accumulator::default();
        acc.ingest(1.0, start);
        assert_eq!(
            WindowScheduler::due_at(WINDOW, MAX_WAIT, &acc),
            Some(start + WINDOW)
        );
    }

    #[test]
    fn test_due_at_sliding_window_moves_forward() {
        let start = Instant::now();
        let mut acc = Accumulator::default();
        let mut previous = None;
        for offset in [0, 200, 400, 600] {
            acc.ingest(1.0, start + Duration::from_millis(offset));
            let due = WindowScheduler::due_at(WINDOW, MAX_WAIT, &acc);
            assert!(due > previous);
            previous = due;
        }
        assert_eq!(previous, Some(start + Duration::from_millis(850)));
    }

    #[test]
    fn test_due_at_capped_by_ceiling() {
        let start = Instant::now();
        let mut acc = Accumulator::default();
        for offset in [0, 200, 400, 600, 800, 900] {
            acc.ingest(1.0, start + Duration::from_millis(offset));
        }
        assert_eq!(
            WindowScheduler::due_at(WINDOW, MAX_WAIT, &acc),
            Some(start + MAX_WAIT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_and_expire() {
        let config = BatcherConfig::new(WINDOW, MAX_WAIT, Duration::from_secs(60));
        let mut scheduler = WindowScheduler::new(&config);
        assert!(!scheduler.is_armed());

        let start = Instant::now();
        let mut acc = Accumulator::default();
        acc.ingest(1.0, start);
        assert_eq!(scheduler.rearm(&acc), Some(start + WINDOW));
        assert!(scheduler.is_armed());

        scheduler.expired().await;
        assert_eq!(Instant::now(), start + WINDOW);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_never_expires() {
        let config = BatcherConfig::new(WINDOW, MAX_WAIT, Duration::from_secs(60));
        let mut scheduler = WindowScheduler::new(&config);
        let mut acc = Accumulator::default();
        acc.ingest(1.0, Instant::now());
        scheduler.rearm(&acc);
        scheduler.disarm();

        let result = tokio::time::timeout(Duration::from_secs(10), scheduler.expired()).await;
        assert!(result.is_err());
    }
}
