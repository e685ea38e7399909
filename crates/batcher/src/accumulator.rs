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

use crate::BatchSnapshot;
use tokio::time::Instant;

/// Running aggregate of the currently open batch.
///
/// `count == 0` if and only if both timestamps are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    count: u64,
    sum: f64,
    first_event_at: Option<Instant>,
    last_event_at: Option<Instant>,
}

impl Accumulator {
    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn sum(&self) -> f64 {
        self.sum
    }

    pub const fn first_event_at(&self) -> Option<Instant> {
        self.first_event_at
    }

    pub const fn last_event_at(&self) -> Option<Instant> {
        self.last_event_at
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds one event to the open batch. The caller is responsible for
    /// dropping non-finite and non-positive amounts beforehand.
    pub fn ingest(&mut self, amount: f64, now: Instant) {
        debug_assert!(amount.is_finite() && amount > 0.0);
        self.count += 1;
        self.sum += amount;
        self.first_event_at.get_or_insert(now);
        self.last_event_at = Some(now);
    }

    /// Captures the aggregate and returns the accumulator to its empty state
    pub fn reset(&mut self) -> BatchSnapshot {
        let taken = std::mem::take(self);
        BatchSnapshot::new(taken.count, taken.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ingest_tracks_first_and_last() {
        let start = Instant::now();
        let mut acc = Accumulator::default();
        assert!(acc.is_empty());
        assert_eq!(acc.first_event_at(), None);
        assert_eq!(acc.last_event_at(), None);

        acc.ingest(100.0, start);
        acc.ingest(50.0, start + Duration::from_millis(200));
        acc.ingest(25.5, start + Duration::from_millis(400));

        assert_eq!(acc.count(), 3);
        assert_eq!(acc.sum(), 175.5);
        assert_eq!(acc.first_event_at(), Some(start));
        assert_eq!(
            acc.last_event_at(),
            Some(start + Duration::from_millis(400))
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let start = Instant::now();
        let mut acc = Accumulator::default();
        acc.ingest(10.0, start);
        acc.ingest(5.0, start);

        let snapshot = acc.reset();
        assert_eq!(snapshot, BatchSnapshot::new(2, 15.0));
        assert_eq!(acc, Accumulator::default());

        // Empty reset yields an empty snapshot
        assert_eq!(acc.reset(), BatchSnapshot::default());
    }

    #[test]
    fn test_sum_is_order_independent() {
        let now = Instant::now();
        let amounts = [1.0, 2.0, 4.0, 8.0, 16.0];
        let mut forward = Accumulator::default();
        let mut backward = Accumulator::default();
        amounts.iter().for_each(|a| forward.ingest(*a, now));
        amounts.iter().rev().for_each(|a| backward.ingest(*a, now));
        assert_eq!(forward.reset(), backward.reset());
    }
}
