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

//! Time-bounded duplicate suppression for donation ids.
//!
//! Expired entries are purged lazily on every [DedupeFilter::accept] call,
//! there is no background sweeper. Memory is therefore bounded only by the
//! number of distinct ids seen within one TTL.

use crate::DonationId;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DedupeFilter {
    /// id -> instant at which the id may be accepted again
    seen: FxHashMap<DonationId, Instant>,
    ttl: Duration,
}

impl DedupeFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: FxHashMap::default(),
            ttl,
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of ids currently remembered, including not yet purged ones
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Returns `true` and remembers `id` until `now + ttl` when the id is not
    /// live, `false` without touching the entry otherwise.
    pub fn accept(&mut self, id: DonationId, now: Instant) -> bool {
        self.purge(now);
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, now + self.ttl);
        true
    }

    fn purge(&mut self, now: Instant) {
        self.seen.retain(|_, expires_at| *expires_at > now);
    }
}
