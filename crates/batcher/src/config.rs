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

use serde_with::serde_as;
use std::time::Duration;

/// Lower bound applied to the sliding quiet-period
pub const MIN_BATCH_WINDOW: Duration = Duration::from_millis(250);

/// Lower bound applied to the hard ceiling measured from the first event
pub const MIN_MAX_BATCH_WAIT: Duration = Duration::from_millis(1000);

pub(crate) const fn default_batch_window() -> Duration {
    Duration::from_millis(8_000)
}

pub(crate) const fn default_max_batch_wait() -> Duration {
    Duration::from_millis(60_000)
}

pub(crate) const fn default_dedupe_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

pub(crate) const fn default_cmd_buffer_size() -> usize {
    100
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BatcherConfig {
    /// Flush once no new event arrived for this long
    #[serde(default = "default_batch_window")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub batch_window: Duration,

    /// Never hold a batch longer than this after its first event
    #[serde(default = "default_max_batch_wait")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_batch_wait: Duration,

    /// How long a donation id is remembered to reject resubmissions
    #[serde(default = "default_dedupe_ttl")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub dedupe_ttl: Duration,

    #[serde(default = "default_cmd_buffer_size")]
    pub cmd_buffer_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_window: default_batch_window(),
            max_batch_wait: default_max_batch_wait(),
            dedupe_ttl: default_dedupe_ttl(),
            cmd_buffer_size: default_cmd_buffer_size(),
        }
    }
}

impl BatcherConfig {
    pub fn new(batch_window: Duration, max_batch_wait: Duration, dedupe_ttl: Duration) -> Self {
        Self {
            batch_window,
            max_batch_wait,
            dedupe_ttl,
            cmd_buffer_size: default_cmd_buffer_size(),
        }
    }

    /// Configured quiet-period with [MIN_BATCH_WINDOW] applied
    pub fn effective_batch_window(&self) -> Duration {
        self.batch_window.max(MIN_BATCH_WINDOW)
    }

    /// Configured ceiling with [MIN_MAX_BATCH_WAIT] applied
    pub fn effective_max_batch_wait(&self) -> Duration {
        self.max_batch_wait.max(MIN_MAX_BATCH_WAIT)
    }
}
