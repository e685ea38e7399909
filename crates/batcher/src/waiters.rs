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

use crate::{BatchSnapshot, BatcherError};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

pub type WaiterId = u64;

pub type WaiterResult = Result<BatchSnapshot, BatcherError>;

/// Result slot of a caller waiting for the batch it contributed to
#[derive(Debug)]
pub struct PendingWaiter {
    id: WaiterId,
    tx: oneshot::Sender<WaiterResult>,
}

impl PendingWaiter {
    pub const fn id(&self) -> WaiterId {
        self.id
    }

    /// Caller dropped its receiving end, nobody is listening anymore
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns `false` if the caller was already gone
    pub fn settle(self, snapshot: BatchSnapshot) -> bool {
        self.tx.send(Ok(snapshot)).is_ok()
    }

    pub fn fail(self, err: BatcherError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }
}

/// Waiters of the currently open batch.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    next_id: WaiterId,
    waiters: FxHashMap<WaiterId, PendingWaiter>,
}

impl WaiterRegistry {
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Joins the open batch, the returned receiver resolves once that batch
    /// settles, fails, or the waiter is cancelled
    pub fn register(&mut self) -> (WaiterId, oneshot::Receiver<WaiterResult>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        // Callers that went away without cancelling leave closed slots behind
        self.waiters.retain(|_, waiter| !waiter.is_abandoned());
        self.waiters.insert(id, PendingWaiter { id, tx });
        (id, rx)
    }

    /// Fails the waiter with [BatcherError::Cancelled] if it still belongs to
    /// the open batch. Returns `false` when it was already drained by a flush.
    pub fn cancel(&mut self, id: WaiterId) -> bool {
        match self.waiters.remove(&id) {
            Some(waiter) => {
                waiter.fail(BatcherError::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn drain_all(&mut self) -> Vec<PendingWaiter> {
        self.waiters.drain().map(|(_, waiter)| waiter).collect()
    }
}
