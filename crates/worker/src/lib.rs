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

use crate::{config::WorkerConfig, ingest::IngestListener, sink::DisplaySink};
use either::Either;
use std::time::Duration;
use tallyboard_batcher::BatcherHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
pub mod ingest;
pub mod push;
pub mod render;
pub mod sink;

const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the ingest listener and the batcher until `shutdown` is cancelled,
/// then flushes whatever is still pending.
pub async fn run_worker(
    config: WorkerConfig,
    meter: opentelemetry::metrics::Meter,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let sink = DisplaySink::new(&config.render, config.push.as_ref())?;
    let (batcher_join_handle, batcher_handle) =
        BatcherHandle::new(config.batcher.clone(), sink, Either::Left(meter));
    let mut listener = IngestListener::bind(&config.ingest, batcher_handle.clone()).await?;

    let listener_result = listener.run(shutdown).await;
    if let Err(err) = &listener_result {
        warn!("Ingest listener terminated with error: {err:#}");
    }

    info!("Draining pending donations");
    batcher_handle.shutdown().await?;
    let msg = batcher_join_handle.await??;
    info!("{msg}");

    // Waiting clients are answered by the drain above, give them time to
    // receive it before the runtime goes away
    let open = listener.open_connections();
    if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, listener.join_connections())
        .await
        .is_err()
    {
        warn!(
            "Closing {open} connections that did not finish within {:?}",
            CONNECTION_DRAIN_TIMEOUT
        );
    }
    listener_result
}
