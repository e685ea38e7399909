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

//! Batcher actor scenarios, run on a paused clock so every deadline is exact

use crate::{
    BatchSnapshot, BatcherConfig, BatcherError, BatcherHandle, DonationEvent, FlushSink,
};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

type FlushRecord = (Instant, BatchSnapshot);

fn test_config(window_ms: u64, max_wait_ms: u64) -> BatcherConfig {
    BatcherConfig::new(
        Duration::from_millis(window_ms),
        Duration::from_millis(max_wait_ms),
        Duration::from_secs(60 * 60),
    )
}

/// Sink that reports every invocation, optionally taking `delay` to complete
/// and failing afterwards
fn recording_sink(
    delay: Duration,
    fail: bool,
) -> (impl FlushSink, mpsc::UnboundedReceiver<FlushRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |snapshot: BatchSnapshot| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((Instant::now(), snapshot));
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if fail {
                anyhow::bail!("device unreachable");
            }
            Ok::<(), anyhow::Error>(())
        }
    };
    (sink, rx)
}

fn start_batcher(
    config: BatcherConfig,
    sink: impl FlushSink,
) -> (JoinHandle<anyhow::Result<String>>, BatcherHandle) {
    let meter = opentelemetry::global::meter("test-meter");
    BatcherHandle::new(config, sink, either::Either::Left(meter))
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn test_duplicate_counted_once() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);
    let start = Instant::now();

    assert!(handle.submit(DonationEvent::new(1, 100.0)).await.unwrap());
    assert!(!handle.submit(DonationEvent::new(1, 100.0)).await.unwrap());
    assert!(handle.submit(DonationEvent::new(2, 50.0)).await.unwrap());

    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(snapshot, BatchSnapshot::new(2, 150.0));
    assert_eq!(at - start, Duration::from_millis(250));
    assert!(logs_contain("Dropping duplicate donation 1"));
}

#[tokio::test(start_paused = true)]
async fn test_sliding_window_extends_deadline() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);
    let start = Instant::now();

    for id in 1..=4 {
        if id > 1 {
            sleep(Duration::from_millis(200)).await;
        }
        assert!(handle.submit(DonationEvent::new(id, 10.0)).await.unwrap());
    }

    // Last event at 600ms, quiet period of 250ms ends before the 1000ms ceiling
    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(850));
    assert_eq!(snapshot, BatchSnapshot::new(4, 40.0));
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_bounds_sustained_activity() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);
    let start = Instant::now();

    // 0, 200, 400, 600, 800ms: the window would slide to 1050ms
    for id in 1..=5 {
        if id > 1 {
            sleep(Duration::from_millis(200)).await;
        }
        assert!(handle.submit(DonationEvent::new(id, 1.0)).await.unwrap());
    }

    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(1000));
    assert_eq!(snapshot.count, 5);
}

#[tokio::test(start_paused = true)]
async fn test_lone_event_flushes_within_max_wait() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(30_000, 1000), sink);
    let start = Instant::now();

    assert!(handle.submit(DonationEvent::new(1, 5.0)).await.unwrap());
    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(1000));
    assert_eq!(snapshot, BatchSnapshot::new(1, 5.0));
}

#[tokio::test(start_paused = true)]
async fn test_config_floors_enforced() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(1, 1), sink);
    let start = Instant::now();

    assert!(handle.submit(DonationEvent::new(1, 5.0)).await.unwrap());
    let (at, _) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_accepted_again_after_ttl() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let config = BatcherConfig::new(
        Duration::from_millis(250),
        Duration::from_millis(1000),
        Duration::from_secs(2),
    );
    let (_join, handle) = start_batcher(config, sink);

    assert!(handle.submit(DonationEvent::new(7, 1.0)).await.unwrap());
    sleep(Duration::from_secs(1)).await;
    // Already flushed, but still remembered
    assert!(!handle.submit(DonationEvent::new(7, 1.0)).await.unwrap());
    sleep(Duration::from_millis(1500)).await;
    assert!(handle.submit(DonationEvent::new(7, 1.0)).await.unwrap());

    assert_eq!(flushes.recv().await.unwrap().1, BatchSnapshot::new(1, 1.0));
    assert_eq!(flushes.recv().await.unwrap().1, BatchSnapshot::new(1, 1.0));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_amounts_dropped() {
    let (sink, _flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);

    for (id, amount) in [
        (1, 0.0),
        (2, -5.0),
        (3, f64::NAN),
        (4, f64::INFINITY),
        (5, f64::NEG_INFINITY),
    ] {
        assert!(!handle.submit(DonationEvent::new(id, amount)).await.unwrap());
    }
    let status = handle.status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.pending_sum, 0.0);

    // The id of a dropped event is still remembered
    assert!(!handle.submit(DonationEvent::new(2, 5.0)).await.unwrap());
    assert_eq!(status.tracked_ids, 5);
}

#[tokio::test(start_paused = true)]
async fn test_sum_independent_of_arrival_order() {
    let amounts = [125.0, 3.0, 42.0, 1000.0, 7.5, 0.25];
    let mut results = vec![];
    for order in [[0, 1, 2, 3, 4, 5], [5, 3, 1, 4, 0, 2]] {
        let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
        let (_join, handle) = start_batcher(test_config(250, 1000), sink);
        for index in order {
            let event = DonationEvent::new(index as u64 + 1, amounts[index]);
            assert!(handle.submit(event).await.unwrap());
        }
        results.push(flushes.recv().await.unwrap().1);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], BatchSnapshot::new(6, amounts.iter().sum()));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_receive_their_batch() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);

    let mut waiters = vec![];
    for id in 1..=2 {
        let handle = handle.clone();
        waiters.push(tokio::spawn(async move {
            handle
                .submit_and_await(DonationEvent::new(id, 10.0), CancellationToken::new())
                .await
        }));
    }
    tokio::task::yield_now().await;
    assert!(handle.submit(DonationEvent::new(3, 30.0)).await.unwrap());

    let expected = BatchSnapshot::new(3, 50.0);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), Some(expected));
    }
    assert_eq!(flushes.recv().await.unwrap().1, expected);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_not_accepted_returns_none() {
    let (sink, _flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);

    assert!(handle.submit(DonationEvent::new(1, 10.0)).await.unwrap());
    let result = handle
        .submit_and_await(DonationEvent::new(1, 10.0), CancellationToken::new())
        .await;
    assert!(matches!(result, Ok(None)));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_fails_immediately() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (_join, handle) = start_batcher(test_config(1000, 1000), sink);
    let start = Instant::now();

    let token = CancellationToken::new();
    let waiter = {
        let handle = handle.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let result = handle
                .submit_and_await(DonationEvent::new(1, 100.0), token)
                .await;
            (Instant::now(), result)
        })
    };

    sleep(Duration::from_millis(50)).await;
    token.cancel();
    let (at, result) = waiter.await.unwrap();
    assert_eq!(at - start, Duration::from_millis(50));
    assert!(matches!(result, Err(BatcherError::Cancelled)));

    // The contribution itself is still flushed with its batch
    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(1000));
    assert_eq!(snapshot, BatchSnapshot::new(1, 100.0));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_drain_returns_batch_outcome() {
    let (sink, mut flushes) = recording_sink(Duration::from_secs(1), false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);

    let token = CancellationToken::new();
    let waiter = {
        let handle = handle.clone();
        let token = token.clone();
        tokio::spawn(async move {
            handle
                .submit_and_await(DonationEvent::new(1, 100.0), token)
                .await
        })
    };

    // Flush started at 250ms and is in flight until 1250ms
    let (_, snapshot) = flushes.recv().await.unwrap();
    token.cancel();
    assert_eq!(waiter.await.unwrap().unwrap(), Some(snapshot));
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn test_failed_flush_rejects_waiters() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, true);
    let (join, handle) = start_batcher(test_config(250, 1000), sink);

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit_and_await(DonationEvent::new(1, 100.0), CancellationToken::new())
                .await
        })
    };
    let result = waiter.await.unwrap();
    match result {
        Err(BatcherError::Flush(err)) => assert_eq!(err.to_string(), "device unreachable"),
        other => panic!("expected flush error, got {other:?}"),
    }
    assert_eq!(flushes.recv().await.unwrap().1, BatchSnapshot::new(1, 100.0));
    assert!(logs_contain("Flush of batch 1 failed"));

    // Nothing re-queued, the next batch starts empty
    let status = handle.status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.pending_sum, 0.0);
    assert!(!status.flushing);

    assert!(handle.submit(DonationEvent::new(2, 20.0)).await.unwrap());
    assert_eq!(flushes.recv().await.unwrap().1, BatchSnapshot::new(1, 20.0));

    // The batcher outlives failing flushes
    handle.shutdown().await.unwrap();
    assert!(join.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_sink_reported_as_failure() {
    let sink = |_snapshot: BatchSnapshot| async move {
        if true {
            panic!("renderer crashed");
        }
        Ok::<(), anyhow::Error>(())
    };
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);

    let result = handle
        .submit_and_await(DonationEvent::new(1, 1.0), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BatcherError::Flush(_))));
    assert!(handle.submit(DonationEvent::new(2, 1.0)).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_single_flush_in_flight() {
    let (sink, mut flushes) = recording_sink(Duration::from_secs(2), false);
    let (_join, handle) = start_batcher(test_config(250, 1000), sink);
    let start = Instant::now();

    assert!(handle.submit(DonationEvent::new(1, 1.0)).await.unwrap());
    let (at, first) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(250));
    assert_eq!(first, BatchSnapshot::new(1, 1.0));

    sleep(Duration::from_millis(50)).await;
    assert!(handle.submit(DonationEvent::new(2, 2.0)).await.unwrap());
    let status = handle.status().await.unwrap();
    assert!(status.flushing);
    assert_eq!(status.pending_count, 1);

    // The new batch was due at 550ms, it only flushes once the first one
    // settled at 2250ms
    let (at, second) = flushes.recv().await.unwrap();
    assert_eq!(at - start, Duration::from_millis(2250));
    assert_eq!(second, BatchSnapshot::new(1, 2.0));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_batch() {
    let (sink, mut flushes) = recording_sink(Duration::ZERO, false);
    let (join, handle) = start_batcher(test_config(8000, 60_000), sink);
    let start = Instant::now();

    let waiter = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit_and_await(DonationEvent::new(1, 42.0), CancellationToken::new())
                .await
        })
    };
    tokio::task::yield_now().await;
    assert!(handle.submit(DonationEvent::new(2, 8.0)).await.unwrap());

    handle.shutdown().await.unwrap();
    let (at, snapshot) = flushes.recv().await.unwrap();
    assert_eq!(at, start);
    assert_eq!(snapshot, BatchSnapshot::new(2, 50.0));
    assert_eq!(waiter.await.unwrap().unwrap(), Some(snapshot));

    let terminated = join.await.unwrap().unwrap();
    assert_eq!(terminated, "Batcher terminated successfully");
    assert!(matches!(
        handle.submit(DonationEvent::new(3, 1.0)).await,
        Err(BatcherError::SendError)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_flush() {
    let (sink, mut flushes) = recording_sink(Duration::from_secs(5), false);
    let (join, handle) = start_batcher(test_config(250, 1000), sink);
    let start = Instant::now();

    assert!(handle.submit(DonationEvent::new(1, 1.0)).await.unwrap());
    let _ = flushes.recv().await.unwrap();
    handle.shutdown().await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(5250));
    assert!(join.await.unwrap().is_ok());
}
