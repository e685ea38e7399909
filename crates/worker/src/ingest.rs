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

//! Line delimited JSON front end that feeds donation events to the batcher.
//!
//! Each request is a single JSON object on its own line and is answered with
//! exactly one JSON line, in request order:
//!
//! ```text
//! -> {"op":"donation","token":"s3cret","donationId":42,"amount":100,"wait":true}
//! <- {"ok":true,"accepted":true,"batch":{"count":3,"sum":250.0}}
//! -> {"op":"health"}
//! <- {"ok":true,"status":{"pending_count":0,...}}
//! ```
//!
//! A request with `wait` set is held until the batch it joined was flushed.
//! When the peer goes away in the meantime its wait is cancelled, the event
//! itself stays in the batch.

use crate::config::IngestConfig;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::{collections::VecDeque, net::SocketAddr, sync::Arc};
use tallyboard_batcher::{
    BatchSnapshot, BatcherError, BatcherHandle, BatcherStatus, DonationEvent, DonationId,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, info, warn, Instrument};

/// Ids at or above 2^64 do not fit a [DonationId]
const DONATION_ID_LIMIT: f64 = 18_446_744_073_709_551_616.0;

/// Lines read ahead while a waiting request is held, reading pauses beyond
pub const MAX_PIPELINED_LINES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("batcher is not running: {0}")]
    Batcher(#[from] BatcherError),
}

impl From<LinesCodecError> for IngestError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(err) => Self::Io(err),
            LinesCodecError::MaxLineLengthExceeded => Self::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IngestRequest {
    Health,
    Donation(DonationRequest),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub donation_id: f64,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wait: bool,
}

impl DonationRequest {
    /// Ids must be positive whole numbers and amounts positive
    pub fn to_event(&self) -> Option<DonationEvent> {
        let id = self.donation_id;
        if !id.is_finite() || id <= 0.0 || id.fract() != 0.0 || id >= DONATION_ID_LIMIT {
            return None;
        }
        let event = DonationEvent {
            id: id as DonationId,
            amount: self.amount,
            observed_at: self.timestamp.unwrap_or_else(Utc::now),
        };
        event.has_valid_amount().then_some(event)
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatcherStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    pub fn accepted(accepted: bool, batch: Option<BatchSnapshot>) -> Self {
        Self {
            ok: true,
            accepted: Some(accepted),
            batch,
            ..Default::default()
        }
    }

    pub fn status(status: BatcherStatus) -> Self {
        Self {
            ok: true,
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub struct IngestListener {
    listener: TcpListener,
    batcher: BatcherHandle,
    auth_token: Option<Arc<str>>,
    max_line_length: usize,
    connections: JoinSet<()>,
}

impl IngestListener {
    pub async fn bind(config: &IngestConfig, batcher: BatcherHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.address).await?;
        if config.auth_token.is_none() {
            warn!("No auth token configured, accepting donations from any client");
        }
        Ok(Self {
            listener,
            batcher,
            auth_token: config.auth_token.as_deref().map(Arc::from),
            max_line_length: config.max_line_length,
            connections: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled. Idle connections
    /// close along with it, waiting ones stay open until the final drain
    /// answered them, see [IngestListener::join_connections].
    pub async fn run(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Listening for donations on {}", self.local_addr()?);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Ingest listener shutting down");
                    return Ok(());
                }
                Some(joined) = self.connections.join_next(), if !self.connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!("Connection task failed: {err}");
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("Failed to accept connection: {err}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {peer}");
                    let connection = Connection {
                        batcher: self.batcher.clone(),
                        auth_token: self.auth_token.clone(),
                        shutdown: shutdown.child_token(),
                    };
                    let framed =
                        Framed::new(stream, LinesCodec::new_with_max_length(self.max_line_length));
                    self.connections.spawn(
                        async move {
                            if let Err(err) = connection.serve(framed).await {
                                warn!("Connection closed with error: {err}");
                            }
                        }
                        .instrument(tracing::info_span!("ingest", %peer)),
                    );
                }
            }
        }
    }

    /// Waits for every connection task to finish
    pub async fn join_connections(&mut self) {
        while let Some(joined) = self.connections.join_next().await {
            if let Err(err) = joined {
                warn!("Connection task failed: {err}");
            }
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

struct Connection {
    batcher: BatcherHandle,
    auth_token: Option<Arc<str>>,
    shutdown: CancellationToken,
}

/// What to do after a single request was handled
enum Reply {
    Send(IngestResponse),
    /// Send the response and close the connection
    Close(IngestResponse),
    Disconnected,
}

impl Connection {
    async fn serve(&self, mut framed: Framed<TcpStream, LinesCodec>) -> Result<(), IngestError> {
        // Lines that arrived while a waiting request was in progress
        let mut stashed = VecDeque::new();
        loop {
            let line = match stashed.pop_front() {
                Some(line) => line,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        next = framed.next() => next,
                    };
                    match next {
                        None => return Ok(()),
                        Some(Ok(line)) => line,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            let response = IngestResponse::error("request too large");
                            framed.send(serde_json::to_string(&response)?).await?;
                            return Ok(());
                        }
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.handle(&line, &mut framed, &mut stashed).await? {
                Reply::Send(response) => framed.send(serde_json::to_string(&response)?).await?,
                Reply::Close(response) => {
                    framed.send(serde_json::to_string(&response)?).await?;
                    return Ok(());
                }
                Reply::Disconnected => return Ok(()),
            }
        }
    }

    async fn handle(
        &self,
        line: &str,
        framed: &mut Framed<TcpStream, LinesCodec>,
        stashed: &mut VecDeque<String>,
    ) -> Result<Reply, IngestError> {
        let request = match serde_json::from_str::<IngestRequest>(line) {
            Ok(request) => request,
            Err(err) => {
                debug!("Rejecting malformed request: {err}");
                return Ok(Reply::Send(IngestResponse::error("bad request")));
            }
        };
        let request = match request {
            IngestRequest::Health => {
                let status = self.batcher.status().await?;
                return Ok(Reply::Send(IngestResponse::status(status)));
            }
            IngestRequest::Donation(request) => request,
        };
        if let Some(expected) = &self.auth_token {
            if request.token.as_deref() != Some(expected.as_ref()) {
                return Ok(Reply::Send(IngestResponse::error("unauthorized")));
            }
        }
        let Some(event) = request.to_event() else {
            return Ok(Reply::Send(IngestResponse::error("bad request")));
        };
        if !request.wait {
            let accepted = self.batcher.submit(event).await?;
            return Ok(Reply::Send(IngestResponse::accepted(accepted, None)));
        }

        // Not tied to shutdown, the final drain still answers pending waits
        let cancel = CancellationToken::new();
        let wait = self.batcher.submit_and_await(event, cancel.clone());
        tokio::pin!(wait);
        let mut ended = None;
        let outcome = loop {
            let read_ahead = ended.is_none() && stashed.len() < MAX_PIPELINED_LINES;
            tokio::select! {
                biased;
                outcome = &mut wait => break outcome,
                next = framed.next(), if read_ahead => match next {
                    Some(Ok(line)) => stashed.push_back(line),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        debug!("Oversized line while waiting for its batch");
                        ended = Some(Reply::Close(IngestResponse::error("request too large")));
                        cancel.cancel();
                    }
                    _ => {
                        info!("Peer went away while waiting for its batch");
                        ended = Some(Reply::Disconnected);
                        cancel.cancel();
                    }
                },
            }
        };
        if let Some(reply) = ended {
            return Ok(reply);
        }
        let response = match outcome {
            Ok(Some(batch)) => IngestResponse::accepted(true, Some(batch)),
            Ok(None) => IngestResponse::accepted(false, None),
            Err(BatcherError::Flush(err)) => IngestResponse {
                accepted: Some(true),
                ..IngestResponse::error(format!("flush failed: {err:#}"))
            },
            Err(err) => return Err(err.into()),
        };
        Ok(Reply::Send(response))
    }
}
