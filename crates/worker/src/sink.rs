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

//! Flush sink that renders a batch and pushes it to the display.

use crate::{
    config::{PushConfig, RenderConfig},
    push::{PushError, TidbytClient},
    render::{PixletRenderer, RenderError},
};
use futures::{future::BoxFuture, FutureExt};
use std::sync::Arc;
use tallyboard_batcher::{BatchSnapshot, FlushSink};
use tracing::{info, warn};

#[derive(Debug)]
struct DisplaySinkInner {
    renderer: PixletRenderer,
    client: Option<TidbytClient>,
    country_code: String,
    currency: String,
    max_image_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DisplaySink {
    inner: Arc<DisplaySinkInner>,
}

impl DisplaySink {
    pub fn new(render: &RenderConfig, push: Option<&PushConfig>) -> Result<Self, PushError> {
        let client = push.map(TidbytClient::new).transpose()?;
        if client.is_none() {
            warn!("No push configuration, batches will only be logged");
        }
        Ok(Self {
            inner: Arc::new(DisplaySinkInner {
                renderer: PixletRenderer::from_config(render),
                client,
                country_code: render.country_code(),
                currency: render.currency.clone(),
                max_image_bytes: render.max_image_bytes,
            }),
        })
    }

    /// Applet parameters for a batch, the sum is rounded to whole units
    pub fn render_params(&self, snapshot: BatchSnapshot) -> [(&'static str, String); 4] {
        [
            ("count", snapshot.count.to_string()),
            ("sum", format!("{}", snapshot.sum.round() as i64)),
            ("country", self.inner.country_code.clone()),
            ("currency", self.inner.currency.clone()),
        ]
    }

    pub async fn deliver(&self, snapshot: BatchSnapshot) -> anyhow::Result<()> {
        let Some(client) = &self.inner.client else {
            info!(
                "Skipping display push for {} donations totalling {}",
                snapshot.count, snapshot.sum
            );
            return Ok(());
        };
        let image = self
            .inner
            .renderer
            .render(&self.render_params(snapshot))
            .await?;
        if image.len() > self.inner.max_image_bytes {
            return Err(RenderError::TooLarge {
                size: image.len(),
                limit: self.inner.max_image_bytes,
            }
            .into());
        }
        client.push(&image).await?;
        info!(
            "Displayed {} donations totalling {}",
            snapshot.count, snapshot.sum
        );
        Ok(())
    }
}

impl FlushSink for DisplaySink {
    fn flush(&self, snapshot: BatchSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
        let sink = self.clone();
        async move { sink.deliver(snapshot).await }.boxed()
    }
}
