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

//! Client for the Tidbyt device push API.

use crate::config::PushConfig;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Url;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid push url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push rejected with status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PushRequest {
    /// Base64 encoded WebP
    pub image: String,
    #[serde(rename = "installationID", skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    pub background: bool,
}

#[derive(Debug, Clone)]
pub struct TidbytClient {
    client: reqwest::Client,
    url: Url,
    api_key: String,
    installation_id: Option<String>,
    background: bool,
}

impl TidbytClient {
    pub fn new(config: &PushConfig) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            url: push_url(&config.base_url, &config.device_id)?,
            api_key: config.api_key.clone(),
            installation_id: config
                .installation_id
                .clone()
                .filter(|installation_id| !installation_id.is_empty()),
            background: config.background,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Background pushes only apply to a named installation
    pub fn request_body(&self, image: &[u8]) -> PushRequest {
        PushRequest {
            image: STANDARD.encode(image),
            installation_id: self.installation_id.clone(),
            background: self.background && self.installation_id.is_some(),
        }
    }

    pub async fn push(&self, image: &[u8]) -> Result<(), PushError> {
        let body = self.request_body(image);
        debug!("Pushing {} byte image to {}", image.len(), self.url);
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            "Pushed image to device, installation={:?} background={}",
            body.installation_id, body.background
        );
        Ok(())
    }
}

/// `{base_url}/v0/devices/{device_id}/push` with the device id escaped as a
/// single path segment
pub fn push_url(base_url: &str, device_id: &str) -> Result<Url, PushError> {
    let invalid = |reason: String| PushError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let mut url = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(["v0", "devices", device_id, "push"]);
    Ok(url)
}
