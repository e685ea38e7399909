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
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tallyboard_batcher::BatcherConfig;

const MAX_LINE_LENGTH_DEFAULT: usize = 8 * 1024;

pub(crate) const fn default_max_line_length() -> usize {
    MAX_LINE_LENGTH_DEFAULT
}

pub(crate) const fn default_render_timeout() -> Duration {
    Duration::from_secs(30)
}

pub(crate) const fn default_push_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Tidbyt rejects pushes above this size
pub(crate) const fn default_max_image_bytes() -> usize {
    192 * 1024
}

pub(crate) fn default_pixlet_bin() -> PathBuf {
    PathBuf::from("pixlet")
}

pub(crate) fn default_country_code() -> String {
    "??".to_string()
}

pub(crate) fn default_currency() -> String {
    "kr".to_string()
}

pub(crate) fn default_installation_id() -> Option<String> {
    Some("effekt-donation-alert".to_string())
}

pub(crate) fn default_base_url() -> String {
    "https://api.tidbyt.com".to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    pub ingest: IngestConfig,
    pub render: RenderConfig,
    /// Without push credentials batches are only logged
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub push: Option<PushConfig>,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestConfig {
    pub address: SocketAddr,

    /// Shared secret donation requests must carry, unauthenticated when unset
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_pixlet_bin")]
    pub pixlet_bin: PathBuf,

    pub applet_path: PathBuf,

    #[serde(default = "default_country_code")]
    pub country_code: String,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Passed to `pixlet render --timeout` and enforced on the child process
    #[serde(default = "default_render_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

impl RenderConfig {
    /// Country codes are shown upper-cased on the display
    pub fn country_code(&self) -> String {
        self.country_code.to_uppercase()
    }
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PushConfig {
    pub api_key: String,

    pub device_id: String,

    #[serde(default = "default_installation_id")]
    pub installation_id: Option<String>,

    /// Push without interrupting the app rotation, needs an installation id
    #[serde(default)]
    pub background: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// See [reqwest::ClientBuilder::timeout]
    #[serde(default = "default_push_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}
