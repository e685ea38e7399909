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

//! Renders the donation alert applet to a WebP image with the `pixlet` CLI.

use crate::config::RenderConfig;
use std::{ffi::OsString, path::PathBuf, process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to start `{bin}`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pixlet did not finish within {0:?}")]
    Timeout(Duration),

    #[error("pixlet exited with {code}: {stderr}")]
    Exit { code: String, stderr: String },

    #[error("pixlet produced no image: {stderr}")]
    EmptyOutput { stderr: String },

    #[error("rendered image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone)]
pub struct PixletRenderer {
    pixlet_bin: PathBuf,
    applet_path: PathBuf,
    timeout: Duration,
}

impl PixletRenderer {
    pub fn new(pixlet_bin: PathBuf, applet_path: PathBuf, timeout: Duration) -> Self {
        Self {
            pixlet_bin,
            applet_path,
            timeout,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            config.pixlet_bin.clone(),
            config.applet_path.clone(),
            config.timeout,
        )
    }

    /// `pixlet render` arguments writing the image to stdout, applet
    /// parameters are passed as `key=value` pairs in the given order
    pub fn args(&self, params: &[(&str, String)]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "render".into(),
            "--output".into(),
            "-".into(),
            "--silent".into(),
            "--timeout".into(),
            self.timeout.as_millis().to_string().into(),
            self.applet_path.clone().into(),
        ];
        args.extend(
            params
                .iter()
                .map(|(key, value)| OsString::from(format!("{key}={value}"))),
        );
        args
    }

    pub async fn render(&self, params: &[(&str, String)]) -> Result<Vec<u8>, RenderError> {
        let bin = self.pixlet_bin.display().to_string();
        debug!("Running {bin} for applet {}", self.applet_path.display());
        let child = Command::new(&self.pixlet_bin)
            .args(self.args(params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                bin: bin.clone(),
                source,
            })?;

        // Dropping the output future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))?
            .map_err(|source| RenderError::Spawn { bin, source })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|code| format!("code {code}"))
                .unwrap_or_else(|| "signal".to_string());
            return Err(RenderError::Exit { code, stderr });
        }
        if output.stdout.is_empty() {
            return Err(RenderError::EmptyOutput { stderr });
        }
        Ok(output.stdout)
    }
}
