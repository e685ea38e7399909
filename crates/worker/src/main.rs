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

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use std::{env, path::PathBuf, str::FromStr};
use tallyboard_worker::{config::WorkerConfig, run_worker};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

fn init_tracing(level: &'_ str) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let level = Level::from_str(level).map_err(|err| format!("invalid logging level: {err}"))?;
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        return Err(format!("Usage: {} <config-file>", args[0]).into());
    }
    let config_file = PathBuf::from(&args[1]);
    // Nested keys are separated by a double underscore, e.g. TB_PUSH__API_KEY
    let config: WorkerConfig = match Figment::new()
        .merge(Yaml::file(config_file))
        .merge(Env::prefixed("TB_").split("__"))
        .extract()
    {
        Ok(config) => config,
        Err(err) => {
            return Err(format!("Parsing config file failed: {err}").into());
        }
    };
    init_tracing(&config.logging.level)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // If num threads is not configured then the default use all CPU cores is used
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    runtime.block_on(async move {
        let meter = opentelemetry::global::meter("tallyboard-worker");
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(config, meter, shutdown.clone()));
        tokio::pin!(worker);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Termination signal received, flushing pending donations");
                shutdown.cancel();
                worker.await??;
            }
            result = &mut worker => {
                info!("Worker terminated, shutting down");
                result??;
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync + 'static>>(())
    })
}
