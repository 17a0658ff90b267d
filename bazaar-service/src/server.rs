// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use bazaar_common::tracing::init_tracing;
use bazaar_common::SafeDisplay;
use bazaar_service::config::make_config_loader;
use bazaar_service::PlatformService;
use tokio::task::JoinSet;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = make_config_loader()
        .load_or_dump_config()
        .context("loading configuration")?;

    init_tracing(&config.tracing);
    info!("Configuration:\n{}", config.to_safe_string());

    let service = PlatformService::new(config).await?;

    let mut join_set = JoinSet::new();
    service.run(&mut join_set).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            service.shutdown().await;
        }
        result = join_set.join_next() => {
            if let Some(result) = result {
                result??;
            }
        }
    }

    Ok(())
}
