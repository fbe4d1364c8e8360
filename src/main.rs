mod api;
mod assembler;
mod config;
mod error;
mod fetcher;
mod pipeline;
mod status;
mod twitch;

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::status::StatusRegistry;
use crate::twitch::TwitchClient;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    config.ensure_dirs()?;

    let twitch = Arc::new(TwitchClient::new(
        config.client_id.clone(),
        config.client_secret.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(&config, twitch));
    let registry = StatusRegistry::new();

    info!("listening on {}", config.bind_addr);
    api::run_api_server(&config, pipeline, registry).await?;
    Ok(())
}
