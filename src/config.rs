use std::path::PathBuf;

use anyhow::{Context, Result};

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub bind_addr: String,
    /// Per-run clip downloads land in subdirectories of this directory.
    pub clips_dir: PathBuf,
    /// Finished compilations and the per-channel counter file live here.
    pub compilations_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let client_id =
            std::env::var("TWITCH_CLIENT_ID").context("TWITCH_CLIENT_ID is not set")?;
        let client_secret =
            std::env::var("TWITCH_CLIENT_SECRET").context("TWITCH_CLIENT_SECRET is not set")?;
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let clips_dir = std::env::var("CLIPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("clips"));
        let compilations_dir = std::env::var("COMPILATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("compilations"));

        Ok(Config {
            client_id,
            client_secret,
            bind_addr,
            clips_dir,
            compilations_dir,
        })
    }

    /// Creates the working directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.clips_dir)
            .with_context(|| format!("creating {}", self.clips_dir.display()))?;
        std::fs::create_dir_all(&self.compilations_dir)
            .with_context(|| format!("creating {}", self.compilations_dir.display()))?;
        Ok(())
    }
}
