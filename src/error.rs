use std::path::PathBuf;

use thiserror::Error;

/// Pipeline-level failures that are surfaced to the caller/poller.
///
/// Per-clip download and load problems are deliberately *not* represented
/// here: they are contained inside the fetcher/assembler and only logged.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no channel matches '{0}'")]
    ChannelNotFound(String),

    #[error("no clips found for the requested time window")]
    EmptyResultSet,

    #[error("none of the downloaded clips could be loaded")]
    NoValidClips,

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
