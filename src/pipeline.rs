use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::assembler::{Assembler, CompilationOutput, FfmpegTool, MediaTool};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::{
    ClipFetcher, HttpDownloader, MediaDownloader, ResolveMediaUrl, RetryPolicy, ThumbnailTransform,
};
use crate::status::{Phase, StatusHandle};
use crate::twitch::{Channel, ClipSource, TimeWindow, DEFAULT_QUERY_LIMIT};

/// Wires the stages together: query, fetch, assemble. One instance serves
/// the whole process; each invocation gets its own status handle, run
/// directory and cancellation token.
pub struct Pipeline {
    clips_dir: PathBuf,
    compilations_dir: PathBuf,
    source: Arc<dyn ClipSource>,
    resolver: Arc<dyn ResolveMediaUrl>,
    downloader: Arc<dyn MediaDownloader>,
    tool: Arc<dyn MediaTool>,
    policy: RetryPolicy,
}

impl Pipeline {
    pub fn new(config: &Config, source: Arc<dyn ClipSource>) -> Self {
        Self::with_components(
            config,
            source,
            Arc::new(ThumbnailTransform),
            Arc::new(HttpDownloader::new()),
            Arc::new(FfmpegTool),
            RetryPolicy::default(),
        )
    }

    pub fn with_components(
        config: &Config,
        source: Arc<dyn ClipSource>,
        resolver: Arc<dyn ResolveMediaUrl>,
        downloader: Arc<dyn MediaDownloader>,
        tool: Arc<dyn MediaTool>,
        policy: RetryPolicy,
    ) -> Self {
        Pipeline {
            clips_dir: config.clips_dir.clone(),
            compilations_dir: config.compilations_dir.clone(),
            source,
            resolver,
            downloader,
            tool,
            policy,
        }
    }

    pub fn source(&self) -> &Arc<dyn ClipSource> {
        &self.source
    }

    /// Runs one compilation end to end for an already-resolved channel.
    pub async fn run(
        &self,
        channel: Channel,
        window: TimeWindow,
        status: StatusHandle,
        cancel: CancellationToken,
    ) -> PipelineResult<CompilationOutput> {
        let clips = self
            .source
            .query_clips(&channel, window, DEFAULT_QUERY_LIMIT)
            .await?;
        if clips.is_empty() {
            return Err(PipelineError::EmptyResultSet);
        }
        info!("{}: {} clip(s) in window", channel.login, clips.len());

        status.set_phase(Phase::Downloading);
        // Per-run directory, so concurrent runs never clobber each other's
        // numbered files.
        let run_dir = self.clips_dir.join(status.run_id().to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: run_dir.clone(),
                source,
            })?;

        let fetcher = ClipFetcher::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.downloader),
            self.policy,
        );
        let result = async {
            let files = fetcher.fetch(&clips, &run_dir, &status, &cancel).await?;
            let assembler = Assembler::new(self.compilations_dir.clone(), Arc::clone(&self.tool));
            assembler.assemble(&channel.login, &files, &status).await
        }
        .await;

        // Downloads are intermediate artifacts; the compilation is the output.
        if let Err(err) = tokio::fs::remove_dir_all(&run_dir).await {
            error!("could not clean up {}: {err}", run_dir.display());
        }

        result
    }

    /// Detaches a run as a background task. Failures land in the run status
    /// and the log, never in the spawning handler.
    pub fn spawn(
        self: &Arc<Self>,
        channel: Channel,
        window: TimeWindow,
        status: StatusHandle,
        cancel: CancellationToken,
    ) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let login = channel.login.clone();
            match pipeline.run(channel, window, status.clone(), cancel).await {
                Ok(output) => {
                    info!(
                        "{login}: compilation #{} written to {}",
                        output.sequence,
                        output.path.display()
                    );
                }
                Err(err) => {
                    error!("{login}: pipeline failed: {err}");
                    status.set_phase(Phase::Error);
                }
            }
        });
    }
}
