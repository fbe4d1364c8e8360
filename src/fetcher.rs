use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use log::{debug, warn};
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::status::StatusHandle;
use crate::twitch::ClipDescriptor;

/// Hard cap on clips per compilation; input beyond this is ignored.
pub const MAX_CLIPS: usize = 25;

/// Files at or below this size are treated as corrupt downloads.
pub const MIN_CLIP_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_MAX_RETRIES: u32 = 50;

/// A successfully persisted clip. `index` is the 1-based slot in query order
/// and fixes both the on-disk name and the final compilation order.
#[derive(Debug, Clone)]
pub struct ClipFile {
    pub index: usize,
    pub path: PathBuf,
    pub size: u64,
}

/// Bounded-retry policy shared by the transport-failure and corruption
/// cases: every attempt, whatever its failure mode, draws from the same
/// budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_bytes: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_RETRIES,
            min_bytes: MIN_CLIP_BYTES,
        }
    }
}

impl RetryPolicy {
    /// Size-based corruption heuristic: strictly greater than the threshold
    /// passes.
    pub fn is_plausible(&self, size: u64) -> bool {
        size > self.min_bytes
    }
}

/// Maps a clip descriptor to a direct media URL. The thumbnail transform is
/// the default strategy; a rendered-page collaborator can be plugged in as a
/// fallback when upstream naming conventions break.
#[async_trait]
pub trait ResolveMediaUrl: Send + Sync {
    async fn resolve(&self, clip: &ClipDescriptor) -> PipelineResult<String>;
}

/// Derives the media URL from the thumbnail URL by cutting at the
/// `-preview` segment and substituting the mp4 extension. Only valid while
/// upstream keeps this naming convention.
pub struct ThumbnailTransform;

#[async_trait]
impl ResolveMediaUrl for ThumbnailTransform {
    async fn resolve(&self, clip: &ClipDescriptor) -> PipelineResult<String> {
        match clip.thumbnail_url.split_once("-preview") {
            Some((base, _)) => Ok(format!("{base}.mp4")),
            None => Err(PipelineError::Other(anyhow!(
                "thumbnail url for clip {} has no -preview segment",
                clip.id
            ))),
        }
    }
}

/// Tries `primary`, falling back to `secondary` when it fails. Used to chain
/// the thumbnail transform with the rendered-page collaborator.
pub struct FallbackChain {
    pub primary: Arc<dyn ResolveMediaUrl>,
    pub secondary: Arc<dyn ResolveMediaUrl>,
}

#[async_trait]
impl ResolveMediaUrl for FallbackChain {
    async fn resolve(&self, clip: &ClipDescriptor) -> PipelineResult<String> {
        match self.primary.resolve(clip).await {
            Ok(url) => Ok(url),
            Err(err) => {
                debug!("primary url resolution failed for {}: {err}", clip.id);
                self.secondary.resolve(clip).await
            }
        }
    }
}

/// Transfers one media URL to disk.
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> PipelineResult<()>;
}

/// Streamed chunked HTTP transfer; the clip is never buffered whole in
/// memory.
pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        HttpDownloader {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDownloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> PipelineResult<()> {
        let response = self.http.get(url).send().await?.error_for_status()?;

        let byte_stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e));
        let mut reader = StreamReader::new(byte_stream);

        let file = File::create(dest).await.map_err(|source| PipelineError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|source| PipelineError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

/// Percent complete after `index` of `total` clips have been processed.
/// Floor division, so a 25-clip batch reads 4, 8, ... 100.
fn progress_after(index: usize, total: usize) -> u8 {
    (index * 100 / total) as u8
}

/// Downloads clips to numbered files in query order, one at a time. Failed
/// clips are dropped, never aborting the batch; indices keep their gaps so
/// the assembler sees the surviving clips in original order.
pub struct ClipFetcher {
    resolver: Arc<dyn ResolveMediaUrl>,
    downloader: Arc<dyn MediaDownloader>,
    policy: RetryPolicy,
}

impl ClipFetcher {
    pub fn new(
        resolver: Arc<dyn ResolveMediaUrl>,
        downloader: Arc<dyn MediaDownloader>,
        policy: RetryPolicy,
    ) -> Self {
        ClipFetcher {
            resolver,
            downloader,
            policy,
        }
    }

    pub async fn fetch(
        &self,
        clips: &[ClipDescriptor],
        dir: &Path,
        status: &StatusHandle,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<ClipFile>> {
        let total = clips.len().min(MAX_CLIPS);
        let mut files = Vec::with_capacity(total);

        for (slot, clip) in clips.iter().take(MAX_CLIPS).enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let index = slot + 1;
            let dest = dir.join(format!("{index}.mp4"));
            match self.fetch_one(clip, &dest, cancel).await {
                Ok(size) => {
                    debug!("clip {} stored as {} ({size} bytes)", clip.id, dest.display());
                    files.push(ClipFile {
                        index,
                        path: dest,
                        size,
                    });
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    warn!("dropping clip {} after exhausting retries: {err}", clip.id);
                }
            }
            // Progress counts processed clips, success or failure.
            status.set_progress(progress_after(index, total));
        }

        Ok(files)
    }

    /// One clip: resolve the media URL once, then attempt the transfer up to
    /// `max_attempts` times. An under-threshold file is deleted and the
    /// attempt charged the same as a transport failure.
    async fn fetch_one(
        &self,
        clip: &ClipDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<u64> {
        let url = self.resolver.resolve(clip).await?;

        for attempt in 1..=self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match self.downloader.download(&url, dest).await {
                Ok(()) => match tokio::fs::metadata(dest).await {
                    Ok(meta) if self.policy.is_plausible(meta.len()) => {
                        return Ok(meta.len());
                    }
                    Ok(meta) => {
                        warn!(
                            "clip {} attempt {attempt}: {} bytes is under the corruption threshold, retrying",
                            clip.id,
                            meta.len()
                        );
                        if let Err(err) = tokio::fs::remove_file(dest).await {
                            warn!("could not remove suspect file {}: {err}", dest.display());
                        }
                    }
                    Err(err) => {
                        warn!("clip {} attempt {attempt}: transfer produced no file: {err}", clip.id);
                    }
                },
                Err(err) => {
                    warn!("clip {} attempt {attempt}: download failed: {err}", clip.id);
                }
            }
        }

        Err(PipelineError::Other(anyhow!(
            "clip {} failed {} attempt(s)",
            clip.id,
            self.policy.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusRegistry;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn descriptor(id: &str) -> ClipDescriptor {
        ClipDescriptor {
            id: id.to_string(),
            url: format!("https://clips.twitch.tv/{id}"),
            thumbnail_url: format!(
                "https://clips-media-assets2.twitch.tv/{id}-preview-480x272.jpg"
            ),
            duration: 20.0,
            created_at: Utc::now(),
        }
    }

    /// One scripted download outcome per attempt; the last entry repeats.
    #[derive(Clone, Copy)]
    enum Outcome {
        Fail,
        Bytes(u64),
    }

    struct ScriptedDownloader {
        scripts: Mutex<HashMap<String, Vec<Outcome>>>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedDownloader {
        fn new(scripts: Vec<(String, Vec<Outcome>)>) -> Self {
            ScriptedDownloader {
                scripts: Mutex::new(scripts.into_iter().collect()),
                attempts: Mutex::new(HashMap::new()),
            }
        }

        fn attempts_for(&self, url: &str) -> u32 {
            *self.attempts.lock().unwrap().get(url).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl MediaDownloader for ScriptedDownloader {
        async fn download(&self, url: &str, dest: &Path) -> PipelineResult<()> {
            let n = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(url.to_string()).or_insert(0);
                *n += 1;
                *n - 1
            };
            let outcome = {
                let scripts = self.scripts.lock().unwrap();
                let script = scripts.get(url).cloned().unwrap_or_default();
                script
                    .get(n as usize)
                    .or(script.last())
                    .copied()
                    .unwrap_or(Outcome::Fail)
            };
            match outcome {
                Outcome::Fail => Err(PipelineError::Other(anyhow!("scripted transport failure"))),
                Outcome::Bytes(len) => {
                    tokio::fs::write(dest, vec![0u8; len as usize])
                        .await
                        .map_err(|source| PipelineError::Io {
                            path: dest.to_path_buf(),
                            source,
                        })?;
                    Ok(())
                }
            }
        }
    }

    fn media_url(id: &str) -> String {
        format!("https://clips-media-assets2.twitch.tv/{id}.mp4")
    }

    fn fetcher(downloader: Arc<dyn MediaDownloader>, policy: RetryPolicy) -> ClipFetcher {
        ClipFetcher::new(Arc::new(ThumbnailTransform), downloader, policy)
    }

    // Small threshold so tests do not shuffle megabytes around.
    fn test_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_bytes: 64,
        }
    }

    #[tokio::test]
    async fn thumbnail_transform_strips_preview_suffix() {
        let clip = descriptor("157589949");
        let url = ThumbnailTransform.resolve(&clip).await.unwrap();
        assert_eq!(url, "https://clips-media-assets2.twitch.tv/157589949.mp4");
    }

    #[tokio::test]
    async fn thumbnail_transform_rejects_unknown_shape() {
        let mut clip = descriptor("x");
        clip.thumbnail_url = "https://example.com/no-suffix.jpg".to_string();
        assert!(ThumbnailTransform.resolve(&clip).await.is_err());
    }

    #[tokio::test]
    async fn fallback_chain_is_consulted_on_primary_failure() {
        struct Fixed(&'static str);
        #[async_trait]
        impl ResolveMediaUrl for Fixed {
            async fn resolve(&self, _clip: &ClipDescriptor) -> PipelineResult<String> {
                Ok(self.0.to_string())
            }
        }
        struct Broken;
        #[async_trait]
        impl ResolveMediaUrl for Broken {
            async fn resolve(&self, clip: &ClipDescriptor) -> PipelineResult<String> {
                Err(PipelineError::Other(anyhow!("no url for {}", clip.id)))
            }
        }

        let chain = FallbackChain {
            primary: Arc::new(Broken),
            secondary: Arc::new(Fixed("https://fallback/clip.mp4")),
        };
        let url = chain.resolve(&descriptor("a")).await.unwrap();
        assert_eq!(url, "https://fallback/clip.mp4");
    }

    #[tokio::test]
    async fn never_processes_more_than_the_cap() {
        let clips: Vec<_> = (0..30).map(|i| descriptor(&format!("c{i}"))).collect();
        let scripts = clips
            .iter()
            .map(|c| (media_url(&c.id), vec![Outcome::Bytes(128)]))
            .collect::<Vec<_>>();
        let downloader = Arc::new(ScriptedDownloader::new(scripts));
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new();
        let status = registry.register();

        let files = fetcher(downloader.clone(), test_policy(3))
            .fetch(&clips, dir.path(), &status, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(files.len(), MAX_CLIPS);
        assert_eq!(files.last().unwrap().index, MAX_CLIPS);
        assert_eq!(downloader.attempts_for(&media_url("c25")), 0);
        assert_eq!(registry.get(status.run_id()).unwrap().progress, 100);
    }

    #[tokio::test]
    async fn failed_clip_leaves_a_gap_but_preserves_order() {
        let clips: Vec<_> = ["a", "b", "c"].iter().map(|s| descriptor(s)).collect();
        let downloader = Arc::new(ScriptedDownloader::new(vec![
            (media_url("a"), vec![Outcome::Bytes(128)]),
            (media_url("b"), vec![Outcome::Fail]),
            (media_url("c"), vec![Outcome::Bytes(128)]),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new();
        let status = registry.register();

        let files = fetcher(downloader, test_policy(2))
            .fetch(&clips, dir.path(), &status, &CancellationToken::new())
            .await
            .unwrap();

        let indices: Vec<_> = files.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(registry.get(status.run_id()).unwrap().progress, 100);
    }

    #[tokio::test]
    async fn under_threshold_file_is_deleted_and_retried() {
        let clips = vec![descriptor("a")];
        let downloader = Arc::new(ScriptedDownloader::new(vec![(
            media_url("a"),
            vec![Outcome::Bytes(10), Outcome::Bytes(64), Outcome::Bytes(200)],
        )]));
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new();
        let status = registry.register();

        let files = fetcher(downloader.clone(), test_policy(5))
            .fetch(&clips, dir.path(), &status, &CancellationToken::new())
            .await
            .unwrap();

        // 10 bytes and exactly-at-threshold 64 bytes both fail the strictly
        // greater-than check; the 200-byte transfer is accepted.
        assert_eq!(downloader.attempts_for(&media_url("a")), 3);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 200);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_continues() {
        let clips = vec![descriptor("bad"), descriptor("good")];
        let downloader = Arc::new(ScriptedDownloader::new(vec![
            (media_url("bad"), vec![Outcome::Bytes(1)]),
            (media_url("good"), vec![Outcome::Bytes(128)]),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new();
        let status = registry.register();

        let files = fetcher(downloader.clone(), test_policy(4))
            .fetch(&clips, dir.path(), &status, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downloader.attempts_for(&media_url("bad")), 4);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].index, 2);
        // The rejected download never leaves a file behind.
        assert!(!dir.path().join("1.mp4").exists());
        assert!(dir.path().join("2.mp4").exists());
    }

    #[test]
    fn progress_is_floor_division_and_monotonic() {
        let values: Vec<u8> = (1..=25).map(|i| progress_after(i, 25)).collect();
        assert_eq!(values[0], 4);
        assert_eq!(values[5], 24); // floor(6/25 * 100)
        assert_eq!(*values.last().unwrap(), 100);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(progress_after(1, 3), 33);
        assert_eq!(progress_after(2, 3), 66);
        assert_eq!(progress_after(3, 3), 100);
    }

    #[tokio::test]
    async fn cancellation_stops_between_clips() {
        let clips: Vec<_> = ["a", "b"].iter().map(|s| descriptor(s)).collect();
        let downloader = Arc::new(ScriptedDownloader::new(vec![
            (media_url("a"), vec![Outcome::Bytes(128)]),
            (media_url("b"), vec![Outcome::Bytes(128)]),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new();
        let status = registry.register();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(downloader.clone(), test_policy(1))
            .fetch(&clips, dir.path(), &status, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(downloader.attempts_for(&media_url("a")), 0);
    }
}
