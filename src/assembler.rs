use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::ClipFile;
use crate::status::{Phase, StatusHandle};

/// Per-channel sequence numbers, persisted next to the compilations so the
/// scan-then-write race of pure directory counting is gone.
const COUNTER_FILE: &str = ".counters.json";

/// The finished artifact.
#[derive(Debug, Clone)]
pub struct CompilationOutput {
    pub channel: String,
    pub sequence: u32,
    pub path: PathBuf,
}

/// Container probing and concatenation, kept behind a trait so the pipeline
/// logic is testable without ffmpeg installed.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Whether the file parses as a playable container.
    async fn probe(&self, path: &Path) -> bool;

    /// Concatenates `inputs` in order into `output`.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

/// ffmpeg/ffprobe subprocess implementation. Mismatched resolutions are
/// letterboxed onto a common canvas instead of rejected; audio is always
/// encoded as AAC.
pub struct FfmpegTool;

const CANVAS_W: u32 = 1920;
const CANVAS_H: u32 = 1080;

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn probe(&self, path: &Path) -> bool {
        let result = tokio::process::Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(path)
            .output()
            .await;
        match result {
            Ok(output) => output.status.success(),
            Err(err) => {
                warn!("ffprobe failed to start for {}: {err}", path.display());
                false
            }
        }
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut args: Vec<String> = vec!["-y".to_string()];
        for input in inputs {
            args.push("-i".to_string());
            args.push(input.display().to_string());
        }

        // Scale each clip onto a shared canvas, padding to preserve aspect
        // ratio, then feed every video/audio pair to the concat filter.
        let mut filter = String::new();
        for i in 0..inputs.len() {
            filter.push_str(&format!(
                "[{i}:v]scale={CANVAS_W}:{CANVAS_H}:force_original_aspect_ratio=decrease,\
                 pad={CANVAS_W}:{CANVAS_H}:(ow-iw)/2:(oh-ih)/2,setsar=1[v{i}];"
            ));
        }
        for i in 0..inputs.len() {
            filter.push_str(&format!("[v{i}][{i}:a]"));
        }
        filter.push_str(&format!("concat=n={}:v=1:a=1[v][a]", inputs.len()));

        args.extend(
            [
                "-filter_complex",
                &filter,
                "-map",
                "[v]",
                "-map",
                "[a]",
                "-c:v",
                "libx264",
                "-c:a",
                "aac",
            ]
            .map(String::from),
        );
        args.push(output.display().to_string());

        run_ffmpeg(&args).await
    }
}

async fn run_ffmpeg(args: &[String]) -> Result<()> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .context("spawning ffmpeg")?;

    debug!("ffmpeg stdout: {}", String::from_utf8_lossy(&output.stdout));
    if !output.status.success() {
        return Err(anyhow!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

fn load_counters(path: &Path) -> HashMap<String, u32> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn store_counters(path: &Path, counters: &HashMap<String, u32>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(counters)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Next sequence number for `channel`. The persisted counter wins; a channel
/// with no record falls back to counting its existing output files, which is
/// also the migration path for pre-counter directories.
fn next_sequence(dir: &Path, channel: &str) -> Result<u32> {
    let counter_path = dir.join(COUNTER_FILE);
    let mut counters = load_counters(&counter_path);

    let next = match counters.get(channel) {
        Some(count) => count + 1,
        None => {
            let existing = std::fs::read_dir(dir)
                .with_context(|| format!("reading {}", dir.display()))?
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_string_lossy()
                        .starts_with(channel)
                })
                .count() as u32;
            existing + 1
        }
    };

    counters.insert(channel.to_string(), next);
    store_counters(&counter_path, &counters)?;
    Ok(next)
}

/// Concatenates fetched clip files, in index order, into one uniquely named
/// output per channel.
pub struct Assembler {
    compilations_dir: PathBuf,
    tool: Arc<dyn MediaTool>,
}

impl Assembler {
    pub fn new(compilations_dir: PathBuf, tool: Arc<dyn MediaTool>) -> Self {
        Assembler {
            compilations_dir,
            tool,
        }
    }

    pub async fn assemble(
        &self,
        channel: &str,
        clip_files: &[ClipFile],
        status: &StatusHandle,
    ) -> PipelineResult<CompilationOutput> {
        status.set_phase(Phase::Compiling);

        // Tolerate files that vanished or rotted between fetch and assembly.
        let mut inputs = Vec::with_capacity(clip_files.len());
        for clip in clip_files {
            if !clip.path.exists() {
                warn!("clip {} disappeared before assembly, skipping", clip.path.display());
                continue;
            }
            if !self.tool.probe(&clip.path).await {
                warn!("clip {} is not a loadable container, skipping", clip.path.display());
                continue;
            }
            inputs.push(clip.path.clone());
        }

        if inputs.is_empty() {
            return Err(PipelineError::NoValidClips);
        }

        let (sequence, output) = self.output_path(channel)?;
        self.tool.concat(&inputs, &output).await?;
        status.set_phase(Phase::Complete);

        Ok(CompilationOutput {
            channel: channel.to_string(),
            sequence,
            path: output,
        })
    }

    fn output_path(&self, channel: &str) -> Result<(u32, PathBuf)> {
        let mut sequence = next_sequence(&self.compilations_dir, channel)?;
        loop {
            let path = self
                .compilations_dir
                .join(format!("{channel}_compilation{sequence}.mp4"));
            // The counter makes collisions unlikely; a stale counter file
            // must still never overwrite an existing compilation.
            if !path.exists() {
                return Ok((sequence, path));
            }
            ensure!(sequence < u32::MAX, "compilation sequence overflow");
            sequence += 1;
        }
    }
}
