use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{build_args, classify_exit, EncodeJob, EncodeOutcome, Encoder};

/// Encoder backed by an external ffmpeg-compatible program
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    hls_playlist: PathBuf,
    stop_timeout: Option<Duration>,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>, hls_playlist: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            hls_playlist: hls_playlist.into(),
            stop_timeout: None,
        }
    }

    /// Kill the process if it is still running this long after an interrupt
    pub fn with_stop_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, job: &EncodeJob, stop: CancellationToken) -> Result<EncodeOutcome> {
        let args = build_args(job, &self.hls_playlist);
        info!("Starting encoder for {} (segment base {})", job.item.path, job.segment_base);
        debug!("Encoder arguments: {:?}", args);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn encoder program '{}'", self.program))?;

        let pid = child.id();
        let output = child.wait_with_output();
        tokio::pin!(output);

        let mut interrupted = false;
        let waited = tokio::select! {
            res = &mut output => res,
            _ = stop.cancelled() => {
                interrupted = true;
                if let Some(pid) = pid {
                    interrupt_process(pid);
                }
                match self.stop_timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut output).await {
                        Ok(res) => res,
                        Err(_) => {
                            warn!("Encoder ignored the interrupt for {:?}, killing it", limit);
                            if let Some(pid) = pid {
                                kill_process(pid);
                            }
                            output.await
                        }
                    },
                    None => output.await,
                }
            }
        };
        let output = waited.context("Failed to wait for the encoder")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("Encoder output:\n{}", combined);

        let outcome = classify_exit(output.status.success(), output.status.code(), &combined, job.subtitles);
        info!("Encoder ended for {} ({})", job.item.path, output.status);

        if interrupted && outcome != EncodeOutcome::SubtitlesUnavailable {
            return Ok(EncodeOutcome::Completed);
        }
        Ok(outcome)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: kill(2) has no memory effects; the pid belongs to a child we have not reaped yet
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

#[cfg(unix)]
fn interrupt_process(pid: u32) {
    if !send_signal(pid, libc::SIGINT) {
        warn!("Failed to interrupt encoder process {}", pid);
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    if !send_signal(pid, libc::SIGKILL) {
        warn!("Failed to kill encoder process {}", pid);
    }
}

#[cfg(not(unix))]
fn interrupt_process(pid: u32) {
    warn!("Graceful interrupt is not supported on this platform (pid {})", pid);
}

#[cfg(not(unix))]
fn kill_process(pid: u32) {
    warn!("Forced kill by pid is not supported on this platform (pid {})", pid);
}
