#![forbid(unsafe_code)]

//! Download supervisor.
//!
//! Drives the extractor through an ordered list of strategies until a work
//! directory holds the media file, cover, metadata and subtitles, or the video
//! can be given a precise failure kind. The filesystem is the source of
//! truth: success means a `*_*p.{mp4,mkv,webm}` file exists, regardless of
//! what the extractor's exit status says.

pub mod args;
pub mod monitor;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{SubtitleConfig, YoutubeConfig};
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::subtitles::normalize_directory;
use crate::tools::Tools;
use crate::workdir::{
    cleanup_partial_files, download_bytes, find_video_file, has_partial_files,
    height_from_filename, mark_download_failed, mark_downloaded, mark_downloading,
    mark_undownloadable, video_title,
};

use args::{Strategy, build_download_args, strategies};
use monitor::{ByteWatch, MonitorSettings, RunOutcome, run_extractor};

const COMPONENT: &str = "download";

const BOT_MARKERS: &[&str] = &[
    "sign in to confirm",
    "confirm you're not a bot",
    "not a bot",
    "authentication",
    "bot detection",
];

const UNDOWNLOADABLE_MARKERS: &[&str] = &[
    "private video",
    "video unavailable",
    "this video has been removed",
    "members-only",
    "copyright claim",
];

/// Clock settings of the supervisor. Production values come from the
/// configuration; tests shrink them to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTiming {
    pub tick: Duration,
    pub stall_timeout: Duration,
    pub verify_attempts: u32,
    pub verify_initial_backoff: Duration,
    pub verify_max_backoff: Duration,
}

impl SupervisorTiming {
    pub fn from_config(config: &YoutubeConfig) -> Self {
        Self {
            tick: config.progress_tick(),
            stall_timeout: config.stall_timeout(),
            verify_attempts: 12,
            verify_initial_backoff: Duration::from_secs(15),
            verify_max_backoff: Duration::from_secs(60),
        }
    }

    fn verify_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.verify_initial_backoff
            .saturating_mul(factor)
            .min(self.verify_max_backoff)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    pub video_id: &'a str,
    /// Title from the channel listing, used when `info.json` has none.
    pub title_hint: Option<&'a str>,
    pub languages: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub video_path: PathBuf,
    pub has_1080p: bool,
    pub subtitle_paths: Vec<PathBuf>,
}

/// Result of one supervised download plus whether any strategy ran into bot
/// detection, which feeds the orchestrator's rest controller.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub result: PipelineResult<DownloadReport>,
    pub bot_detected: bool,
}

pub struct Supervisor {
    youtube: YoutubeConfig,
    auto_fix_overlap: bool,
    tools: Tools,
    strategies: Vec<Strategy>,
    timing: SupervisorTiming,
}

impl Supervisor {
    pub fn new(youtube: &YoutubeConfig, subtitles: &SubtitleConfig, tools: Tools) -> Self {
        Self {
            strategies: strategies(youtube),
            timing: SupervisorTiming::from_config(youtube),
            youtube: youtube.clone(),
            auto_fix_overlap: subtitles.auto_fix_overlap,
            tools,
        }
    }

    pub fn with_timing(mut self, timing: SupervisorTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Downloads one video into `dir` and records the verdict in
    /// `download_status.json`.
    pub async fn download(
        &self,
        dir: &Path,
        request: &DownloadRequest<'_>,
        cancel: &CancellationToken,
    ) -> DownloadOutcome {
        let mut bot_detected = false;
        if let Err(err) = mark_downloading(dir) {
            tracing::error!(video_id = request.video_id, error = %err, "cannot start download");
            return DownloadOutcome {
                result: Err(err),
                bot_detected,
            };
        }

        let max_attempts = self.youtube.max_stuck_retries.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self
                .run_strategies(dir, request, cancel, &mut bot_detected)
                .await
            {
                Ok((path, height)) => break self.finish(dir, request, path, height).await,
                Err(err) if err.is(ErrorKind::Stuck) && attempt < max_attempts => {
                    tracing::warn!(
                        video_id = request.video_id,
                        attempt,
                        max_attempts,
                        "download stuck, restarting strategy sequence"
                    );
                    if self.youtube.cleanup_partial_files_on_failure
                        && let Err(err) = cleanup_partial_files(dir)
                    {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err),
            }
        };

        let result = match result {
            Ok(report) => Ok(report),
            Err(err) => Err(self.record_failure(dir, request.video_id, err)),
        };
        DownloadOutcome {
            result,
            bot_detected,
        }
    }

    async fn run_strategies(
        &self,
        dir: &Path,
        request: &DownloadRequest<'_>,
        cancel: &CancellationToken,
        bot_detected: &mut bool,
    ) -> PipelineResult<(PathBuf, Option<u32>)> {
        let mut last_err = None;
        for (index, strategy) in self.strategies.iter().enumerate() {
            let strategy_number = index + 1;
            if !strategy.pre_sleep.is_zero() {
                sleep_or_cancel(strategy.pre_sleep, cancel).await?;
            }
            let args = build_download_args(
                &self.youtube,
                strategy,
                dir,
                request.video_id,
                request.languages,
                self.tools.has_transcoder(),
            );
            tracing::info!(
                video_id = request.video_id,
                strategy = strategy_number,
                client = strategy.player_client,
                cookies = strategy.include_cookies,
                "starting extractor"
            );
            let outcome = run_extractor(
                MonitorSettings {
                    program: &self.youtube.ytdlp_path,
                    args: &args,
                    dir,
                    tick: self.timing.tick,
                    stall_timeout: self.timing.stall_timeout,
                    video_id: request.video_id,
                    strategy: strategy_number,
                },
                cancel,
            )
            .await?;

            let err = match classify(&outcome) {
                None => {
                    let path = self.verify(dir, request.video_id, cancel).await?;
                    match self.resolution_gate(&path).await {
                        Ok(height) => return Ok((path, height)),
                        Err(err) => err,
                    }
                }
                Some(err) => err,
            };
            if err.is(ErrorKind::BotDetected) {
                *bot_detected = true;
            }
            tracing::warn!(
                video_id = request.video_id,
                strategy = strategy_number,
                client = strategy.player_client,
                cookies = strategy.include_cookies,
                exit_code = ?outcome.exit_code,
                kind = %err.kind,
                preview = err.preview.as_deref().unwrap_or_default(),
                "strategy failed"
            );
            if err.is(ErrorKind::Undownloadable) {
                return Err(err);
            }
            if err.is(ErrorKind::Stuck) && self.youtube.cleanup_partial_files_on_failure {
                cleanup_partial_files(dir)?;
            }
            last_err = Some(err);
        }

        match self.verify(dir, request.video_id, cancel).await {
            Ok(path) => {
                tracing::info!(video_id = request.video_id, path = %path.display(), "salvaged media file after strategy failures");
                let height = self.resolution_gate(&path).await?;
                Ok((path, height))
            }
            Err(verify_err) if verify_err.is(ErrorKind::Extractor) => {
                Err(last_err.unwrap_or(verify_err))
            }
            Err(verify_err) => Err(verify_err),
        }
    }

    /// Looks for the finished media file, waiting on partial files that are
    /// still growing.
    async fn verify(
        &self,
        dir: &Path,
        video_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<PathBuf> {
        if let Some(path) = find_video_file(dir)? {
            return Ok(path);
        }
        let no_media = || {
            PipelineError::new(
                ErrorKind::Extractor,
                COMPONENT,
                format!("no media file produced for {video_id}"),
            )
        };
        if !has_partial_files(dir)? {
            return Err(no_media());
        }
        let mut watch = ByteWatch::new(
            download_bytes(dir)?,
            Instant::now(),
            self.timing.stall_timeout,
        );
        for attempt in 0..self.timing.verify_attempts {
            let backoff = self.timing.verify_backoff(attempt);
            tracing::info!(video_id, attempt = attempt + 1, backoff_secs = backoff.as_secs_f64(), "waiting for partial files to settle");
            sleep_or_cancel(backoff, cancel).await?;
            if let Some(path) = find_video_file(dir)? {
                return Ok(path);
            }
            if !has_partial_files(dir)? {
                return Err(no_media());
            }
            if watch.observe(download_bytes(dir)?, Instant::now()) {
                return Err(PipelineError::new(
                    ErrorKind::Stuck,
                    COMPONENT,
                    format!("partial files for {video_id} stopped growing"),
                ));
            }
        }
        Err(PipelineError::new(
            ErrorKind::Stuck,
            COMPONENT,
            format!(
                "media for {video_id} still incomplete after {} checks",
                self.timing.verify_attempts
            ),
        ))
    }

    /// Height of the produced file from its name or a probe. A file below
    /// `min_height` is removed and fails the strategy that produced it; an
    /// unknown height passes.
    async fn resolution_gate(&self, video_path: &Path) -> PipelineResult<Option<u32>> {
        let height = match height_from_filename(video_path) {
            Some(height) => Some(height),
            None => self.tools.probe_height(video_path).await,
        };
        if let Some(height) = height
            && height < self.youtube.min_height
        {
            if let Err(err) = fs::remove_file(video_path) {
                tracing::warn!(path = %video_path.display(), error = %err, "could not remove low resolution file");
            }
            return Err(PipelineError::new(
                ErrorKind::Extractor,
                COMPONENT,
                format!(
                    "resolution {height}p below gate {}p",
                    self.youtube.min_height
                ),
            ));
        }
        Ok(height)
    }

    /// Subtitle post-processing and the `completed` record.
    async fn finish(
        &self,
        dir: &Path,
        request: &DownloadRequest<'_>,
        video_path: PathBuf,
        height: Option<u32>,
    ) -> PipelineResult<DownloadReport> {
        let has_1080p = height.is_some_and(|height| height >= 1080);

        let title = video_title(dir, request.video_id, request.title_hint);
        let subtitle_paths =
            match normalize_directory(dir, request.video_id, &title, self.auto_fix_overlap) {
                Ok(paths) => paths,
                Err(err) => {
                    tracing::warn!(video_id = request.video_id, error = %err, "subtitle post-processing failed");
                    Vec::new()
                }
            };

        // Leftover fragments would hide the completed record from later passes.
        cleanup_partial_files(dir)?;
        mark_downloaded(dir, &video_path, has_1080p, &subtitle_paths)?;
        tracing::info!(
            video_id = request.video_id,
            path = %video_path.display(),
            has_1080p,
            subtitles = subtitle_paths.len(),
            "download completed"
        );
        Ok(DownloadReport {
            video_path,
            has_1080p,
            subtitle_paths,
        })
    }

    fn record_failure(&self, dir: &Path, video_id: &str, err: PipelineError) -> PipelineError {
        tracing::error!(
            video_id,
            kind = %err.kind,
            error = %err,
            preview = err.preview.as_deref().unwrap_or_default(),
            "download failed"
        );
        let written = if err.is(ErrorKind::Undownloadable) {
            mark_undownloadable(dir, &err.message)
        } else {
            mark_download_failed(dir, &err.status_label())
        };
        if let Err(status_err) = written {
            tracing::warn!(video_id, error = %status_err, "could not record download failure");
        }
        err
    }
}

/// Maps a finished extractor run onto an error kind; `None` means a clean
/// exit that should go straight to verification.
pub fn classify(outcome: &RunOutcome) -> Option<PipelineError> {
    if outcome.stalled {
        return Some(
            PipelineError::new(ErrorKind::Stuck, COMPONENT, "no byte progress within stall window")
                .with_preview(tail(&outcome.output)),
        );
    }
    let has_error = outcome.has_error_line();
    if outcome.success && !has_error {
        return None;
    }
    let lower = outcome.output.to_lowercase();
    let first_error = outcome
        .output
        .lines()
        .find(|line| line.contains("ERROR:"))
        .map(str::trim);
    if BOT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(
            PipelineError::new(ErrorKind::BotDetected, COMPONENT, "extractor hit bot detection")
                .with_preview(first_error.unwrap_or_else(|| tail(&outcome.output))),
        );
    }
    if UNDOWNLOADABLE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        let message = first_error.unwrap_or("video is permanently unavailable");
        return Some(
            PipelineError::new(ErrorKind::Undownloadable, COMPONENT, message)
                .with_preview(tail(&outcome.output)),
        );
    }
    if let Some(line) = first_error {
        return Some(
            PipelineError::new(ErrorKind::Extractor, COMPONENT, line)
                .with_preview(tail(&outcome.output)),
        );
    }
    let code = outcome
        .exit_code
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    Some(
        PipelineError::new(
            ErrorKind::Transient,
            COMPONENT,
            format!("extractor exited with {code}"),
        )
        .with_preview(tail(&outcome.output)),
    )
}

/// Last few hundred bytes of output, where the interesting lines are.
fn tail(output: &str) -> &str {
    const TAIL_BYTES: usize = 1024;
    if output.len() <= TAIL_BYTES {
        return output;
    }
    let mut start = output.len() - TAIL_BYTES;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> PipelineResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(PipelineError::cancelled(COMPONENT)),
    }
}
