#![forbid(unsafe_code)]

//! Channel to video fan-out.
//!
//! One video is handled end to end at a time. In sync mode every video is
//! downloaded and published before the next one starts; batch mode runs the
//! whole download pass first and then uploads every completed download.
//! Failures of a single video are logged and the pass moves on; only
//! configuration errors and cancellation stop it.

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::channel::extract_videos;
use crate::config::{ChannelConfig, Config, RunMode};
use crate::download::{DownloadRequest, Supervisor};
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::quota::QuotaService;
use crate::rest::{RestController, RestPolicy};
use crate::tools::Tools;
use crate::upload::{UploadRequest, Uploader};
use crate::workdir::{
    VideoDescriptor, WorkTree, is_undownloadable, is_video_downloaded, is_video_uploaded,
    load_download_status, organize, video_description, video_title,
};

/// Counters of one orchestrator pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub downloaded: usize,
    pub download_failed: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub skipped: usize,
    /// The root scope was cancelled before the pass finished.
    pub interrupted: bool,
}

impl PassSummary {
    fn merge(&mut self, other: PassSummary) {
        self.downloaded += other.downloaded;
        self.download_failed += other.download_failed;
        self.uploaded += other.uploaded;
        self.upload_failed += other.upload_failed;
        self.skipped += other.skipped;
        self.interrupted |= other.interrupted;
    }
}

/// The `offset`/`limit` slice of a channel listing.
pub fn window<T>(items: &[T], offset: usize, limit: Option<usize>) -> &[T] {
    let start = offset.min(items.len());
    let end = match limit {
        Some(limit) => start.saturating_add(limit).min(items.len()),
        None => items.len(),
    };
    &items[start..end]
}

enum Flow {
    Continue,
    Stop,
}

/// Decides whether a per-video error ends the pass.
fn settle(
    result: PipelineResult<()>,
    video_id: &str,
    summary: &mut PassSummary,
) -> PipelineResult<Flow> {
    match result {
        Ok(()) => Ok(Flow::Continue),
        Err(err) if err.is(ErrorKind::Cancelled) => {
            summary.interrupted = true;
            Ok(Flow::Stop)
        }
        Err(err) if err.is(ErrorKind::Config) => Err(err),
        Err(err) => {
            tracing::warn!(video_id, kind = %err.kind, error = %err, "video failed, continuing with next video");
            Ok(Flow::Continue)
        }
    }
}

pub struct Orchestrator {
    config: Config,
    tree: WorkTree,
    supervisor: Supervisor,
    uploader: Uploader,
    quota: QuotaService,
    rest: RestController,
}

impl Orchestrator {
    pub fn new(config: Config, tools: Tools) -> PipelineResult<Self> {
        let tree = WorkTree::new(&config.output.directory);
        let quota = QuotaService::open(
            &tree,
            config.bilibili.account_names(),
            config.bilibili.daily_upload_limit,
        )?;
        Ok(Self {
            supervisor: Supervisor::new(&config.youtube, &config.subtitles, tools.clone()),
            uploader: Uploader::new(&config.bilibili, tools),
            rest: RestController::new(RestPolicy::from_config(&config.youtube)),
            quota,
            tree,
            config,
        })
    }

    pub fn tree(&self) -> &WorkTree {
        &self.tree
    }

    pub async fn run(
        &mut self,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> PipelineResult<PassSummary> {
        tracing::info!(?mode, channels = self.config.channels.len(), root = %self.tree.root().display(), "starting pass");
        let summary = match mode {
            RunMode::Sync => self.sync_channels(cancel).await?,
            RunMode::Batch => {
                let mut summary = self.download_channels(cancel).await?;
                if !summary.interrupted {
                    summary.merge(self.upload_all_channels(cancel).await?);
                }
                summary
            }
        };
        tracing::info!(
            downloaded = summary.downloaded,
            download_failed = summary.download_failed,
            uploaded = summary.uploaded,
            upload_failed = summary.upload_failed,
            skipped = summary.skipped,
            interrupted = summary.interrupted,
            "pass finished"
        );
        Ok(summary)
    }

    /// Rewrites `channel_info.json` for every configured channel. Returns the
    /// number of videos listed.
    pub async fn parse_channels(&self, cancel: &CancellationToken) -> PipelineResult<usize> {
        let mut total = 0;
        for channel in &self.config.channels {
            match self.channel_videos(channel, true, cancel).await {
                Ok(videos) => total += videos.len(),
                Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
                Err(err) => {
                    tracing::warn!(channel = %channel.url, error = %err, "channel listing failed, continuing with next channel");
                }
            }
        }
        Ok(total)
    }

    /// Offline compensator over every channel directory in the work tree.
    pub fn fix_download_status(&self) -> PipelineResult<usize> {
        let mut repaired = 0;
        for channel_id in self.tree.list_channel_ids()? {
            repaired += self.tree.repair_download_status(&channel_id)?;
        }
        tracing::info!(repaired, "download status compensator finished");
        Ok(repaired)
    }

    /// Download pass over every channel.
    pub async fn download_channels(
        &mut self,
        cancel: &CancellationToken,
    ) -> PipelineResult<PassSummary> {
        let mut summary = PassSummary::default();
        let channels = self.config.channels.clone();
        for channel in &channels {
            let Some(videos) = self
                .listing_or_skip(channel, self.config.youtube.refresh_channel_info, &mut summary, cancel)
                .await?
            else {
                if summary.interrupted {
                    break;
                }
                continue;
            };
            let channel_id = channel.channel_id();
            let mut pending = Vec::new();
            for video in window(&videos, channel.offset, channel.limit) {
                let dir = self.tree.video_dir(&channel_id, &video.id);
                match self.needs_download(&dir) {
                    Ok(true) => pending.push(video),
                    Ok(false) => summary.skipped += 1,
                    Err(err) => {
                        summary.skipped += 1;
                        tracing::warn!(video_id = %video.id, error = %err, "unreadable status, skipping video");
                    }
                }
            }
            let ids: Vec<String> = pending.iter().map(|video| video.id.clone()).collect();
            self.tree.save_pending_downloads(&channel_id, &ids)?;
            tracing::info!(channel = %channel_id, pending = ids.len(), "download pass");

            for video in pending {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                let result = self
                    .download_video(channel, video, &mut summary, cancel)
                    .await
                    .map(|_| ());
                if let Flow::Stop = settle(result, &video.id, &mut summary)? {
                    break;
                }
            }
            if summary.interrupted {
                break;
            }
        }
        Ok(summary)
    }

    /// Upload pass over every completed download, in listing order.
    pub async fn upload_all_channels(
        &self,
        cancel: &CancellationToken,
    ) -> PipelineResult<PassSummary> {
        let mut summary = PassSummary::default();
        let channels = self.config.channels.clone();
        'channels: for channel in &channels {
            let channel_id = channel.channel_id();
            let listed = self.tree.load_channel_info(&channel_id)?;
            let candidates: Vec<(PathBuf, String, Option<&VideoDescriptor>)> = if listed.is_empty() {
                let dirs = self.tree.list_video_dirs(&channel_id)?;
                window(&dirs, channel.offset, channel.limit)
                    .iter()
                    .filter_map(|dir| {
                        let id = dir.file_name()?.to_string_lossy().into_owned();
                        Some((dir.clone(), id, None))
                    })
                    .collect()
            } else {
                window(&listed, channel.offset, channel.limit)
                    .iter()
                    .map(|video| {
                        (
                            self.tree.video_dir(&channel_id, &video.id),
                            video.id.clone(),
                            Some(video),
                        )
                    })
                    .collect()
            };

            for (dir, video_id, video) in candidates {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break 'channels;
                }
                let result = self
                    .upload_video(channel, &dir, &video_id, video, &mut summary, cancel)
                    .await;
                if let Flow::Stop = settle(result, &video_id, &mut summary)? {
                    break 'channels;
                }
            }
        }
        Ok(summary)
    }

    /// Per video: download unless present, then publish before moving on.
    pub async fn sync_channels(
        &mut self,
        cancel: &CancellationToken,
    ) -> PipelineResult<PassSummary> {
        let mut summary = PassSummary::default();
        let channels = self.config.channels.clone();
        for channel in &channels {
            let Some(videos) = self
                .listing_or_skip(channel, self.config.youtube.refresh_channel_info, &mut summary, cancel)
                .await?
            else {
                if summary.interrupted {
                    break;
                }
                continue;
            };
            for video in window(&videos, channel.offset, channel.limit) {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                let result = self.sync_video(channel, video, &mut summary, cancel).await;
                if let Flow::Stop = settle(result, &video.id, &mut summary)? {
                    break;
                }
            }
            if summary.interrupted {
                break;
            }
        }
        Ok(summary)
    }

    async fn sync_video(
        &mut self,
        channel: &ChannelConfig,
        video: &VideoDescriptor,
        summary: &mut PassSummary,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let dir = self.tree.video_dir(&channel.channel_id(), &video.id);
        if is_video_uploaded(&dir)? {
            summary.skipped += 1;
            return Ok(());
        }
        if !is_video_downloaded(&dir)? {
            if self.skip_undownloadable(&dir)? {
                summary.skipped += 1;
                return Ok(());
            }
            if !self.download_video(channel, video, summary, cancel).await? {
                return Ok(());
            }
        }
        self.upload_video(channel, &dir, &video.id, Some(video), summary, cancel)
            .await
    }

    fn needs_download(&self, dir: &Path) -> PipelineResult<bool> {
        Ok(!is_video_uploaded(dir)?
            && !is_video_downloaded(dir)?
            && !self.skip_undownloadable(dir)?)
    }

    fn skip_undownloadable(&self, dir: &Path) -> PipelineResult<bool> {
        if self.config.youtube.force_download_undownloadable {
            return Ok(false);
        }
        let skip = is_undownloadable(dir)?;
        if skip {
            tracing::debug!(dir = %dir.display(), "skipping undownloadable video");
        }
        Ok(skip)
    }

    /// Cached listing unless a refresh is requested; a failed refresh falls
    /// back to the cache when there is one.
    async fn channel_videos(
        &self,
        channel: &ChannelConfig,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<VideoDescriptor>> {
        let channel_id = channel.channel_id();
        let cached = self.tree.load_channel_info(&channel_id)?;
        if !refresh && !cached.is_empty() {
            return Ok(cached);
        }
        match extract_videos(&self.config.youtube, &channel.url, &channel_id, cancel).await {
            Ok(videos) => {
                self.tree.save_channel_info(&channel_id, &videos)?;
                Ok(videos)
            }
            Err(err) if err.is(ErrorKind::Cancelled) || cached.is_empty() => Err(err),
            Err(err) => {
                tracing::warn!(channel = %channel_id, error = %err, cached = cached.len(), "listing refresh failed, using cached channel_info.json");
                Ok(cached)
            }
        }
    }

    async fn listing_or_skip(
        &self,
        channel: &ChannelConfig,
        refresh: bool,
        summary: &mut PassSummary,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<Vec<VideoDescriptor>>> {
        match self.channel_videos(channel, refresh, cancel).await {
            Ok(videos) => Ok(Some(videos)),
            Err(err) if err.is(ErrorKind::Cancelled) => {
                summary.interrupted = true;
                Ok(None)
            }
            Err(err) if err.is(ErrorKind::Config) => Err(err),
            Err(err) => {
                tracing::warn!(channel = %channel.url, kind = %err.kind, error = %err, "channel skipped, continuing with next channel");
                Ok(None)
            }
        }
    }

    /// Runs the supervisor for one video and feeds the rest controller.
    /// Returns whether the download completed.
    async fn download_video(
        &mut self,
        channel: &ChannelConfig,
        video: &VideoDescriptor,
        summary: &mut PassSummary,
        cancel: &CancellationToken,
    ) -> PipelineResult<bool> {
        let dir = self.tree.ensure_video_dir(&channel.channel_id(), &video.id)?;
        let languages = channel
            .languages
            .as_deref()
            .unwrap_or(&self.config.youtube.subtitle_languages);
        let request = DownloadRequest {
            video_id: &video.id,
            title_hint: Some(&video.title),
            languages,
        };
        let outcome = self.supervisor.download(&dir, &request, cancel).await;
        let succeeded = match outcome.result {
            Ok(_) => {
                summary.downloaded += 1;
                true
            }
            Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
            Err(err) => {
                summary.download_failed += 1;
                tracing::warn!(video_id = %video.id, kind = %err.kind, "download failed, continuing with next video");
                false
            }
        };
        self.rest
            .after_download(succeeded, outcome.bot_detected, cancel)
            .await?;
        Ok(succeeded)
    }

    /// Publishes one completed download on an account with quota left.
    async fn upload_video(
        &self,
        channel: &ChannelConfig,
        dir: &Path,
        video_id: &str,
        listed: Option<&VideoDescriptor>,
        summary: &mut PassSummary,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        if is_video_uploaded(dir)? || !is_video_downloaded(dir)? {
            summary.skipped += 1;
            return Ok(());
        }
        let status = load_download_status(dir)?.ok_or_else(|| {
            PipelineError::new(
                ErrorKind::Storage,
                "orchestrator",
                format!("download status vanished in {}", dir.display()),
            )
        })?;
        let video_path = status.video_path.map(PathBuf::from);
        let subtitle_paths: Vec<PathBuf> =
            status.subtitle_paths.into_iter().map(PathBuf::from).collect();
        let title = video_title(dir, video_id, listed.map(|video| video.title.as_str()));
        let description = video_description(
            dir,
            video_id,
            listed.and_then(|video| video.description.as_deref()),
        );

        let account = self.quota.acquire(channel.account.as_deref(), cancel).await?;
        let request = UploadRequest {
            dir,
            video_path: video_path.as_deref(),
            title: &title,
            description: &description,
            subtitle_paths: &subtitle_paths,
            account: &account,
        };
        match self.uploader.upload(&request, cancel).await {
            Ok(aid) => {
                summary.uploaded += 1;
                let count = self.quota.record_success(&account)?;
                tracing::info!(video_id, account = %account, aid = %aid, daily_count = count, "upload counted");
                match organize(dir, self.config.bilibili.delete_original_after_upload) {
                    Ok(Some(removed)) => {
                        tracing::info!(video_id, path = %removed.display(), "removed uploaded media file");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(video_id, error = %err, "post-upload housekeeping failed");
                    }
                }
                Ok(())
            }
            Err(err) if err.is(ErrorKind::Cancelled) => Err(err),
            Err(err) => {
                summary.upload_failed += 1;
                tracing::warn!(video_id, account = %account, kind = %err.kind, "upload failed, continuing with next video");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::YoutubeConfig;
    use crate::testutil::install_script;
    use crate::workdir::{
        DownloadState, UploadState, load_upload_status, mark_download_failed, mark_downloading,
        mark_undownloadable, mark_uploaded,
    };
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const CHANNEL_URL: &str = "https://www.youtube.com/@Chan";

    /// Lists three videos in flat-playlist mode; otherwise writes a media file
    /// and a cover into the directory of the first `-o` template.
    const FAKE_EXTRACTOR: &str = r#"log="$(dirname "$0")/downloads"
if [[ " $* " == *" --flat-playlist "* ]]; then
  echo '{"_type":"url","id":"vid00000001","title":"First"}'
  echo '{"_type":"url","id":"vid00000002","title":"Second"}'
  echo '{"_type":"url","id":"vid00000003","title":"Third"}'
  exit 0
fi
out=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o)
      shift
      if [[ -z "$out" ]]; then out="$1"; fi
      ;;
  esac
  shift
done
dir="$(dirname "$out")"
id="$(basename "$dir")"
echo "$id" >> "$log"
printf 'media' > "$dir/${id}_1080p.mp4"
printf 'jpeg' > "$dir/${id}.jpg"
"#;

    fn config(temp: &TempDir, configure: impl FnOnce(&mut Config)) -> Config {
        let script = install_script(temp.path(), "yt-dlp", FAKE_EXTRACTOR);
        let mut config = Config {
            youtube: YoutubeConfig {
                ytdlp_path: script,
                video_limit_before_rest: 0,
                bot_detection_threshold: 0,
                ..YoutubeConfig::default()
            },
            channels: vec![ChannelConfig {
                url: CHANNEL_URL.to_string(),
                ..ChannelConfig::default()
            }],
            ..Config::default()
        };
        config.output.directory = temp.path().join("out");
        configure(&mut config);
        config
    }

    fn downloads_log(temp: &TempDir) -> Vec<String> {
        fs::read_to_string(temp.path().join("downloads"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn window_clamps_offset_and_limit() {
        let items = [1, 2, 3, 4, 5];
        assert_eq!(window(&items, 0, None), &[1, 2, 3, 4, 5]);
        assert_eq!(window(&items, 1, Some(2)), &[2, 3]);
        assert_eq!(window(&items, 4, Some(10)), &[5]);
        assert!(window(&items, 9, None).is_empty());
        assert!(window(&items, 0, Some(0)).is_empty());
    }

    #[tokio::test]
    async fn sync_mode_downloads_then_keeps_going_after_upload_failures() {
        let temp = tempdir().unwrap();
        let config = config(&temp, |config| config.channels[0].limit = Some(2));
        let mut orchestrator = Orchestrator::new(config, Tools::none()).unwrap();
        let summary = orchestrator
            .run(RunMode::Sync, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.upload_failed, 2);
        assert_eq!(summary.uploaded, 0);
        assert!(!summary.interrupted);
        assert_eq!(downloads_log(&temp), vec!["vid00000001", "vid00000002"]);

        let tree = orchestrator.tree();
        assert_eq!(tree.load_channel_info("Chan").unwrap().len(), 3);
        for id in ["vid00000001", "vid00000002"] {
            let dir = tree.video_dir("Chan", id);
            let download = load_download_status(&dir).unwrap().unwrap();
            assert_eq!(download.status, DownloadState::Completed);
            assert!(download.has_1080p);
            let upload = load_upload_status(&dir).unwrap().unwrap();
            assert_eq!(upload.status, UploadState::Failed);
            assert_eq!(upload.account.as_deref(), Some("default"));
        }
        assert!(!tree.video_dir("Chan", "vid00000003").exists());
    }

    #[tokio::test]
    async fn download_pass_honours_skip_rules() {
        let temp = tempdir().unwrap();
        let tree = WorkTree::new(temp.path().join("out"));
        let uploaded = tree.ensure_video_dir("Chan", "vid00000001").unwrap();
        mark_uploaded(&uploaded, "av1", "default").unwrap();
        let broken = tree.ensure_video_dir("Chan", "vid00000002").unwrap();
        mark_downloading(&broken).unwrap();
        mark_undownloadable(&broken, "Private video").unwrap();

        let mut orchestrator =
            Orchestrator::new(config(&temp, |_| {}), Tools::none()).unwrap();
        let summary = orchestrator
            .download_channels(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(downloads_log(&temp), vec!["vid00000003"]);
        let pending: Vec<String> = serde_json::from_slice(
            &fs::read(tree.channel_dir("Chan").join("pending_downloads.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(pending, vec!["vid00000003"]);

        let mut forced = Orchestrator::new(
            config(&temp, |config| config.youtube.force_download_undownloadable = true),
            Tools::none(),
        )
        .unwrap();
        let summary = forced
            .download_channels(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(downloads_log(&temp), vec!["vid00000003", "vid00000002"]);
        assert_eq!(
            load_download_status(&broken).unwrap().unwrap().status,
            DownloadState::Completed
        );
    }

    #[tokio::test]
    async fn cancelled_scope_stops_before_any_video() {
        let temp = tempdir().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&temp, |_| {}), Tools::none()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orchestrator.run(RunMode::Batch, &cancel).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.downloaded, 0);
        assert!(downloads_log(&temp).is_empty());
    }

    #[tokio::test]
    async fn upload_pass_skips_incomplete_downloads() {
        let temp = tempdir().unwrap();
        let tree = WorkTree::new(temp.path().join("out"));
        let failed = tree.ensure_video_dir("Chan", "vid00000001").unwrap();
        mark_downloading(&failed).unwrap();
        mark_download_failed(&failed, "stuck").unwrap();

        let orchestrator = Orchestrator::new(config(&temp, |_| {}), Tools::none()).unwrap();
        let summary = orchestrator
            .upload_all_channels(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.upload_failed, 0);
        assert!(load_upload_status(&failed).unwrap().is_none());
    }

    #[test]
    fn compensator_walks_every_channel() {
        let temp = tempdir().unwrap();
        let tree = WorkTree::new(temp.path().join("out"));
        for channel in ["alpha", "beta"] {
            let dir = tree.ensure_video_dir(channel, "vid00000001").unwrap();
            mark_downloading(&dir).unwrap();
            mark_uploaded(&dir, "av9", "default").unwrap();
        }
        let orchestrator = Orchestrator::new(config(&temp, |_| {}), Tools::none()).unwrap();
        assert_eq!(orchestrator.fix_download_status().unwrap(), 2);
        assert_eq!(orchestrator.fix_download_status().unwrap(), 0);
    }
}
