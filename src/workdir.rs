#![forbid(unsafe_code)]

//! Work tree repository: the only code that reads or writes under the
//! configured output directory.
//!
//! Layout:
//!
//! ```text
//! {root}/
//!   .global/upload_quota.json
//!   {channel_id}/
//!     channel_info.json
//!     pending_downloads.json
//!     {video_id}/
//!       {video_id}_1080p.mp4, {video_id}.jpg, {video_id}.info.json, ...
//!       download_status.json, upload_status.json, .organized
//! ```
//!
//! Status documents are replaced through a temp file plus rename, so a crash
//! mid-write leaves either the old or the new JSON, never a truncated one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::{ErrorKind, PipelineError, PipelineResult};

const COMPONENT: &str = "workdir";

pub const GLOBAL_DIR: &str = ".global";
pub const CHANNEL_INFO_FILE: &str = "channel_info.json";
pub const PENDING_DOWNLOADS_FILE: &str = "pending_downloads.json";
pub const DOWNLOAD_STATUS_FILE: &str = "download_status.json";
pub const UPLOAD_STATUS_FILE: &str = "upload_status.json";
pub const ORGANIZED_MARKER: &str = ".organized";

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm"];
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl"];
const DOWNLOAD_BYTE_EXTENSIONS: &[&str] = &["part", "mp4", "m4a", "webm", "mkv", "ytdl"];

/// Longest filename most filesystems accept, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// One entry of `channel_info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: String,
    pub title: String,
    pub url: String,
    pub playlist_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Downloading,
    Completed,
    Failed,
    Undownloadable,
}

impl DownloadState {
    /// Edges of the download state machine. `None` is the absent file.
    pub fn can_transition(from: Option<DownloadState>, to: DownloadState) -> bool {
        use DownloadState::*;
        match (from, to) {
            (None, Downloading) => true,
            (Some(Downloading | Failed | Undownloadable), Downloading) => true,
            (Some(Downloading), Completed | Failed | Undownloadable) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub status: DownloadState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub has_1080p: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitle_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub status: UploadState,
    #[serde(default)]
    pub bilibili_aid: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Handle on the work tree root.
#[derive(Debug, Clone)]
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn global_dir(&self) -> PathBuf {
        self.root.join(GLOBAL_DIR)
    }

    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.root.join(channel_id)
    }

    pub fn video_dir(&self, channel_id: &str, video_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(video_id)
    }

    /// Creates `{root}/{channel}/{video}/` (mode 0755). Idempotent.
    pub fn ensure_video_dir(&self, channel_id: &str, video_id: &str) -> PipelineResult<PathBuf> {
        let dir = self.video_dir(channel_id, video_id);
        create_dir_all_0755(&dir)?;
        Ok(dir)
    }

    pub fn load_channel_info(&self, channel_id: &str) -> PipelineResult<Vec<VideoDescriptor>> {
        let path = self.channel_dir(channel_id).join(CHANNEL_INFO_FILE);
        Ok(read_json(&path)?.unwrap_or_default())
    }

    /// Replaces the whole channel listing.
    pub fn save_channel_info(
        &self,
        channel_id: &str,
        videos: &[VideoDescriptor],
    ) -> PipelineResult<()> {
        let path = self.channel_dir(channel_id).join(CHANNEL_INFO_FILE);
        write_json_atomic(&path, &videos)
    }

    pub fn save_pending_downloads(&self, channel_id: &str, ids: &[String]) -> PipelineResult<()> {
        let path = self.channel_dir(channel_id).join(PENDING_DOWNLOADS_FILE);
        write_json_atomic(&path, &ids)
    }

    /// Video directories below a channel, sorted by name.
    pub fn list_video_dirs(&self, channel_id: &str) -> PipelineResult<Vec<PathBuf>> {
        visible_subdirs(&self.channel_dir(channel_id))
    }

    /// Channel directories present under the root, `.global` excluded.
    pub fn list_channel_ids(&self) -> PipelineResult<Vec<String>> {
        Ok(visible_subdirs(&self.root)?
            .into_iter()
            .filter_map(|dir| {
                dir.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect())
    }

    /// Offline compensator: a completed upload implies a completed download.
    /// Returns how many directories were rewritten.
    pub fn repair_download_status(&self, channel_id: &str) -> PipelineResult<usize> {
        let mut repaired = 0;
        for dir in self.list_video_dirs(channel_id)? {
            if !is_video_uploaded(&dir)? {
                continue;
            }
            let current = load_download_status(&dir)?;
            if current
                .as_ref()
                .is_some_and(|status| status.status == DownloadState::Completed)
            {
                continue;
            }
            let video_path = find_video_file(&dir)?;
            let has_1080p = video_path
                .as_deref()
                .and_then(height_from_filename)
                .is_some_and(|height| height >= 1080);
            let now = Utc::now();
            let status = DownloadStatus {
                status: DownloadState::Completed,
                started_at: current.as_ref().and_then(|s| s.started_at).or(Some(now)),
                completed_at: Some(now),
                last_error: None,
                video_path: video_path.map(|p| p.to_string_lossy().into_owned()),
                has_1080p,
                subtitle_paths: Vec::new(),
            };
            write_json_atomic(&dir.join(DOWNLOAD_STATUS_FILE), &status)?;
            tracing::info!(dir = %dir.display(), "repaired download status after completed upload");
            repaired += 1;
        }
        Ok(repaired)
    }
}

/// Immediate subdirectories of `parent` whose names do not start with a dot.
fn visible_subdirs(parent: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !parent.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in WalkDir::new(parent).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(parent).to_path_buf();
            let io_err = err
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("directory walk failed"));
            PipelineError::storage(COMPONENT, &path, io_err)
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        dirs.push(entry.into_path());
    }
    dirs.sort();
    Ok(dirs)
}

fn create_dir_all_0755(dir: &Path) -> PipelineResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(dir)
        .map_err(|err| PipelineError::storage(COMPONENT, dir, err))
}

/// Writes `contents` next to `path` and renames it into place.
pub fn write_bytes_atomic(path: &Path, contents: &[u8]) -> PipelineResult<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    create_dir_all_0755(parent)?;
    let storage = |err: io::Error| PipelineError::storage(COMPONENT, path, err);
    let mut tmp = NamedTempFile::new_in(parent).map_err(storage)?;
    tmp.write_all(contents).map_err(storage)?;
    tmp.as_file().sync_all().map_err(storage)?;
    tmp.persist(path).map_err(|err| storage(err.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<()> {
    let mut payload = serde_json::to_vec_pretty(value)
        .map_err(|err| PipelineError::storage(COMPONENT, path, io::Error::from(err)))?;
    payload.push(b'\n');
    write_bytes_atomic(path, &payload)
}

/// Reads a JSON document, treating a missing file as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PipelineError::storage(COMPONENT, path, err)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| PipelineError::storage(COMPONENT, path, io::Error::from(err)))
}

fn sorted_file_names(dir: &Path) -> PipelineResult<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(PipelineError::storage(COMPONENT, dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::storage(COMPONENT, dir, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| PipelineError::storage(COMPONENT, &entry.path(), err))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push((name, entry.path()));
    }
    files.sort();
    Ok(files)
}

fn extension_of(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

fn is_partial_name(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext))
        || name.contains(".part-Frag")
}

/// `{id}_{height}p.{mp4,mkv,webm}`; intermediate `.fNNN` streams do not match.
pub fn is_media_file_name(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if !VIDEO_EXTENSIONS.contains(&ext) || is_partial_name(name) {
        return false;
    }
    match stem.rsplit_once('_') {
        Some((id, suffix)) => !id.is_empty() && suffix.len() > 1 && suffix.ends_with('p'),
        None => false,
    }
}

/// First file matching `*_*p.{mp4,mkv,webm}`, ignoring partial downloads.
pub fn find_video_file(dir: &Path) -> PipelineResult<Option<PathBuf>> {
    Ok(sorted_file_names(dir)?
        .into_iter()
        .find(|(name, _)| is_media_file_name(name))
        .map(|(_, path)| path))
}

/// Any `.mp4/.mkv/.webm` at all, used when the canonical name is missing.
pub fn find_any_video_file(dir: &Path) -> PipelineResult<Option<PathBuf>> {
    Ok(sorted_file_names(dir)?
        .into_iter()
        .find(|(name, _)| {
            !is_partial_name(name)
                && extension_of(name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext))
        })
        .map(|(_, path)| path))
}

/// Parses the `_1080p` suffix of a media filename.
pub fn height_from_filename(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let (_, suffix) = stem.rsplit_once('_')?;
    suffix.strip_suffix('p')?.parse().ok()
}

/// `*.srt` and `*.vtt`, excluding backups and `.frame.srt` files.
pub fn find_subtitle_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    Ok(sorted_file_names(dir)?
        .into_iter()
        .filter(|(name, _)| {
            matches!(extension_of(name), Some("srt" | "vtt")) && !name.ends_with(".frame.srt")
        })
        .map(|(_, path)| path)
        .collect())
}

pub fn has_partial_files(dir: &Path) -> PipelineResult<bool> {
    Ok(sorted_file_names(dir)?
        .iter()
        .any(|(name, _)| is_partial_name(name)))
}

/// Deletes `*.part` and `*.ytdl`. Returns the number of files removed.
pub fn cleanup_partial_files(dir: &Path) -> PipelineResult<usize> {
    let mut removed = 0;
    for (name, path) in sorted_file_names(dir)? {
        if !is_partial_name(&name) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(PipelineError::storage(COMPONENT, &path, err)),
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "removed partial download files");
    }
    Ok(removed)
}

/// Aggregate size of everything a running download can grow.
pub fn download_bytes(dir: &Path) -> PipelineResult<u64> {
    let mut total = 0;
    for (name, path) in sorted_file_names(dir)? {
        let counted = name.contains(".part")
            || extension_of(&name).is_some_and(|ext| DOWNLOAD_BYTE_EXTENSIONS.contains(&ext));
        if !counted {
            continue;
        }
        match fs::metadata(&path) {
            Ok(meta) => total += meta.len(),
            // Files come and go while the extractor renames fragments.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(PipelineError::storage(COMPONENT, &path, err)),
        }
    }
    Ok(total)
}

pub fn load_download_status(dir: &Path) -> PipelineResult<Option<DownloadStatus>> {
    read_json(&dir.join(DOWNLOAD_STATUS_FILE))
}

pub fn load_upload_status(dir: &Path) -> PipelineResult<Option<UploadStatus>> {
    read_json(&dir.join(UPLOAD_STATUS_FILE))
}

/// Completed status and no partial files lying around.
pub fn is_video_downloaded(dir: &Path) -> PipelineResult<bool> {
    let completed = load_download_status(dir)?
        .is_some_and(|status| status.status == DownloadState::Completed);
    Ok(completed && !has_partial_files(dir)?)
}

pub fn is_video_uploaded(dir: &Path) -> PipelineResult<bool> {
    Ok(load_upload_status(dir)?.is_some_and(|status| status.status == UploadState::Completed))
}

pub fn is_undownloadable(dir: &Path) -> PipelineResult<bool> {
    Ok(load_download_status(dir)?
        .is_some_and(|status| status.status == DownloadState::Undownloadable))
}

fn transition_download(
    dir: &Path,
    to: DownloadState,
    apply: impl FnOnce(Option<DownloadStatus>) -> DownloadStatus,
) -> PipelineResult<DownloadStatus> {
    let current = load_download_status(dir)?;
    let from = current.as_ref().map(|status| status.status);
    if !DownloadState::can_transition(from, to) {
        return Err(PipelineError::new(
            ErrorKind::Storage,
            COMPONENT,
            format!(
                "refusing download status transition {from:?} -> {to:?} in {}",
                dir.display()
            ),
        ));
    }
    let next = apply(current);
    write_json_atomic(&dir.join(DOWNLOAD_STATUS_FILE), &next)?;
    Ok(next)
}

pub fn mark_downloading(dir: &Path) -> PipelineResult<DownloadStatus> {
    transition_download(dir, DownloadState::Downloading, |_| DownloadStatus {
        status: DownloadState::Downloading,
        started_at: Some(Utc::now()),
        completed_at: None,
        last_error: None,
        video_path: None,
        has_1080p: false,
        subtitle_paths: Vec::new(),
    })
}

pub fn mark_downloaded(
    dir: &Path,
    video_path: &Path,
    has_1080p: bool,
    subtitle_paths: &[PathBuf],
) -> PipelineResult<DownloadStatus> {
    transition_download(dir, DownloadState::Completed, |current| DownloadStatus {
        status: DownloadState::Completed,
        started_at: current.and_then(|status| status.started_at),
        completed_at: Some(Utc::now()),
        last_error: None,
        video_path: Some(video_path.to_string_lossy().into_owned()),
        has_1080p,
        subtitle_paths: subtitle_paths
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect(),
    })
}

pub fn mark_download_failed(dir: &Path, error: &str) -> PipelineResult<DownloadStatus> {
    transition_download(dir, DownloadState::Failed, |current| DownloadStatus {
        status: DownloadState::Failed,
        started_at: current.and_then(|status| status.started_at),
        completed_at: None,
        last_error: Some(error.to_string()),
        video_path: None,
        has_1080p: false,
        subtitle_paths: Vec::new(),
    })
}

pub fn mark_undownloadable(dir: &Path, reason: &str) -> PipelineResult<DownloadStatus> {
    transition_download(dir, DownloadState::Undownloadable, |current| DownloadStatus {
        status: DownloadState::Undownloadable,
        started_at: current.and_then(|status| status.started_at),
        completed_at: None,
        last_error: Some(reason.to_string()),
        video_path: None,
        has_1080p: false,
        subtitle_paths: Vec::new(),
    })
}

pub fn mark_uploading(dir: &Path, account: &str) -> PipelineResult<UploadStatus> {
    let status = UploadStatus {
        status: UploadState::Uploading,
        bilibili_aid: None,
        account: Some(account.to_string()),
        started_at: Some(Utc::now()),
        completed_at: None,
        last_error: None,
    };
    write_json_atomic(&dir.join(UPLOAD_STATUS_FILE), &status)?;
    Ok(status)
}

pub fn mark_uploaded(dir: &Path, aid: &str, account: &str) -> PipelineResult<UploadStatus> {
    let started_at = load_upload_status(dir)?.and_then(|status| status.started_at);
    let status = UploadStatus {
        status: UploadState::Completed,
        bilibili_aid: Some(aid.to_string()),
        account: Some(account.to_string()),
        started_at,
        completed_at: Some(Utc::now()),
        last_error: None,
    };
    write_json_atomic(&dir.join(UPLOAD_STATUS_FILE), &status)?;
    Ok(status)
}

pub fn mark_upload_failed(dir: &Path, account: &str, error: &str) -> PipelineResult<UploadStatus> {
    let started_at = load_upload_status(dir)?.and_then(|status| status.started_at);
    let status = UploadStatus {
        status: UploadState::Failed,
        bilibili_aid: None,
        account: Some(account.to_string()),
        started_at,
        completed_at: None,
        last_error: Some(error.to_string()),
    };
    write_json_atomic(&dir.join(UPLOAD_STATUS_FILE), &status)?;
    Ok(status)
}

pub fn mark_organized(dir: &Path) -> PipelineResult<()> {
    let path = dir.join(ORGANIZED_MARKER);
    fs::write(&path, Utc::now().to_rfc3339())
        .map_err(|err| PipelineError::storage(COMPONENT, &path, err))
}

pub fn is_organized(dir: &Path) -> bool {
    dir.join(ORGANIZED_MARKER).exists()
}

/// Post-publish housekeeping: drops the `.organized` sentinel and, when
/// asked, deletes the media file. Returns the deleted path.
pub fn organize(dir: &Path, delete_media: bool) -> PipelineResult<Option<PathBuf>> {
    let mut removed = None;
    if delete_media && let Some(path) = find_video_file(dir)? {
        fs::remove_file(&path).map_err(|err| PipelineError::storage(COMPONENT, &path, err))?;
        removed = Some(path);
    }
    mark_organized(dir)?;
    Ok(removed)
}

/// Contents of `{id}.description`, else `fallback`, else empty.
pub fn video_description(dir: &Path, video_id: &str, fallback: Option<&str>) -> String {
    let path = dir.join(format!("{video_id}.description"));
    match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not read description");
        }
    }
    fallback.unwrap_or_default().trim().to_string()
}

#[derive(Deserialize)]
struct InfoTitle {
    fulltitle: Option<String>,
    title: Option<String>,
}

/// Title from `{id}.info.json`, else `fallback`, else the id itself.
pub fn video_title(dir: &Path, video_id: &str, fallback: Option<&str>) -> String {
    let info_path = dir.join(format!("{video_id}.info.json"));
    let from_info = match read_json::<InfoTitle>(&info_path) {
        Ok(Some(info)) => info.fulltitle.or(info.title),
        Ok(None) => None,
        Err(err) => {
            tracing::warn!(path = %info_path.display(), error = %err, "could not read info.json title");
            None
        }
    };
    from_info
        .or_else(|| fallback.map(str::to_string))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| video_id.to_string())
}

fn is_hostile_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\')
        || (c as u32) < 0x20
        || c == '\u{7f}'
        || c == char::REPLACEMENT_CHARACTER
}

/// Replaces path-hostile characters with `_`. CJK and other printable
/// characters pass through untouched.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if is_hostile_char(c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Same as [`sanitize_title`] for raw bytes; invalid UTF-8 becomes `_`.
pub fn sanitize_title_bytes(raw: &[u8]) -> String {
    sanitize_title(&String::from_utf8_lossy(raw))
}

/// Shortens `title` so `{title}[{id}].{lang}.{ext}` fits in 255 bytes, never
/// splitting a code point.
pub fn truncate_title_for_filename(title: &str, video_id: &str, lang: &str, ext: &str) -> String {
    let suffix_len = video_id.len() + lang.len() + ext.len() + "[].".len() + ".".len();
    let budget = MAX_FILENAME_BYTES.saturating_sub(suffix_len);
    if title.len() <= budget {
        return title.to_string();
    }
    let mut cut = budget;
    while cut > 0 && !title.is_char_boundary(cut) {
        cut -= 1;
    }
    title[..cut].trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn ensure_video_dir_is_idempotent() -> PipelineResult<()> {
        let root = tempdir().unwrap();
        let tree = WorkTree::new(root.path());
        let first = tree.ensure_video_dir("chan", "abcdefghijk")?;
        let second = tree.ensure_video_dir("chan", "abcdefghijk")?;
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(first, root.path().join("chan").join("abcdefghijk"));
        Ok(())
    }

    #[test]
    fn find_video_file_ignores_partials_and_streams() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        touch(dir.path(), "abc_1080p.mp4.part", 10);
        touch(dir.path(), "abc_1080p.f137.mp4", 10);
        touch(dir.path(), "abc.ytdl", 1);
        assert_eq!(find_video_file(dir.path())?, None);

        let media = touch(dir.path(), "abc_1080p.mp4", 10);
        assert_eq!(find_video_file(dir.path())?, Some(media.clone()));
        assert_eq!(height_from_filename(&media), Some(1080));
        assert_eq!(height_from_filename(Path::new("x_NAp.mp4")), None);
        Ok(())
    }

    #[test]
    fn subtitle_listing_skips_backups_and_frames() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        touch(dir.path(), "abc.en.srt", 1);
        touch(dir.path(), "abc.ja.vtt", 1);
        touch(dir.path(), "abc.en.srt.backup", 1);
        touch(dir.path(), "abc.frame.srt", 1);
        touch(dir.path(), "abc.info.json", 1);
        let subs = find_subtitle_files(dir.path())?;
        let names: Vec<_> = subs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["abc.en.srt", "abc.ja.vtt"]);
        Ok(())
    }

    #[test]
    fn partial_detection_and_cleanup() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        touch(dir.path(), "abc_1080p.mp4.part", 100);
        touch(dir.path(), "abc_1080p.mp4.ytdl", 5);
        touch(dir.path(), "abc.jpg", 7);
        assert!(has_partial_files(dir.path())?);
        assert_eq!(download_bytes(dir.path())?, 105);

        assert_eq!(cleanup_partial_files(dir.path())?, 2);
        assert!(!has_partial_files(dir.path())?);
        assert!(dir.path().join("abc.jpg").exists());
        assert_eq!(download_bytes(dir.path())?, 0);
        Ok(())
    }

    #[test]
    fn download_status_follows_the_state_machine() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        assert!(mark_download_failed(dir.path(), "early").is_err());

        mark_downloading(dir.path())?;
        let media = touch(dir.path(), "abc_1080p.mp4", 10);
        let done = mark_downloaded(dir.path(), &media, true, &[])?;
        assert_eq!(done.status, DownloadState::Completed);
        assert!(done.has_1080p);
        assert!(done.started_at.is_some());
        assert!(is_video_downloaded(dir.path())?);

        let err = mark_downloading(dir.path()).unwrap_err();
        assert!(err.is(ErrorKind::Storage));
        assert_eq!(
            load_download_status(dir.path())?.unwrap().status,
            DownloadState::Completed
        );
        Ok(())
    }

    #[test]
    fn failed_downloads_can_restart() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        mark_downloading(dir.path())?;
        mark_download_failed(dir.path(), "stuck")?;
        let status = load_download_status(dir.path())?.unwrap();
        assert_eq!(status.last_error.as_deref(), Some("stuck"));
        assert!(!status.has_1080p);
        mark_downloading(dir.path())?;
        mark_undownloadable(dir.path(), "private video")?;
        assert!(is_undownloadable(dir.path())?);
        mark_downloading(dir.path())?;
        Ok(())
    }

    #[test]
    fn partial_files_hide_completed_status() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        mark_downloading(dir.path())?;
        let media = touch(dir.path(), "abc_720p.mp4", 10);
        mark_downloaded(dir.path(), &media, false, &[])?;
        touch(dir.path(), "abc_720p.mp4.part", 10);
        assert!(!is_video_downloaded(dir.path())?);
        Ok(())
    }

    #[test]
    fn upload_status_round_trip() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        assert!(!is_video_uploaded(dir.path())?);
        mark_uploading(dir.path(), "alpha")?;
        mark_upload_failed(dir.path(), "alpha", "chunk 3 exhausted")?;
        assert!(!is_video_uploaded(dir.path())?);
        mark_uploading(dir.path(), "alpha")?;
        let done = mark_uploaded(dir.path(), "av113445566", "alpha")?;
        assert!(done.started_at.is_some());
        assert!(is_video_uploaded(dir.path())?);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(UPLOAD_STATUS_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["status"], "completed");
        assert_eq!(raw["bilibili_aid"], "av113445566");
        Ok(())
    }

    #[test]
    fn atomic_writes_leave_no_temp_files() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            mark_uploading(dir.path(), "alpha")?;
        }
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![UPLOAD_STATUS_FILE.to_string()]);
        Ok(())
    }

    #[test]
    fn channel_info_is_replaced_wholesale() -> PipelineResult<()> {
        let root = tempdir().unwrap();
        let tree = WorkTree::new(root.path());
        assert!(tree.load_channel_info("chan")?.is_empty());
        let descriptor = |id: &str, index| VideoDescriptor {
            id: id.to_string(),
            title: format!("Title {id}"),
            url: format!("https://www.youtube.com/watch?v={id}"),
            playlist_index: index,
            duration: Some(61.0),
            upload_date: None,
            description: None,
            channel_id: "chan".to_string(),
        };
        tree.save_channel_info("chan", &[descriptor("a", 1), descriptor("b", 2)])?;
        tree.save_channel_info("chan", &[descriptor("c", 1)])?;
        let loaded = tree.load_channel_info("chan")?;
        assert_eq!(loaded, vec![descriptor("c", 1)]);
        Ok(())
    }

    #[test]
    fn repair_marks_uploaded_videos_downloaded() -> PipelineResult<()> {
        let root = tempdir().unwrap();
        let tree = WorkTree::new(root.path());
        let orphan = tree.ensure_video_dir("chan", "orphan")?;
        mark_downloading(&orphan)?;
        mark_download_failed(&orphan, "stuck")?;
        touch(&orphan, "orphan_1080p.mp4", 3);
        mark_uploaded(&orphan, "av1", "alpha")?;

        let fine = tree.ensure_video_dir("chan", "fine")?;
        mark_downloading(&fine)?;

        assert_eq!(tree.repair_download_status("chan")?, 1);
        let status = load_download_status(&orphan)?.unwrap();
        assert_eq!(status.status, DownloadState::Completed);
        assert!(status.has_1080p);
        assert_eq!(
            load_download_status(&fine)?.unwrap().status,
            DownloadState::Downloading
        );
        assert_eq!(tree.repair_download_status("chan")?, 0);
        assert_eq!(
            tree.list_video_dirs("chan")?,
            vec![fine.clone(), orphan.clone()]
        );
        fs::create_dir_all(tree.global_dir()).unwrap();
        assert_eq!(tree.list_channel_ids()?, vec!["chan".to_string()]);
        Ok(())
    }

    #[test]
    fn sanitize_title_replaces_hostile_characters() {
        assert_eq!(sanitize_title("a<b>c:d\"e|f?g*h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_title("tab\there\u{7f}"), "tab_here_");
        assert_eq!(sanitize_title("日本語のタイトル / 中文"), "日本語のタイトル _ 中文");
        assert_eq!(sanitize_title_bytes(b"ok\xffok"), "ok_ok");
    }

    #[test]
    fn truncation_keeps_code_points_whole() {
        let title = "漢".repeat(120);
        let truncated = truncate_title_for_filename(&title, "abcdefghijk", "en", "srt");
        let name = format!("{truncated}[abcdefghijk].en.srt");
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert!(std::str::from_utf8(name.as_bytes()).is_ok());
        assert!(truncated.chars().all(|c| c == '漢'));
        assert_eq!(
            truncate_title_for_filename("short", "abcdefghijk", "en", "srt"),
            "short"
        );
    }

    #[test]
    fn filename_length_holds_for_mixed_widths() {
        let samples = ["a", "é", "漢", "🎬"];
        for sample in samples {
            for repeat in [1usize, 60, 100, 300] {
                let title = sample.repeat(repeat);
                for lang in ["en", "zh-Hans", "pt-BR"] {
                    let truncated = truncate_title_for_filename(&title, "A1b2C3d4E5f", lang, "srt");
                    let name = format!("{truncated}[A1b2C3d4E5f].{lang}.srt");
                    assert!(name.len() <= MAX_FILENAME_BYTES, "{name}");
                }
            }
        }
    }

    #[test]
    fn video_title_prefers_info_json() {
        let dir = tempdir().unwrap();
        assert_eq!(video_title(dir.path(), "abc", Some("From list")), "From list");
        assert_eq!(video_title(dir.path(), "abc", None), "abc");
        fs::write(
            dir.path().join("abc.info.json"),
            r#"{"title":"Short","fulltitle":"Full Title"}"#,
        )
        .unwrap();
        assert_eq!(video_title(dir.path(), "abc", Some("From list")), "Full Title");
    }

    #[test]
    fn organized_marker() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        assert!(!is_organized(dir.path()));
        mark_organized(dir.path())?;
        assert!(is_organized(dir.path()));
        Ok(())
    }

    #[test]
    fn organize_can_drop_the_media_file() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        let media = dir.path().join("abc_1080p.mp4");
        fs::write(&media, b"video").unwrap();
        assert_eq!(organize(dir.path(), false)?, None);
        assert!(media.exists());
        assert_eq!(organize(dir.path(), true)?, Some(media.clone()));
        assert!(!media.exists());
        assert!(is_organized(dir.path()));
        Ok(())
    }

    #[test]
    fn description_falls_back_to_listing() {
        let dir = tempdir().unwrap();
        assert_eq!(video_description(dir.path(), "abc", Some(" listed ")), "listed");
        fs::write(dir.path().join("abc.description"), "From file\n").unwrap();
        assert_eq!(video_description(dir.path(), "abc", Some("listed")), "From file");
    }
}
