#![forbid(unsafe_code)]

//! Channel listing through the extractor's flat-playlist dump.

use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::DESKTOP_USER_AGENT;
use crate::config::YoutubeConfig;
use crate::download::args::{cookie_args, video_url};
use crate::error::{ErrorKind, PipelineError, PipelineResult, preview};
use crate::workdir::{VideoDescriptor, sanitize_title};

const COMPONENT: &str = "channel";

const CHANNEL_TABS: &[&str] = &["videos", "shorts", "streams", "playlists", "featured", "live"];

/// Stable directory name for a channel URL.
///
/// `/channel/UC…` yields the UC id, `/@handle` the handle, `/c/Name` and
/// `/user/Name` the name, and anything else its last meaningful segment.
pub fn channel_id_from_url(url: &str) -> String {
    let trimmed = url.trim();
    let (without_query, query) = match trimmed.split_once(['?', '#']) {
        Some((base, rest)) => (base, Some(rest)),
        None => (trimmed, None),
    };
    if let Some(list) = query.and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("list="))
            .filter(|value| !value.is_empty())
    }) {
        return sanitize_segment(list);
    }
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let mut segments: Vec<&str> = path.split('/').filter(|seg| !seg.is_empty()).collect();
    if segments.first().is_some_and(|seg| seg.contains('.')) {
        segments.remove(0);
    }
    while segments
        .last()
        .is_some_and(|seg| CHANNEL_TABS.contains(seg))
    {
        segments.pop();
    }
    let id = match segments.as_slice() {
        ["channel", id, ..] => id.to_string(),
        ["c" | "user", name, ..] => name.to_string(),
        [handle, ..] if handle.starts_with('@') => handle.trim_start_matches('@').to_string(),
        [.., last] => last.to_string(),
        [] => String::new(),
    };
    let id = sanitize_segment(&id);
    if id.is_empty() {
        "channel".to_string()
    } else {
        id
    }
}

fn sanitize_segment(segment: &str) -> String {
    sanitize_title(segment).replace(' ', "_")
}

/// Points a channel URL at its `/videos` tab unless it already names a tab or
/// a playlist.
pub fn channel_list_url(channel_url: &str) -> String {
    let trimmed = channel_url.trim();
    let absolute = if trimmed.starts_with('@') {
        format!("https://www.youtube.com/{trimmed}")
    } else {
        trimmed.to_string()
    };
    let (without_query, query) = match absolute.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query.to_string())),
        None => (absolute.clone(), None),
    };
    let base = without_query.trim_end_matches('/');
    let already_listing = base.contains("/playlist")
        || base
            .rsplit('/')
            .next()
            .is_some_and(|last| CHANNEL_TABS.contains(&last))
        || query.as_deref().is_some_and(|q| q.contains("list="));
    let mut result = if already_listing {
        base.to_string()
    } else {
        format!("{base}/videos")
    };
    if let Some(query) = query {
        result.push('?');
        result.push_str(&query);
    }
    result
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    playlist_index: Option<usize>,
    duration: Option<f64>,
    upload_date: Option<String>,
    description: Option<String>,
}

/// Descriptors plus counts of what was thrown away.
#[derive(Debug, Default)]
pub struct ChannelListing {
    pub videos: Vec<VideoDescriptor>,
    pub total_lines: usize,
    pub skipped: usize,
}

/// Parses one JSON object per line. Lines that fail to decode, are not
/// `_type == "url"`, or lack an id or title are counted and skipped.
pub fn parse_flat_playlist(output: &str, channel_id: &str) -> ChannelListing {
    let mut listing = ChannelListing::default();
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        listing.total_lines += 1;
        let entry: FlatEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, line = %preview(line, 120), "skipping undecodable playlist line");
                listing.skipped += 1;
                continue;
            }
        };
        if entry.kind.as_deref() != Some("url") {
            listing.skipped += 1;
            continue;
        }
        let (Some(id), Some(title)) = (
            entry.id.filter(|id| !id.is_empty()),
            entry.title.filter(|title| !title.is_empty()),
        ) else {
            listing.skipped += 1;
            continue;
        };
        let position = listing.videos.len() + 1;
        listing.videos.push(VideoDescriptor {
            url: entry
                .url
                .filter(|url| url.starts_with("http"))
                .unwrap_or_else(|| video_url(&id)),
            id,
            title,
            playlist_index: entry.playlist_index.unwrap_or(position),
            duration: entry.duration,
            upload_date: entry.upload_date,
            description: entry.description,
            channel_id: channel_id.to_string(),
        });
    }
    listing
}

/// Lists a channel's videos in playlist order.
///
/// Fails with `Extractor` only when not a single line could be parsed.
pub async fn extract_videos(
    config: &YoutubeConfig,
    channel_url: &str,
    channel_id: &str,
    cancel: &CancellationToken,
) -> PipelineResult<Vec<VideoDescriptor>> {
    let list_url = channel_list_url(channel_url);
    let mut command = Command::new(&config.ytdlp_path);
    command
        .arg("--flat-playlist")
        .arg("--dump-json")
        .arg("--ignore-errors")
        .arg("--no-warnings")
        .arg("--user-agent")
        .arg(DESKTOP_USER_AGENT)
        .args(cookie_args(config))
        .arg(&list_url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(channel = channel_id, url = %list_url, "listing channel videos");
    let output = tokio::select! {
        output = command.output() => output.map_err(|err| {
            PipelineError::new(
                ErrorKind::Extractor,
                COMPONENT,
                format!("could not run {}: {err}", config.ytdlp_path.display()),
            )
            .with_source(err)
        })?,
        _ = cancel.cancelled() => return Err(PipelineError::cancelled(COMPONENT)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let listing = parse_flat_playlist(&stdout, channel_id);
    if listing.videos.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = PipelineError::new(
            ErrorKind::Extractor,
            COMPONENT,
            format!(
                "no videos parsed from {list_url} ({} lines, exit {})",
                listing.total_lines, output.status
            ),
        )
        .with_preview(&stderr);
        tracing::error!(
            channel = channel_id,
            url = %list_url,
            lines = listing.total_lines,
            preview = err.preview.as_deref().unwrap_or_default(),
            "channel listing failed"
        );
        return Err(err);
    }
    if !output.status.success() {
        tracing::warn!(channel = channel_id, status = %output.status, "extractor exited non-zero but produced entries");
    }
    tracing::info!(
        channel = channel_id,
        parsed = listing.videos.len(),
        skipped = listing.skipped,
        lines = listing.total_lines,
        "channel listing parsed"
    );
    Ok(listing.videos)
}
