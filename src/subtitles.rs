#![forbid(unsafe_code)]

//! Subtitle normalization: VTT to SRT, overlap repair, human-readable copies
//! and the destination's styled JSON container.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{PipelineError, PipelineResult};
use crate::workdir::{
    find_subtitle_files, sanitize_title, truncate_title_for_filename, write_bytes_atomic,
};

const COMPONENT: &str = "subtitles";

/// Gap left between a shortened cue and its successor.
const OVERLAP_GAP_MS: u64 = 10;
/// Minimum duration given to a cue that would otherwise vanish.
const MIN_CUE_MS: u64 = 400;

static TIMING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*((?:\d+:)?\d{1,2}:\d{2}[.,]\d{1,3})\s*-->\s*((?:\d+:)?\d{1,2}:\d{2}[.,]\d{1,3})",
    )
    .expect("timing regex")
});

static VTT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?(?:c|v|i|b|u|lang|ruby|rt)(?:[.\s][^>]*)?>|<\d{1,2}:\d{2}(?::\d{2})?[.,]\d{3}>")
        .expect("tag regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Accepts `HH:MM:SS,mmm`, `HH:MM:SS.mmm` and the short `MM:SS.mmm` form.
pub fn parse_timestamp(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (clock, fraction) = raw.split_once([',', '.'])?;
    let mut parts = clock.split(':').rev();
    let seconds: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let hours: u64 = match parts.next() {
        Some(hours) => hours.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    let millis: u64 = match fraction.len() {
        1 => fraction.parse::<u64>().ok()? * 100,
        2 => fraction.parse::<u64>().ok()? * 10,
        3 => fraction.parse().ok()?,
        _ => return None,
    };
    Some(((hours * 60 + minutes) * 60 + seconds) * 1000 + millis)
}

pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Lenient SRT reader: cue numbers are ignored, blocks without a timing line
/// are dropped.
pub fn parse_srt(content: &str) -> Vec<SrtEntry> {
    let normalized = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut entries = Vec::new();
    for block in normalized.split("\n\n") {
        let mut lines = block.lines().skip_while(|line| !TIMING_LINE.is_match(line));
        let Some(timing) = lines.next() else {
            continue;
        };
        let Some(caps) = TIMING_LINE.captures(timing) else {
            continue;
        };
        let (Some(start_ms), Some(end_ms)) =
            (parse_timestamp(&caps[1]), parse_timestamp(&caps[2]))
        else {
            continue;
        };
        let text = lines.collect::<Vec<_>>().join("\n");
        entries.push(SrtEntry {
            start_ms,
            end_ms,
            text: text.trim().to_string(),
        });
    }
    entries
}

pub fn render_srt(entries: &[SrtEntry]) -> String {
    let mut out = String::new();
    for (index, entry) in entries.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(entry.start_ms),
            format_timestamp(entry.end_ms),
            entry.text
        ));
    }
    out
}

fn clean_cue_text(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            let stripped = VTT_TAG.replace_all(line, "");
            stripped
                .replace("&amp;", "&")
                .replace("&lt;", "<")
                .replace("&gt;", ">")
                .replace("&nbsp;", " ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts WebVTT to SRT: header, notes and styles dropped, inline tags
/// stripped, whitespace collapsed, cues renumbered from 1.
pub fn vtt_to_srt(content: &str) -> String {
    let normalized = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut entries = Vec::new();
    for block in normalized.split("\n\n") {
        let trimmed = block.trim_start();
        if trimmed.starts_with("WEBVTT")
            || trimmed.starts_with("NOTE")
            || trimmed.starts_with("STYLE")
            || trimmed.starts_with("REGION")
        {
            continue;
        }
        let mut lines = trimmed.lines().skip_while(|line| !TIMING_LINE.is_match(line));
        let Some(timing) = lines.next() else {
            continue;
        };
        let Some(caps) = TIMING_LINE.captures(timing) else {
            continue;
        };
        let (Some(start_ms), Some(end_ms)) =
            (parse_timestamp(&caps[1]), parse_timestamp(&caps[2]))
        else {
            continue;
        };
        let text = clean_cue_text(&lines.collect::<Vec<_>>().join("\n"));
        if text.is_empty() {
            continue;
        }
        entries.push(SrtEntry {
            start_ms,
            end_ms,
            text,
        });
    }
    render_srt(&entries)
}

/// Shortens cues that run into the next one (by start time) and returns how
/// many were touched. Entry order is left as found.
pub fn repair_overlaps(entries: &mut [SrtEntry]) -> usize {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by_key(|&index| entries[index].start_ms);
    let mut changed = 0;
    for pair in order.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        let next_start = entries[next].start_ms;
        let entry = &mut entries[prev];
        if entry.end_ms <= next_start {
            continue;
        }
        let mut end = next_start.saturating_sub(OVERLAP_GAP_MS);
        if end <= entry.start_ms {
            end = entry.start_ms + MIN_CUE_MS;
        }
        if end != entry.end_ms {
            entry.end_ms = end;
            changed += 1;
        }
    }
    changed
}

/// Repairs overlaps in place, keeping the first version as `{file}.backup`.
pub fn repair_overlaps_in_file(path: &Path) -> PipelineResult<usize> {
    let content =
        fs::read_to_string(path).map_err(|err| PipelineError::storage(COMPONENT, path, err))?;
    let mut entries = parse_srt(&content);
    let changed = repair_overlaps(&mut entries);
    if changed == 0 {
        return Ok(0);
    }
    let backup = backup_path(path);
    if !backup.exists() {
        fs::copy(path, &backup).map_err(|err| PipelineError::storage(COMPONENT, &backup, err))?;
    }
    write_bytes_atomic(path, render_srt(&entries).as_bytes())?;
    tracing::info!(path = %path.display(), changed, "repaired overlapping subtitle cues");
    Ok(changed)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Splits `{id}.{lang}.{ext}` into `(lang, ext)`.
fn id_named_parts<'a>(name: &'a str, video_id: &str) -> Option<(&'a str, &'a str)> {
    let rest = name.strip_prefix(video_id)?.strip_prefix('.')?;
    let (lang, ext) = rest.rsplit_once('.')?;
    if lang.is_empty() || ext.is_empty() {
        return None;
    }
    Some((lang, ext))
}

/// Copies every `{id}.{lang}.{ext}` to `{title}[{id}].{lang}.{ext}`. Existing
/// copies are kept. Returns the human-readable paths.
pub fn copy_with_title(
    dir: &Path,
    video_id: &str,
    title: &str,
    sources: &[PathBuf],
) -> PipelineResult<Vec<PathBuf>> {
    let clean_title = sanitize_title(title);
    let mut copies = Vec::new();
    for source in sources {
        let Some(name) = source.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some((lang, ext)) = id_named_parts(name, video_id) else {
            continue;
        };
        let short = truncate_title_for_filename(&clean_title, video_id, lang, ext);
        let target = dir.join(format!("{short}[{video_id}].{lang}.{ext}"));
        if !target.exists() {
            fs::copy(source, &target)
                .map_err(|err| PipelineError::storage(COMPONENT, &target, err))?;
        }
        copies.push(target);
    }
    Ok(copies)
}

/// Post-download pass over a work directory. Converts stray VTT files,
/// optionally repairs overlaps, and returns the SRT paths meant for upload.
pub fn normalize_directory(
    dir: &Path,
    video_id: &str,
    title: &str,
    auto_fix_overlap: bool,
) -> PipelineResult<Vec<PathBuf>> {
    let mut srt_sources = Vec::new();
    for path in find_subtitle_files(dir)? {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if id_named_parts(name, video_id).is_none() {
            continue;
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("vtt") => {
                let srt_path = path.with_extension("srt");
                if !srt_path.exists() {
                    let content = fs::read_to_string(&path)
                        .map_err(|err| PipelineError::storage(COMPONENT, &path, err))?;
                    write_bytes_atomic(&srt_path, vtt_to_srt(&content).as_bytes())?;
                    tracing::debug!(path = %srt_path.display(), "converted vtt subtitle");
                }
                if !srt_sources.contains(&srt_path) {
                    srt_sources.push(srt_path);
                }
            }
            Some("srt") => {
                if !srt_sources.contains(&path) {
                    srt_sources.push(path);
                }
            }
            _ => {}
        }
    }
    if auto_fix_overlap {
        for path in &srt_sources {
            repair_overlaps_in_file(path)?;
        }
    }
    let copies = copy_with_title(dir, video_id, title, &srt_sources)?;
    Ok(if copies.is_empty() { srt_sources } else { copies })
}

/// Top-level style block of the destination's subtitle container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStyle {
    pub font_size: f64,
    pub font_color: String,
    pub background_alpha: f64,
    pub background_color: String,
    #[serde(rename = "Stroke")]
    pub stroke: String,
    #[serde(skip)]
    pub location: u8,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_size: 0.4,
            font_color: "#FFFFFF".to_string(),
            background_alpha: 0.5,
            background_color: "#9C27B0".to_string(),
            stroke: "none".to_string(),
            location: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyledCue {
    pub from: f64,
    pub to: f64,
    pub location: u8,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyledSubtitles {
    #[serde(flatten)]
    pub style: SubtitleStyle,
    pub body: Vec<StyledCue>,
}

impl StyledSubtitles {
    pub fn from_entries(entries: &[SrtEntry], style: SubtitleStyle) -> Self {
        let body = entries
            .iter()
            .map(|entry| StyledCue {
                from: entry.start_ms as f64 / 1000.0,
                to: entry.end_ms as f64 / 1000.0,
                location: style.location,
                content: entry.text.clone(),
            })
            .collect();
        Self { style, body }
    }

    pub fn from_srt(content: &str) -> Self {
        Self::from_entries(&parse_srt(content), SubtitleStyle::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VTT: &str = "WEBVTT\nKind: captions\nLanguage: en\n\nNOTE generated\n\n1\n00:00:01.000 --> 00:00:02.500 align:start position:0%\n<c.colorE5E5E5>Hello</c>   <i>there</i>\n\n00:03.000 --> 00:04.000\n<v Speaker>General<00:00:03.500><c> Kenobi</c></v>\n\n00:00:05.000 --> 00:00:06.000\n<b></b>\n";

    #[test]
    fn vtt_conversion_strips_header_and_tags() {
        let srt = vtt_to_srt(VTT);
        assert_eq!(
            srt,
            "1\n00:00:01,000 --> 00:00:02,500\nHello there\n\n2\n00:00:03,000 --> 00:00:04,000\nGeneral Kenobi\n\n"
        );
    }

    #[test]
    fn timestamps_round_trip_through_formatting() {
        assert_eq!(parse_timestamp("01:02:03,456"), Some(3_723_456));
        assert_eq!(parse_timestamp("02:03.4"), Some(123_400));
        assert_eq!(parse_timestamp("garbage"), None);
        assert_eq!(format_timestamp(3_723_456), "01:02:03,456");
    }

    fn entry(start_ms: u64, end_ms: u64, text: &str) -> SrtEntry {
        SrtEntry {
            start_ms,
            end_ms,
            text: text.to_string(),
        }
    }

    #[test]
    fn overlaps_are_trimmed_against_the_next_start() {
        let mut entries = vec![
            entry(0, 2_000, "a"),
            entry(1_500, 3_000, "b"),
            entry(3_000, 4_000, "c"),
        ];
        assert_eq!(repair_overlaps(&mut entries), 1);
        assert_eq!(entries[0].end_ms, 1_490);
        assert_eq!(entries[1].end_ms, 3_000);
    }

    #[test]
    fn collapsed_cues_get_minimum_duration() {
        let mut entries = vec![entry(1_000, 5_000, "a"), entry(1_005, 2_000, "b")];
        repair_overlaps(&mut entries);
        assert_eq!(entries[0].end_ms, 1_400);
    }

    #[test]
    fn repair_preserves_original_order() {
        let mut entries = vec![entry(5_000, 6_000, "late"), entry(0, 5_500, "early")];
        repair_overlaps(&mut entries);
        assert_eq!(entries[0].text, "late");
        assert_eq!(entries[1].end_ms, 4_990);
        assert_eq!(entries[0].end_ms, 6_000);
    }

    #[test]
    fn overlap_repair_is_a_fixed_point() {
        let cases: Vec<Vec<SrtEntry>> = vec![
            vec![entry(0, 10_000, "a"), entry(5, 20, "b"), entry(5, 7_000, "c")],
            vec![entry(100, 50, "inverted"), entry(0, 1_000, "x")],
            vec![entry(0, 3_000, "a"), entry(1_000, 2_000, "b"), entry(1_500, 9_000, "c")],
            vec![entry(0, 5, "a"), entry(0, 5, "b"), entry(0, 5, "c")],
        ];
        for case in cases {
            let mut once = case.clone();
            repair_overlaps(&mut once);
            let mut twice = once.clone();
            repair_overlaps(&mut twice);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn file_repair_writes_backup_once() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.en.srt");
        let original = "1\n00:00:00,000 --> 00:00:03,000\none\n\n2\n00:00:02,000 --> 00:00:04,000\ntwo\n";
        fs::write(&path, original).unwrap();
        assert_eq!(repair_overlaps_in_file(&path)?, 1);
        assert_eq!(repair_overlaps_in_file(&path)?, 0);
        let backup = dir.path().join("abc.en.srt.backup");
        assert_eq!(fs::read_to_string(backup).unwrap(), original);
        let repaired = parse_srt(&fs::read_to_string(&path).unwrap());
        assert_eq!(repaired[0].end_ms, 1_990);
        Ok(())
    }

    #[test]
    fn normalize_converts_and_copies_with_title() -> PipelineResult<()> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("abc.en.vtt"), VTT).unwrap();
        fs::write(
            dir.path().join("abc.ja.srt"),
            "1\n00:00:00,000 --> 00:00:01,000\nこんにちは\n",
        )
        .unwrap();
        let paths = normalize_directory(dir.path(), "abc", "A: Title?", false)?;
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["A_ Title_[abc].en.srt", "A_ Title_[abc].ja.srt"]);
        assert!(dir.path().join("abc.en.srt").exists());
        assert!(dir.path().join("abc.en.vtt").exists());

        let again = normalize_directory(dir.path(), "abc", "A: Title?", false)?;
        assert_eq!(again, paths);
        Ok(())
    }

    #[test]
    fn styled_json_has_style_block_and_body() {
        let styled = StyledSubtitles::from_srt("1\n00:00:01,500 --> 00:00:02,000\nhi\n");
        let value = serde_json::to_value(&styled).unwrap();
        assert_eq!(value["font_size"], 0.4);
        assert_eq!(value["font_color"], "#FFFFFF");
        assert_eq!(value["background_alpha"], 0.5);
        assert_eq!(value["background_color"], "#9C27B0");
        assert_eq!(value["Stroke"], "none");
        assert!(value.get("location").is_none());
        assert_eq!(value["body"][0]["from"], 1.5);
        assert_eq!(value["body"][0]["to"], 2.0);
        assert_eq!(value["body"][0]["location"], 2);
        assert_eq!(value["body"][0]["content"], "hi");
    }
}
