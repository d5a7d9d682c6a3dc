#![forbid(unsafe_code)]

//! Extractor command lines.
//!
//! Each builder owns a disjoint set of flags so the full command is a plain
//! concatenation of their outputs.

use rand::Rng;
use std::path::Path;
use std::time::Duration;

use crate::DESKTOP_USER_AGENT;
use crate::config::YoutubeConfig;

/// One way of asking the extractor for a video. Strategies differ only in
/// flags, never in code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub player_client: &'static str,
    pub include_cookies: bool,
    pub pre_sleep: Duration,
}

impl Strategy {
    pub fn extractor_args(&self) -> Vec<String> {
        vec![
            "--extractor-args".to_string(),
            format!("youtube:player_client={}", self.player_client),
        ]
    }
}

/// Ordered fallbacks: web with cookies, web without, then android.
pub fn strategies(config: &YoutubeConfig) -> Vec<Strategy> {
    let mut list = vec![
        Strategy {
            player_client: "web",
            include_cookies: true,
            pre_sleep: Duration::ZERO,
        },
        Strategy {
            player_client: "web",
            include_cookies: false,
            pre_sleep: Duration::from_secs(3),
        },
    ];
    if !config.disable_android_fallback {
        list.push(Strategy {
            player_client: "android",
            include_cookies: false,
            pre_sleep: Duration::from_secs(3),
        });
    }
    list
}

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Output templates, side files and network family.
pub fn base_args(dir: &Path, force_ipv6: bool) -> Vec<String> {
    let dir = dir.display();
    let mut args = vec![
        "-o".to_string(),
        format!("{dir}/%(id)s_%(height)sp.%(ext)s"),
        "-o".to_string(),
        format!("thumbnail:{dir}/%(id)s.%(ext)s"),
        "-o".to_string(),
        format!("infojson:{dir}/%(id)s.%(ext)s"),
        "-o".to_string(),
        format!("description:{dir}/%(id)s.%(ext)s"),
        "-o".to_string(),
        format!("subtitle:{dir}/%(id)s.%(ext)s"),
        "--write-thumbnail".to_string(),
        "--convert-thumbnails".to_string(),
        "jpg".to_string(),
        "--write-info-json".to_string(),
        "--write-description".to_string(),
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--user-agent".to_string(),
        DESKTOP_USER_AGENT.to_string(),
    ];
    args.push(if force_ipv6 {
        "--force-ipv6".to_string()
    } else {
        "--force-ipv4".to_string()
    });
    args
}

/// Cookie file wins over a browser profile.
pub fn cookie_args(config: &YoutubeConfig) -> Vec<String> {
    if let Some(file) = &config.cookies_file {
        return vec!["--cookies".to_string(), file.display().to_string()];
    }
    if let Some(browser) = &config.cookies_from_browser {
        return vec!["--cookies-from-browser".to_string(), browser.clone()];
    }
    Vec::new()
}

pub fn subtitle_args(languages: &[String], transcoder_available: bool) -> Vec<String> {
    if languages.is_empty() {
        return Vec::new();
    }
    let mut args = vec![
        "--write-subs".to_string(),
        "--write-auto-subs".to_string(),
        "--sub-langs".to_string(),
        languages.join(","),
    ];
    if transcoder_available {
        args.push("--convert-subs".to_string());
        args.push("srt".to_string());
    }
    args
}

/// Retry and pacing flags. `jitter` in `[0, 0.5]` stretches the sleep
/// interval so consecutive runs do not share a rhythm.
pub fn stability_args(config: &YoutubeConfig, jitter: f64) -> Vec<String> {
    let sleep_interval = config.sleep_interval_seconds * (1.0 + jitter.clamp(0.0, 0.5));
    let mut args = vec![
        "--retries".to_string(),
        config.retries.to_string(),
        "--fragment-retries".to_string(),
        config.fragment_retries.to_string(),
        "--concurrent-fragments".to_string(),
        config.concurrent_fragments.to_string(),
        "--file-access-retries".to_string(),
        config.file_access_retries.to_string(),
    ];
    if sleep_interval > 0.0 {
        args.push("--sleep-interval".to_string());
        args.push(format!("{sleep_interval:.1}"));
    }
    if config.sleep_requests_seconds > 0.0 {
        args.push("--sleep-requests".to_string());
        args.push(format!("{:.1}", config.sleep_requests_seconds));
    }
    if config.sleep_subtitles_seconds > 0.0 {
        args.push("--sleep-subtitles".to_string());
        args.push(format!("{:.0}", config.sleep_subtitles_seconds));
    }
    if let Some(size) = &config.buffer_size {
        args.push("--buffer-size".to_string());
        args.push(size.clone());
    }
    if let Some(rate) = &config.limit_rate {
        args.push("--limit-rate".to_string());
        args.push(rate.clone());
    }
    args
}

pub fn format_args(min_height: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        format!("bv*[height>={min_height}]+ba/b[height>={min_height}]"),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
    ]
}

/// Full argument vector for one strategy attempt, URL last.
pub fn build_download_args(
    config: &YoutubeConfig,
    strategy: &Strategy,
    dir: &Path,
    video_id: &str,
    languages: &[String],
    transcoder_available: bool,
) -> Vec<String> {
    let jitter = rand::thread_rng().gen_range(0.0..=0.5);
    let mut args = base_args(dir, config.force_ipv6);
    if strategy.include_cookies {
        args.extend(cookie_args(config));
    }
    args.extend(subtitle_args(languages, transcoder_available));
    args.extend(stability_args(config, jitter));
    args.extend(format_args(config.min_height));
    args.extend(strategy.extractor_args());
    args.push(video_url(video_id));
    args
}
