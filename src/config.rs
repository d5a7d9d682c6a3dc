#![forbid(unsafe_code)]

//! Configuration document and its resolution order.
//!
//! Values come from, in decreasing priority: CLI overrides, environment
//! variables, the TOML file, and finally the defaults declared here.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::channel::channel_id_from_url;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_ENV: &str = "TUBE2BILI_CONFIG";
pub const OUTPUT_DIR_ENV: &str = "TUBE2BILI_OUTPUT_DIR";

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.tv";
pub const DEFAULT_STUDIO_BASE: &str = "https://studio.bilibili.tv";
pub const DEFAULT_BASE_URL: &str = "https://www.bilibili.tv";

/// Sync downloads then uploads each video before moving on; batch downloads
/// everything first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Sync,
    Batch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: RunMode,
    pub output: OutputConfig,
    pub youtube: YoutubeConfig,
    pub bilibili: BilibiliConfig,
    pub subtitles: SubtitleConfig,
    pub tools: ToolsConfig,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./downloads"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeConfig {
    pub ytdlp_path: PathBuf,
    pub min_height: u32,
    pub force_ipv6: bool,
    pub disable_android_fallback: bool,
    pub cookies_file: Option<PathBuf>,
    pub cookies_from_browser: Option<String>,
    pub subtitle_languages: Vec<String>,
    pub retries: u32,
    pub fragment_retries: u32,
    pub concurrent_fragments: u32,
    pub sleep_interval_seconds: f64,
    pub sleep_requests_seconds: f64,
    pub sleep_subtitles_seconds: f64,
    pub buffer_size: Option<String>,
    pub file_access_retries: u32,
    pub limit_rate: Option<String>,
    pub video_limit_before_rest: u32,
    /// Minutes.
    pub video_limit_rest_duration: u64,
    pub bot_detection_threshold: u32,
    /// Minutes.
    pub bot_detection_rest_duration: u64,
    pub force_download_undownloadable: bool,
    pub cleanup_partial_files_on_failure: bool,
    pub progress_tick_seconds: u64,
    pub stall_timeout_seconds: u64,
    pub max_stuck_retries: u32,
    pub refresh_channel_info: bool,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: PathBuf::from("yt-dlp"),
            min_height: 1080,
            force_ipv6: true,
            disable_android_fallback: true,
            cookies_file: None,
            cookies_from_browser: None,
            subtitle_languages: vec!["en".to_string()],
            retries: 10,
            fragment_retries: 10,
            concurrent_fragments: 4,
            sleep_interval_seconds: 5.0,
            sleep_requests_seconds: 1.0,
            sleep_subtitles_seconds: 5.0,
            buffer_size: Some("16K".to_string()),
            file_access_retries: 5,
            limit_rate: None,
            video_limit_before_rest: 10,
            video_limit_rest_duration: 60,
            bot_detection_threshold: 10,
            bot_detection_rest_duration: 480,
            force_download_undownloadable: false,
            cleanup_partial_files_on_failure: true,
            progress_tick_seconds: 60,
            stall_timeout_seconds: 120,
            max_stuck_retries: 5,
            refresh_channel_info: true,
        }
    }
}

impl YoutubeConfig {
    pub fn progress_tick(&self) -> Duration {
        Duration::from_secs(self.progress_tick_seconds)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BilibiliConfig {
    pub api_base: String,
    pub studio_base: String,
    pub base_url: String,
    pub cookies_file: Option<PathBuf>,
    pub accounts: Vec<AccountConfig>,
    pub daily_upload_limit: u32,
    pub chunk_upload_retries: u32,
    pub chunk_retry_backoff_seconds: u64,
    pub delete_original_after_upload: bool,
    pub request_timeout_seconds: u64,
}

impl Default for BilibiliConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            studio_base: DEFAULT_STUDIO_BASE.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            cookies_file: None,
            accounts: Vec::new(),
            daily_upload_limit: 160,
            chunk_upload_retries: 5,
            chunk_retry_backoff_seconds: 1,
            delete_original_after_upload: true,
            request_timeout_seconds: 120,
        }
    }
}

impl BilibiliConfig {
    /// Account names eligible for rotation. A bare global cookie file acts as
    /// a single account named `default`.
    pub fn account_names(&self) -> Vec<String> {
        if self.accounts.is_empty() {
            return vec!["default".to_string()];
        }
        self.accounts.iter().map(|acct| acct.name.clone()).collect()
    }

    /// Per-account cookie file, else the global one.
    pub fn cookies_for(&self, account: &str) -> Option<PathBuf> {
        self.accounts
            .iter()
            .find(|acct| acct.name == account)
            .and_then(|acct| acct.cookies_file.clone())
            .or_else(|| self.cookies_file.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleConfig {
    pub auto_fix_overlap: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub account: Option<String>,
}

impl ChannelConfig {
    pub fn channel_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| channel_id_from_url(&self.url))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

/// Loads the configuration honoring CLI overrides and the environment.
pub fn resolve_config(overrides: ConfigOverrides) -> Result<Config> {
    let explicit = overrides
        .config_path
        .clone()
        .or_else(|| env_var_string(CONFIG_ENV).map(PathBuf::from));
    let file_config = match &explicit {
        Some(path) => read_config_file(path)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                read_config_file(default_path)?
            } else {
                Config::default()
            }
        }
    };
    build_config_with_overrides(file_config, env_var_string, overrides)
}

pub fn read_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("Parsing {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<Config> {
    toml::from_str(raw).map_err(|err| anyhow!("invalid configuration: {err}"))
}

fn build_config_with_overrides(
    mut config: Config,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<Config> {
    if let Some(dir) = overrides
        .output_dir
        .or_else(|| env_lookup(OUTPUT_DIR_ENV).map(PathBuf::from))
    {
        config.output.directory = dir;
    }
    validate(&config)?;
    Ok(config)
}

/// Rejects documents the pipeline cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    if config.youtube.min_height == 0 {
        bail!("youtube.min_height must be positive");
    }
    if config.bilibili.daily_upload_limit == 0 {
        bail!("bilibili.daily_upload_limit must be positive");
    }
    if config.bilibili.chunk_upload_retries == 0 {
        bail!("bilibili.chunk_upload_retries must be positive");
    }
    let mut seen = HashSet::new();
    for channel in &config.channels {
        if channel.url.trim().is_empty() {
            bail!("channel entries need a url");
        }
        let id = channel.channel_id();
        if !seen.insert(id.clone()) {
            bail!("duplicate channel id {id}");
        }
    }
    let mut names = HashSet::new();
    for account in &config.bilibili.accounts {
        if account.name.trim().is_empty() {
            bail!("bilibili accounts need a name");
        }
        if !names.insert(account.name.as_str()) {
            bail!("duplicate bilibili account {}", account.name);
        }
    }
    Ok(())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.mode, RunMode::Sync);
        assert_eq!(config.output.directory, PathBuf::from("./downloads"));
        assert_eq!(config.youtube.min_height, 1080);
        assert!(config.youtube.force_ipv6);
        assert!(config.youtube.disable_android_fallback);
        assert_eq!(config.youtube.video_limit_before_rest, 10);
        assert_eq!(config.youtube.video_limit_rest_duration, 60);
        assert_eq!(config.youtube.bot_detection_threshold, 10);
        assert_eq!(config.youtube.bot_detection_rest_duration, 480);
        assert!(!config.youtube.force_download_undownloadable);
        assert!(config.youtube.cleanup_partial_files_on_failure);
        assert_eq!(config.bilibili.daily_upload_limit, 160);
        assert_eq!(config.bilibili.chunk_upload_retries, 5);
        assert_eq!(config.bilibili.chunk_retry_backoff_seconds, 1);
        assert!(config.bilibili.delete_original_after_upload);
        assert!(!config.subtitles.auto_fix_overlap);
    }

    #[test]
    fn reads_sections_and_channels() {
        let cfg = make_config(
            r#"
            mode = "batch"

            [output]
            directory = "/data/work"

            [youtube]
            min_height = 720
            force_ipv6 = false

            [bilibili]
            daily_upload_limit = 2
            cookies_file = "/secrets/global.txt"

            [[bilibili.accounts]]
            name = "alpha"
            cookies_file = "/secrets/alpha.json"

            [[bilibili.accounts]]
            name = "beta"

            [subtitles]
            auto_fix_overlap = true

            [[channels]]
            url = "https://www.youtube.com/@SomeChannel"
            languages = ["en", "ja"]
            offset = 100
            limit = 50
            account = "alpha"
            "#,
        );
        let config = read_config_file(cfg.path()).unwrap();
        assert_eq!(config.mode, RunMode::Batch);
        assert_eq!(config.output.directory, PathBuf::from("/data/work"));
        assert_eq!(config.youtube.min_height, 720);
        assert!(!config.youtube.force_ipv6);
        assert_eq!(config.bilibili.daily_upload_limit, 2);
        assert!(config.subtitles.auto_fix_overlap);
        assert_eq!(config.bilibili.account_names(), vec!["alpha", "beta"]);
        assert_eq!(
            config.bilibili.cookies_for("alpha"),
            Some(PathBuf::from("/secrets/alpha.json"))
        );
        assert_eq!(
            config.bilibili.cookies_for("beta"),
            Some(PathBuf::from("/secrets/global.txt"))
        );
        let channel = &config.channels[0];
        assert_eq!(channel.channel_id(), "SomeChannel");
        assert_eq!(channel.offset, 100);
        assert_eq!(channel.limit, Some(50));
    }

    #[test]
    fn output_override_precedence() {
        let config = parse_config("[output]\ndirectory = \"/file\"\n").unwrap();
        let from_env = build_config_with_overrides(
            config.clone(),
            |key| (key == OUTPUT_DIR_ENV).then(|| "/env".to_string()),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(from_env.output.directory, PathBuf::from("/env"));

        let from_cli = build_config_with_overrides(
            config.clone(),
            |key| (key == OUTPUT_DIR_ENV).then(|| "/env".to_string()),
            ConfigOverrides {
                output_dir: Some(PathBuf::from("/cli")),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(from_cli.output.directory, PathBuf::from("/cli"));

        let from_file =
            build_config_with_overrides(config, |_| None, ConfigOverrides::default()).unwrap();
        assert_eq!(from_file.output.directory, PathBuf::from("/file"));
    }

    #[test]
    fn validation_rejects_duplicate_channels() {
        let config = parse_config(
            r#"
            [[channels]]
            url = "https://www.youtube.com/@Same"
            [[channels]]
            url = "https://www.youtube.com/@Same/videos"
            "#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate channel id"));
    }

    #[test]
    fn validation_rejects_zero_limits() {
        let config = parse_config("[bilibili]\ndaily_upload_limit = 0\n").unwrap();
        assert!(validate(&config).is_err());
        let config = parse_config("[youtube]\nmin_height = 0\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_config(ConfigOverrides {
            config_path: Some(dir.path().join("missing.toml")),
            output_dir: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn default_account_when_none_declared() {
        let config = Config::default();
        assert_eq!(config.bilibili.account_names(), vec!["default"]);
    }
}
