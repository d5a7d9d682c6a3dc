#![forbid(unsafe_code)]

//! Optional helper programs: the transcoder and its probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::ToolsConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult};

const COMPONENT: &str = "tools";

/// Scale-and-pad filter that letterboxes anything into 1280x720.
const PAD_720P_FILTER: &str = "scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2:color=black,format=yuv420p";

/// Runs `<name> -version` and reports whether it succeeded.
pub fn program_available(name: &Path) -> bool {
    std::process::Command::new(name)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Resolved helper binaries; `None` means the feature that needs it is
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct Tools {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl Tools {
    pub fn detect(config: &ToolsConfig) -> Self {
        let pick = |configured: &Option<PathBuf>, fallback: &str| {
            let candidate = configured
                .clone()
                .unwrap_or_else(|| PathBuf::from(fallback));
            if program_available(&candidate) {
                Some(candidate)
            } else {
                tracing::warn!(program = %candidate.display(), "helper program not available");
                None
            }
        };
        Self {
            ffmpeg: pick(&config.ffmpeg_path, "ffmpeg"),
            ffprobe: pick(&config.ffprobe_path, "ffprobe"),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_transcoder(&self) -> bool {
        self.ffmpeg.is_some()
    }

    /// Letterboxes `input` into a 1280x720 JPEG at `output`.
    pub async fn pad_cover_to_720p(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let ffmpeg = self.require_ffmpeg()?;
        let mut command = Command::new(ffmpeg);
        command
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(PAD_720P_FILTER)
            .arg("-q:v")
            .arg("2")
            .arg(output);
        run_checked(command, "pad cover").await
    }

    /// Grabs the frame at t=0 of `video`, letterboxed into 1280x720.
    pub async fn extract_first_frame(&self, video: &Path, output: &Path) -> PipelineResult<()> {
        let ffmpeg = self.require_ffmpeg()?;
        let mut command = Command::new(ffmpeg);
        command
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg("0")
            .arg("-i")
            .arg(video)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(PAD_720P_FILTER)
            .arg("-q:v")
            .arg("2")
            .arg(output);
        run_checked(command, "extract first frame").await
    }

    /// Height of the first video stream, if a probe is available and the
    /// file is readable.
    pub async fn probe_height(&self, video: &Path) -> Option<u32> {
        let ffprobe = self.ffprobe.as_ref()?;
        let output = Command::new(ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=height")
            .arg("-of")
            .arg("csv=p=0")
            .arg(video)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.trim().trim_end_matches(',').parse().ok())
    }

    fn require_ffmpeg(&self) -> PipelineResult<&PathBuf> {
        self.ffmpeg.as_ref().ok_or_else(|| {
            PipelineError::new(ErrorKind::Config, COMPONENT, "transcoder is not available")
        })
    }
}

async fn run_checked(mut command: Command, label: &str) -> PipelineResult<()> {
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            PipelineError::new(ErrorKind::Transient, COMPONENT, format!("{label}: {err}"))
                .with_source(err)
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(PipelineError::new(
        ErrorKind::Transient,
        COMPONENT,
        format!("{label} failed with {}", output.status),
    )
    .with_preview(&String::from_utf8_lossy(&output.stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::install_script;
    use tempfile::tempdir;

    #[test]
    fn missing_programs_are_not_available() {
        assert!(!program_available(Path::new("/nonexistent/ffmpeg")));
        let tools = Tools::detect(&ToolsConfig {
            ffmpeg_path: Some("/nonexistent/ffmpeg".into()),
            ffprobe_path: Some("/nonexistent/ffprobe".into()),
        });
        assert!(!tools.has_transcoder());
        assert!(tools.ffprobe.is_none());
    }

    #[tokio::test]
    async fn probe_reads_stream_height() {
        let dir = tempdir().unwrap();
        let probe = install_script(dir.path(), "ffprobe", "echo 720");
        let tools = Tools {
            ffmpeg: None,
            ffprobe: Some(probe),
        };
        assert_eq!(tools.probe_height(Path::new("/any.mp4")).await, Some(720));
        assert_eq!(Tools::none().probe_height(Path::new("/any.mp4")).await, None);
    }

    #[tokio::test]
    async fn pad_cover_invokes_transcoder_with_filter() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("ffmpeg.log");
        let ffmpeg = install_script(
            dir.path(),
            "ffmpeg",
            &format!(
                "printf '%s\\n' \"$@\" > \"{}\"\nfor last; do :; done\necho padded > \"$last\"",
                log.display()
            ),
        );
        let tools = Tools {
            ffmpeg: Some(ffmpeg),
            ffprobe: None,
        };
        let output = dir.path().join("cover_720p.jpg");
        tools
            .pad_cover_to_720p(Path::new("/in.jpg"), &output)
            .await
            .unwrap();
        assert!(output.exists());
        let args = std::fs::read_to_string(log).unwrap();
        assert!(args.contains("pad=1280:720"));
        assert!(args.contains("format=yuv420p"));

        let err = Tools::none()
            .pad_cover_to_720p(Path::new("/in.jpg"), &output)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Config));
    }
}
