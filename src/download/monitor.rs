#![forbid(unsafe_code)]

//! Runs one extractor invocation under the byte-delta stall watch.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::workdir::download_bytes;

const COMPONENT: &str = "download";

/// Tracks the aggregate size of a work directory between ticks.
#[derive(Debug)]
pub struct ByteWatch {
    last_total: u64,
    last_change: Instant,
    stall_timeout: Duration,
}

impl ByteWatch {
    pub fn new(initial_total: u64, now: Instant, stall_timeout: Duration) -> Self {
        Self {
            last_total: initial_total,
            last_change: now,
            stall_timeout,
        }
    }

    /// Records a new total; returns true once it has been flat for the whole
    /// stall window.
    pub fn observe(&mut self, total: u64, now: Instant) -> bool {
        if total != self.last_total {
            self.last_total = total;
            self.last_change = now;
            return false;
        }
        now.duration_since(self.last_change) >= self.stall_timeout
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_change)
    }
}

/// What one extractor process left behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Killed by the stall watch.
    pub stalled: bool,
    pub output: String,
}

impl RunOutcome {
    pub fn has_error_line(&self) -> bool {
        self.output.lines().any(|line| line.contains("ERROR:"))
    }
}

pub struct MonitorSettings<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub dir: &'a Path,
    pub tick: Duration,
    pub stall_timeout: Duration,
    pub video_id: &'a str,
    pub strategy: usize,
}

/// Spawns the extractor in its own process group and waits for it, killing
/// the whole group if the directory stops growing or the scope is cancelled.
pub async fn run_extractor(
    settings: MonitorSettings<'_>,
    cancel: &CancellationToken,
) -> PipelineResult<RunOutcome> {
    let mut command = Command::new(settings.program);
    command
        .args(settings.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        PipelineError::new(
            ErrorKind::Extractor,
            COMPONENT,
            format!("could not start {}: {err}", settings.program.display()),
        )
        .with_source(err)
    })?;
    let pid = child.id();

    let buffer = Arc::new(Mutex::new(String::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(
            stdout,
            "stdout",
            Arc::clone(&buffer),
            settings.video_id.to_string(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(
            stderr,
            "stderr",
            Arc::clone(&buffer),
            settings.video_id.to_string(),
        ));
    }

    let start = Instant::now();
    let mut watch = ByteWatch::new(
        download_bytes(settings.dir).unwrap_or(0),
        start,
        settings.stall_timeout,
    );
    let mut ticker = tokio::time::interval_at(start + settings.tick, settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stalled = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|err| {
                    PipelineError::new(ErrorKind::Transient, COMPONENT, format!("waiting for extractor: {err}"))
                        .with_source(err)
                })?;
            }
            _ = ticker.tick() => {
                let total = match download_bytes(settings.dir) {
                    Ok(total) => total,
                    Err(err) => {
                        tracing::warn!(video_id = settings.video_id, error = %err, "could not measure download directory");
                        continue;
                    }
                };
                let now = Instant::now();
                if watch.observe(total, now) {
                    tracing::warn!(
                        video_id = settings.video_id,
                        strategy = settings.strategy,
                        total_bytes = total,
                        idle_secs = watch.idle_for(now).as_secs(),
                        "no byte progress, killing extractor process group"
                    );
                    kill_group(pid);
                    stalled = true;
                    break child.wait().await.map_err(|err| {
                        PipelineError::new(ErrorKind::Transient, COMPONENT, format!("reaping extractor: {err}"))
                            .with_source(err)
                    })?;
                }
                tracing::debug!(video_id = settings.video_id, total_bytes = total, "download progress tick");
            }
            _ = cancel.cancelled() => {
                kill_group(pid);
                let _ = child.wait().await;
                for reader in readers {
                    reader.abort();
                }
                return Err(PipelineError::cancelled(COMPONENT));
            }
        }
    };

    for reader in readers {
        if let Err(err) = reader.await {
            tracing::debug!(error = %err, "extractor output reader ended abnormally");
        }
    }
    let output = std::mem::take(&mut *buffer.lock());
    Ok(RunOutcome {
        exit_code: status.code(),
        success: status.success() && !stalled,
        stalled,
        output,
    })
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, error = %err, "killpg failed");
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: &'static str,
    buffer: Arc<Mutex<String>>,
    video_id: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\n');
        loop {
            match segments.next_segment().await {
                Ok(Some(raw)) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches('\r');
                    log_line(&video_id, stream, line);
                    let mut buffer = buffer.lock();
                    buffer.push_str(line);
                    buffer.push('\n');
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(video_id = %video_id, stream, error = %err, "extractor stream closed");
                    break;
                }
            }
        }
    })
}

fn log_line(video_id: &str, stream: &str, line: &str) {
    if line.contains("ERROR:") {
        tracing::warn!(video_id, stream, line, "extractor error output");
    } else if line.starts_with("[download]") && line.contains('%') {
        tracing::debug!(video_id, stream, line, "extractor progress");
    } else if line.starts_with("[download] Destination")
        || line.starts_with("[Merger]")
        || line.contains("WARNING:")
    {
        tracing::info!(video_id, stream, line, "extractor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::install_script;
    use tempfile::tempdir;

    #[test]
    fn byte_watch_flags_flat_totals() {
        let start = Instant::now();
        let mut watch = ByteWatch::new(0, start, Duration::from_secs(120));
        assert!(!watch.observe(10_000_000, start + Duration::from_secs(60)));
        assert!(!watch.observe(10_000_000, start + Duration::from_secs(120)));
        assert!(watch.observe(10_000_000, start + Duration::from_secs(180)));
        assert!(!watch.observe(10_000_001, start + Duration::from_secs(240)));
    }

    fn settings<'a>(program: &'a Path, dir: &'a Path, args: &'a [String]) -> MonitorSettings<'a> {
        MonitorSettings {
            program,
            args,
            dir,
            tick: Duration::from_millis(50),
            stall_timeout: Duration::from_millis(250),
            video_id: "vid",
            strategy: 1,
        }
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let dir = tempdir().unwrap();
        let script = install_script(
            dir.path(),
            "yt-dlp",
            "echo '[download]  50.0% of 10MiB'\necho 'ERROR: boom' >&2\nexit 3",
        );
        let outcome = run_extractor(settings(&script, dir.path(), &[]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success);
        assert!(!outcome.stalled);
        assert!(outcome.output.contains("50.0%"));
        assert!(outcome.has_error_line());
    }

    #[tokio::test]
    async fn kills_group_when_bytes_stop_moving() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let script = install_script(
            dir.path(),
            "yt-dlp",
            &format!(
                "head -c 4096 /dev/zero > \"{}/vid_1080p.mp4.part\"\nsleep 30",
                work.display()
            ),
        );
        let started = std::time::Instant::now();
        let outcome = run_extractor(settings(&script, &work, &[]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.stalled);
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempdir().unwrap();
        let script = install_script(dir.path(), "yt-dlp", "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut slow = settings(&script, dir.path(), &[]);
        slow.stall_timeout = Duration::from_secs(60);
        let started = std::time::Instant::now();
        let err = run_extractor(slow, &cancel).await.unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
