#![forbid(unsafe_code)]

//! Download-side pacing: a short rest after every N successful downloads and
//! a long rest once bot detection has fired often enough.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::YoutubeConfig;
use crate::error::{PipelineError, PipelineResult};

const COMPONENT: &str = "rest";

/// Upper bound of the random stretch applied to every rest.
const MAX_JITTER: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestPolicy {
    /// Zero disables the periodic rest.
    pub downloads_before_rest: u32,
    pub download_rest: Duration,
    /// Zero disables the bot rest.
    pub bot_threshold: u32,
    pub bot_rest: Duration,
}

impl RestPolicy {
    pub fn from_config(config: &YoutubeConfig) -> Self {
        Self {
            downloads_before_rest: config.video_limit_before_rest,
            download_rest: Duration::from_secs(config.video_limit_rest_duration * 60),
            bot_threshold: config.bot_detection_threshold,
            bot_rest: Duration::from_secs(config.bot_detection_rest_duration * 60),
        }
    }
}

/// `base` stretched by a random 0–10%.
pub fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..=MAX_JITTER);
    base.mul_f64(factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestReason {
    DownloadLimit,
    BotDetection,
}

impl RestReason {
    fn as_str(self) -> &'static str {
        match self {
            RestReason::DownloadLimit => "download limit",
            RestReason::BotDetection => "bot detection",
        }
    }
}

#[derive(Debug)]
pub struct RestController {
    policy: RestPolicy,
    downloads: u32,
    bot_hits: u32,
}

impl RestController {
    pub fn new(policy: RestPolicy) -> Self {
        Self {
            policy,
            downloads: 0,
            bot_hits: 0,
        }
    }

    pub fn downloads_since_rest(&self) -> u32 {
        self.downloads
    }

    pub fn bot_hits(&self) -> u32 {
        self.bot_hits
    }

    /// Feeds one download outcome; returns the rest that is now due, if any.
    /// Any rest starts both counters over at zero; the long rest covers the
    /// short one.
    pub fn observe(&mut self, succeeded: bool, bot_detected: bool) -> Option<(RestReason, Duration)> {
        if bot_detected {
            self.bot_hits += 1;
        }
        if succeeded {
            self.downloads += 1;
        }
        if self.policy.bot_threshold > 0 && self.bot_hits >= self.policy.bot_threshold {
            self.bot_hits = 0;
            self.downloads = 0;
            return Some((RestReason::BotDetection, jittered(self.policy.bot_rest)));
        }
        if self.policy.downloads_before_rest > 0
            && self.downloads >= self.policy.downloads_before_rest
        {
            self.downloads = 0;
            return Some((RestReason::DownloadLimit, jittered(self.policy.download_rest)));
        }
        None
    }

    /// Records an outcome and sleeps through any rest it triggers.
    pub async fn after_download(
        &mut self,
        succeeded: bool,
        bot_detected: bool,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<Duration>> {
        let Some((reason, duration)) = self.observe(succeeded, bot_detected) else {
            return Ok(None);
        };
        tracing::info!(
            reason = reason.as_str(),
            minutes = duration.as_secs() / 60,
            "resting before the next download"
        );
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => return Err(PipelineError::cancelled(COMPONENT)),
        }
        tracing::info!(reason = reason.as_str(), "rest finished");
        Ok(Some(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestPolicy {
        RestPolicy::from_config(&YoutubeConfig::default())
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(600);
        for _ in 0..200 {
            let value = jittered(base);
            assert!(value >= base);
            assert!(value <= Duration::from_secs(660));
        }
    }

    #[test]
    fn periodic_rest_after_configured_downloads() {
        let mut controller = RestController::new(policy());
        for _ in 0..9 {
            assert_eq!(controller.observe(true, false), None);
        }
        let (reason, duration) = controller.observe(true, false).unwrap();
        assert_eq!(reason, RestReason::DownloadLimit);
        assert!(duration >= Duration::from_secs(3600));
        assert!(duration <= Duration::from_secs(3960));
        assert_eq!(controller.downloads_since_rest(), 0);
        assert_eq!(controller.observe(false, false), None);
    }

    #[test]
    fn disabled_limits_never_rest() {
        let mut controller = RestController::new(RestPolicy {
            downloads_before_rest: 0,
            bot_threshold: 0,
            ..policy()
        });
        for _ in 0..50 {
            assert_eq!(controller.observe(true, true), None);
        }
    }

    #[test]
    fn bot_rest_also_clears_the_download_counter() {
        let mut controller = RestController::new(RestPolicy {
            downloads_before_rest: 2,
            bot_threshold: 1,
            ..policy()
        });
        assert_eq!(controller.observe(true, false), None);
        let (reason, _) = controller.observe(true, true).unwrap();
        assert_eq!(reason, RestReason::BotDetection);
        assert_eq!(controller.downloads_since_rest(), 0);
        assert_eq!(controller.observe(true, false), None);
    }

    #[tokio::test(start_paused = true)]
    async fn tenth_bot_detection_triggers_the_long_rest() {
        let mut controller = RestController::new(policy());
        let cancel = CancellationToken::new();
        for _ in 0..9 {
            assert_eq!(controller.after_download(false, true, &cancel).await.unwrap(), None);
        }
        assert_eq!(controller.bot_hits(), 9);

        let started = tokio::time::Instant::now();
        let rested = controller
            .after_download(false, true, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(rested >= Duration::from_secs(480 * 60));
        assert!(rested <= Duration::from_secs(528 * 60));
        assert!(started.elapsed() >= rested);
        assert_eq!(controller.bot_hits(), 0);
    }

    #[tokio::test]
    async fn rest_is_cancellable() {
        let mut controller = RestController::new(RestPolicy {
            downloads_before_rest: 1,
            ..policy()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller.after_download(true, false, &cancel).await.unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Cancelled));
    }
}
