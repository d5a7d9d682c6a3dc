#![forbid(unsafe_code)]

//! Per-account daily upload quota, persisted under `.global/`.
//!
//! Counters live in `upload_quota.json` as
//! `{account: {daily_count, daily_window_start}}`. A counter whose window
//! started on an earlier local day is reset before it is read.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::workdir::{WorkTree, read_json, write_json_atomic};

const COMPONENT: &str = "quota";

pub const UPLOAD_QUOTA_FILE: &str = "upload_quota.json";

/// Slack added after midnight so a wake-up never lands on the old day.
const RESET_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountQuota {
    pub daily_count: u32,
    pub daily_window_start: NaiveDate,
}

type QuotaFile = BTreeMap<String, AccountQuota>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Ok,
    Full,
}

/// Source of "now". Tests replace it to move across day boundaries.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// First instant of the next local day.
pub fn next_reset(now: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .unwrap_or_else(|| now + ChronoDuration::hours(1))
}

pub struct QuotaService {
    path: PathBuf,
    accounts: Vec<String>,
    limit: u32,
    clock: Clock,
    state: Mutex<QuotaFile>,
}

impl QuotaService {
    pub fn open(tree: &WorkTree, accounts: Vec<String>, limit: u32) -> PipelineResult<Self> {
        let path = tree.global_dir().join(UPLOAD_QUOTA_FILE);
        let state: QuotaFile = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            accounts,
            limit,
            clock: system_clock(),
            state: Mutex::new(state),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    fn today(&self) -> NaiveDate {
        (self.clock)().date_naive()
    }

    /// Resets stale windows and persists the file when anything changed.
    fn roll_over(&self, state: &mut QuotaFile, today: NaiveDate) -> PipelineResult<()> {
        let mut changed = false;
        for quota in state.values_mut() {
            if quota.daily_window_start != today {
                *quota = AccountQuota {
                    daily_count: 0,
                    daily_window_start: today,
                };
                changed = true;
            }
        }
        if changed {
            write_json_atomic(&self.path, &*state)?;
        }
        Ok(())
    }

    pub fn count(&self, account: &str) -> PipelineResult<u32> {
        let today = self.today();
        let mut state = self.state.lock();
        self.roll_over(&mut state, today)?;
        Ok(state.get(account).map_or(0, |quota| quota.daily_count))
    }

    pub fn try_account(&self, account: &str) -> PipelineResult<QuotaCheck> {
        Ok(if self.count(account)? < self.limit {
            QuotaCheck::Ok
        } else {
            QuotaCheck::Full
        })
    }

    /// Counts one successful publish against `account`.
    pub fn record_success(&self, account: &str) -> PipelineResult<u32> {
        let today = self.today();
        let mut state = self.state.lock();
        self.roll_over(&mut state, today)?;
        let quota = state.entry(account.to_string()).or_insert(AccountQuota {
            daily_count: 0,
            daily_window_start: today,
        });
        quota.daily_count += 1;
        let count = quota.daily_count;
        write_json_atomic(&self.path, &*state)?;
        tracing::debug!(account, count, limit = self.limit, "upload counted against quota");
        Ok(count)
    }

    /// Random account with room left today, or `None` when all are full.
    pub fn choose_account(&self) -> PipelineResult<Option<String>> {
        let mut open = Vec::new();
        for account in &self.accounts {
            if self.try_account(account)? == QuotaCheck::Ok {
                open.push(account.clone());
            }
        }
        Ok(open.choose(&mut rand::thread_rng()).cloned())
    }

    /// Returns an account with room left, sleeping until the next local day
    /// whenever every candidate is full. With `pinned` set only that account
    /// is considered.
    pub async fn acquire(
        &self,
        pinned: Option<&str>,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        loop {
            let chosen = match pinned {
                Some(account) => (self.try_account(account)? == QuotaCheck::Ok)
                    .then(|| account.to_string()),
                None => self.choose_account()?,
            };
            if let Some(account) = chosen {
                return Ok(account);
            }
            let now = (self.clock)();
            let wake = next_reset(now);
            let wait = (wake - now).to_std().unwrap_or_default() + RESET_SLACK;
            tracing::info!(
                limit = self.limit,
                pinned = pinned.unwrap_or_default(),
                resume_at = %wake,
                "every upload account is at its daily quota, sleeping"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(PipelineError::cancelled(COMPONENT)),
            }
        }
    }
}
