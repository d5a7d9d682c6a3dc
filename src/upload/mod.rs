#![forbid(unsafe_code)]

//! Destination uploader.
//!
//! Publishing one video is a fixed choreography: cover first (fatal on
//! failure), subtitles (best effort), the chunked media upload, and finally
//! the publish call that yields the destination `aid`. Every step reports a
//! classified [`PipelineError`]; the verdict lands in `upload_status.json`.

pub mod cover;
pub mod http;
pub mod session;
pub mod subtitle;
pub mod video;

use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BilibiliConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult, preview};
use crate::tools::Tools;
use crate::workdir::{find_any_video_file, mark_upload_failed, mark_uploaded, mark_uploading};

use http::{Body, HttpClient, HttpRequest, HttpResponse};
use session::Session;

const COMPONENT: &str = "upload";

/// Destination codes meaning the cookies are no longer accepted.
const AUTH_CODES: &[i64] = &[-101, -111];

/// Pauses and retry units. Production values come from the configuration;
/// tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct UploadTiming {
    pub chunk_pause: Duration,
    pub chunk_retry_unit: Duration,
    pub retry_unit: Duration,
}

impl UploadTiming {
    pub fn from_config(config: &BilibiliConfig) -> Self {
        Self {
            chunk_pause: Duration::from_millis(500),
            chunk_retry_unit: Duration::from_secs(config.chunk_retry_backoff_seconds),
            retry_unit: Duration::from_secs(1),
        }
    }
}

/// Everything needed to publish one downloaded video.
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub dir: &'a Path,
    pub video_path: Option<&'a Path>,
    pub title: &'a str,
    pub description: &'a str,
    pub subtitle_paths: &'a [PathBuf],
    pub account: &'a str,
}

/// Standard `{code, message, data}` envelope of the JSON API.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiReply<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

/// Borrowed state shared by every step of one upload.
pub(crate) struct UploadContext<'a> {
    pub http: &'a HttpClient,
    pub session: &'a Session,
    pub config: &'a BilibiliConfig,
    pub tools: &'a Tools,
    pub timing: &'a UploadTiming,
    pub cancel: &'a CancellationToken,
}

impl UploadContext<'_> {
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base.trim_end_matches('/'))
    }

    /// Sends `request` with the session headers for its host.
    pub async fn send(&self, request: HttpRequest) -> PipelineResult<HttpResponse> {
        let mut request = request;
        let mut headers = self.session.headers_for(&request.url);
        headers.append(&mut request.headers);
        request.headers = headers;
        self.http.send(request, self.cancel).await
    }

    /// Sends an API request and unwraps the envelope, mapping non-zero codes
    /// onto `kind` (or `Auth` for session codes).
    pub async fn api_call<T>(
        &self,
        step: &str,
        request: HttpRequest,
        kind: ErrorKind,
    ) -> PipelineResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.send(request).await?;
        if response.status >= 500 {
            return Err(PipelineError::new(
                ErrorKind::Transient,
                COMPONENT,
                format!("{step}: HTTP {}", response.status),
            )
            .with_preview(&response.body));
        }
        let reply: ApiReply<T> = response.json()?;
        if reply.code != 0 {
            let kind = if AUTH_CODES.contains(&reply.code) {
                ErrorKind::Auth
            } else {
                kind
            };
            return Err(PipelineError::new(
                kind,
                COMPONENT,
                format!("{step}: code {} {}", reply.code, reply.message),
            )
            .with_code(reply.code)
            .with_preview(&response.body));
        }
        Ok(reply.data)
    }

    pub async fn pause(&self, duration: Duration) -> PipelineResult<()> {
        sleep_or_cancel(duration, self.cancel).await
    }
}

pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> PipelineResult<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(PipelineError::cancelled(COMPONENT)),
    }
}

/// Runs `op` up to `attempts` times, sleeping `attempt × unit` between
/// failures. Cancellation and auth failures are never retried.
pub(crate) async fn with_linear_retry<T, F, Fut>(
    step: &str,
    attempts: u32,
    unit: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt < attempts
                    && !err.is(ErrorKind::Cancelled)
                    && !err.is(ErrorKind::Auth) =>
            {
                tracing::warn!(step, attempt, attempts, error = %err, "retrying");
                sleep_or_cancel(unit.saturating_mul(attempt), cancel).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Undoes shell quoting that sometimes leaks into configured paths.
pub fn unescape_shell_path(raw: &str) -> String {
    raw.replace("\\ ", " ")
        .replace("\\#", "#")
        .replace("\\\"", "\"")
        .replace("\\'", "'")
}

/// Local files a publish needs, checked before any bytes are sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Preflight {
    pub video_path: PathBuf,
    pub cover_path: PathBuf,
    pub subtitle_paths: Vec<PathBuf>,
}

pub fn preflight(request: &UploadRequest<'_>) -> PipelineResult<Preflight> {
    let declared = request
        .video_path
        .map(|path| PathBuf::from(unescape_shell_path(&path.to_string_lossy())));
    let video_path = match declared.filter(|path| path.is_file()) {
        Some(path) => path,
        None => find_any_video_file(request.dir)?.ok_or_else(|| {
            PipelineError::new(
                ErrorKind::Upload,
                COMPONENT,
                format!("no video file in {}", request.dir.display()),
            )
        })?,
    };
    let cover_path = cover::find_cover(request.dir, &video_path).ok_or_else(|| {
        PipelineError::new(
            ErrorKind::MissingCover,
            COMPONENT,
            format!("no cover image next to {}", video_path.display()),
        )
    })?;
    let subtitle_paths = request
        .subtitle_paths
        .iter()
        .map(|path| PathBuf::from(unescape_shell_path(&path.to_string_lossy())))
        .filter(|path| {
            let exists = path.is_file();
            if !exists {
                tracing::warn!(path = %path.display(), "subtitle listed in status is missing");
            }
            exists
        })
        .collect();
    Ok(Preflight {
        video_path,
        cover_path,
        subtitle_paths,
    })
}

/// JSON body of the publish call.
pub fn publish_body(
    title: &str,
    cover_url: &str,
    description: &str,
    filename: &str,
    subtitle_url: Option<&str>,
) -> serde_json::Value {
    let mut body = json!({
        "title": title,
        "cover": cover_url,
        "desc": description,
        "no_reprint": true,
        "filename": filename.strip_suffix(".mp4").unwrap_or(filename),
        "copyright": 1,
        "from_spmid": "333.1011",
        "subtitle_id": null,
        "subtitle_lang_id": null,
    });
    if let Some(url) = subtitle_url {
        body["subtitle_url"] = json!(url);
        body["subtitle_lang_id"] = json!(3);
    }
    body
}

fn aid_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) if !text.is_empty() => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub struct Uploader {
    config: BilibiliConfig,
    http: HttpClient,
    tools: Tools,
    timing: UploadTiming,
}

impl Uploader {
    pub fn new(config: &BilibiliConfig, tools: Tools) -> Self {
        Self {
            http: HttpClient::new(Duration::from_secs(config.request_timeout_seconds)),
            timing: UploadTiming::from_config(config),
            config: config.clone(),
            tools,
        }
    }

    pub fn with_timing(mut self, timing: UploadTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Publishes one video and records the outcome in `upload_status.json`.
    pub async fn upload(
        &self,
        request: &UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        mark_uploading(request.dir, request.account)?;
        match self.run(request, cancel).await {
            Ok(aid) => {
                mark_uploaded(request.dir, &aid, request.account)?;
                tracing::info!(dir = %request.dir.display(), account = request.account, aid = %aid, "video published");
                Ok(aid)
            }
            Err(err) => {
                tracing::error!(
                    dir = %request.dir.display(),
                    account = request.account,
                    kind = %err.kind,
                    code = ?err.code,
                    error = %err,
                    preview = err.preview.as_deref().unwrap_or_default(),
                    "upload failed"
                );
                if let Err(status_err) =
                    mark_upload_failed(request.dir, request.account, &err.status_label())
                {
                    tracing::warn!(error = %status_err, "could not record upload failure");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let session = Session::load(request.account, &self.config)?;
        let files = preflight(request)?;
        let ctx = UploadContext {
            http: &self.http,
            session: &session,
            config: &self.config,
            tools: &self.tools,
            timing: &self.timing,
            cancel,
        };

        self.prime_session(&ctx).await?;
        let cover_url =
            cover::upload_cover(&ctx, request.dir, &files.cover_path, &files.video_path).await?;
        let subtitle_url = subtitle::upload_subtitles(&ctx, &files.subtitle_paths).await?;
        let filename = video::upload_video(&ctx, &files.video_path).await?;
        self.publish(
            &ctx,
            request,
            &cover_url,
            &filename,
            subtitle_url.as_deref(),
        )
        .await
    }

    /// Visits the upload page so the session cookies are warm. Failures are
    /// only logged.
    async fn prime_session(&self, ctx: &UploadContext<'_>) -> PipelineResult<()> {
        let url = format!(
            "{}/archive/new",
            self.config.studio_base.trim_end_matches('/')
        );
        match ctx.send(HttpRequest::new("GET", &url)).await {
            Ok(response) if response.status == 200 => {}
            Ok(response) => {
                tracing::warn!(url = %url, status = response.status, "upload page did not answer 200");
            }
            Err(err) if err.is(ErrorKind::Cancelled) => return Err(err),
            Err(err) => tracing::warn!(url = %url, error = %err, "could not prime session"),
        }
        Ok(())
    }

    async fn publish(
        &self,
        ctx: &UploadContext<'_>,
        request: &UploadRequest<'_>,
        cover_url: &str,
        filename: &str,
        subtitle_url: Option<&str>,
    ) -> PipelineResult<String> {
        let body = publish_body(
            request.title,
            cover_url,
            request.description,
            filename,
            subtitle_url,
        );
        let url = ctx.api_url(&format!("/intl/videoup/web2/add?csrf={}", ctx.session.csrf));
        let response = ctx
            .send(HttpRequest::new("POST", url).body(Body::Json(body.clone())))
            .await?;
        let request_preview = preview(&body.to_string(), 256);
        let reply: ApiReply<serde_json::Value> = response.json().map_err(|err| {
            PipelineError::new(ErrorKind::Publish, COMPONENT, err.message).with_preview(&format!(
                "request={request_preview} response={}",
                response.body
            ))
        })?;
        if reply.code != 0 {
            let kind = if AUTH_CODES.contains(&reply.code) {
                ErrorKind::Auth
            } else {
                ErrorKind::Publish
            };
            return Err(PipelineError::new(
                kind,
                COMPONENT,
                format!("publish rejected: code {} {}", reply.code, reply.message),
            )
            .with_code(reply.code)
            .with_preview(&format!(
                "request={request_preview} response={}",
                response.body
            )));
        }
        reply
            .data
            .as_ref()
            .and_then(|data| data.get("aid"))
            .and_then(aid_to_string)
            .ok_or_else(|| {
                PipelineError::new(ErrorKind::Publish, COMPONENT, "publish reply without aid")
                    .with_preview(&response.body)
            })
    }
}
