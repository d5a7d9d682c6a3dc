#![forbid(unsafe_code)]

//! Chunked media upload against the negotiated object-storage endpoint.

use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{ErrorKind, PipelineError, PipelineResult};

use super::http::{Body, HttpRequest, HttpResponse};
use super::{UploadContext, with_linear_retry};

const COMPONENT: &str = "upload";

pub const DEFAULT_CHUNK_SIZE: u64 = 22_020_096;
const NEGOTIATION_ATTEMPTS: u32 = 3;
const PROFILE: &str = "iup/bup";
const UPOS_PREFIX: &str = "upos://iupever/";

/// Byte range `[start, end)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkPlan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Splits `total` bytes into `ceil(total / chunk_size)` consecutive ranges.
pub fn plan_chunks(total: u64, chunk_size: u64) -> Vec<ChunkPlan> {
    let chunk_size = chunk_size.max(1);
    let count = total.div_ceil(chunk_size);
    (0..count)
        .map(|index| {
            let start = index * chunk_size;
            ChunkPlan {
                index,
                start,
                end: (start + chunk_size).min(total),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreuploadReply {
    #[serde(rename = "OK", default)]
    pub ok: i64,
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub put_query: Option<String>,
    #[serde(default)]
    pub upos_uri: Option<String>,
}

/// Negotiated upload target.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTarget {
    pub auth: String,
    pub endpoint: String,
    pub filename: String,
    pub chunk_size: u64,
    pub put_query: Option<String>,
}

impl UploadTarget {
    pub fn from_reply(reply: &PreuploadReply, client_filename: &str) -> PipelineResult<Self> {
        if reply.auth.is_empty() || reply.endpoint.is_empty() {
            return Err(PipelineError::new(
                ErrorKind::Upload,
                COMPONENT,
                "preupload reply lacks auth or endpoint",
            ));
        }
        let endpoint = if reply.endpoint.starts_with("//") {
            format!("https:{}", reply.endpoint)
        } else {
            reply.endpoint.clone()
        };
        let filename = reply
            .upos_uri
            .as_deref()
            .and_then(|uri| uri.strip_prefix(UPOS_PREFIX))
            .filter(|name| !name.is_empty())
            .unwrap_or(client_filename)
            .to_string();
        Ok(Self {
            auth: reply.auth.replace("\\u0026", "&"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            filename,
            chunk_size: reply
                .chunk_size
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            put_query: reply.put_query.clone().filter(|query| !query.is_empty()),
        })
    }

    pub fn object_url(&self) -> String {
        format!("{}/iupever/{}", self.endpoint, self.filename)
    }
}

#[derive(Debug, Deserialize)]
struct InitReply {
    #[serde(rename = "OK", default)]
    ok: i64,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(rename = "uploadId", default)]
    upload_id_camel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FinalizeReply {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

/// Name of the local file, announced to preupload and finalize.
pub fn upload_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "video.mp4".to_string())
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn transient_status(step: &str, response: &HttpResponse) -> PipelineError {
    PipelineError::new(
        ErrorKind::Transient,
        COMPONENT,
        format!("{step}: HTTP {}", response.status),
    )
    .with_preview(&response.body)
}

async fn preupload(
    ctx: &UploadContext<'_>,
    name: &str,
    size: u64,
) -> PipelineResult<UploadTarget> {
    let url = ctx.api_url(&format!(
        "/preupload?name={}&size={size}&r=upos&profile={PROFILE}&biz=UGC&ssl=0&version=2.14.0",
        query_escape(name)
    ));
    let response = ctx.send(HttpRequest::new("GET", url)).await?;
    if !response.is_success() {
        return Err(transient_status("preupload", &response));
    }
    let reply: PreuploadReply = response.json()?;
    if reply.ok != 1 {
        return Err(PipelineError::new(
            ErrorKind::Upload,
            COMPONENT,
            format!("preupload refused (OK={})", reply.ok),
        )
        .with_preview(&response.body));
    }
    if !reply.endpoints.is_empty() {
        tracing::debug!(endpoints = ?reply.endpoints, endpoint = %reply.endpoint, "preupload offered endpoints");
    }
    UploadTarget::from_reply(&reply, name)
}

async fn init_upload(ctx: &UploadContext<'_>, target: &UploadTarget) -> PipelineResult<String> {
    let url = format!("{}?uploads&output=json", target.object_url());
    let response = ctx
        .send(HttpRequest::new("POST", url).header("X-Upos-Auth", &target.auth))
        .await?;
    if !response.is_success() {
        return Err(transient_status("upload init", &response));
    }
    let reply: InitReply = response.json()?;
    match (reply.ok, reply.upload_id.or(reply.upload_id_camel)) {
        (1, Some(id)) if !id.is_empty() => Ok(id),
        (ok, _) => Err(PipelineError::new(
            ErrorKind::Upload,
            COMPONENT,
            format!("upload init refused (OK={ok})"),
        )
        .with_preview(&response.body)),
    }
}

async fn put_chunk(
    ctx: &UploadContext<'_>,
    target: &UploadTarget,
    upload_id: &str,
    plan: &ChunkPlan,
    chunks: usize,
    total: u64,
    bytes: &[u8],
) -> PipelineResult<()> {
    let mut url = format!(
        "{}?partNumber={}&uploadId={upload_id}&chunk={}&chunks={chunks}&size={}&start={}&end={}&total={total}",
        target.object_url(),
        plan.index + 1,
        plan.index,
        plan.len(),
        plan.start,
        plan.end,
    );
    if let Some(extra) = &target.put_query {
        url.push('&');
        url.push_str(extra);
    }
    let request = HttpRequest::new("PUT", url)
        .header("X-Upos-Auth", &target.auth)
        .header("Content-Type", "application/octet-stream")
        .body(Body::Bytes(bytes.to_vec()));
    let response = ctx.send(request).await?;
    match response.status {
        200 | 204 => Ok(()),
        _ => Err(transient_status(&format!("chunk {}", plan.index), &response)),
    }
}

async fn read_chunk(file: &mut File, path: &Path, plan: &ChunkPlan) -> PipelineResult<Vec<u8>> {
    let storage = |err: std::io::Error| PipelineError::storage(COMPONENT, path, err);
    file.seek(SeekFrom::Start(plan.start))
        .await
        .map_err(storage)?;
    let mut buffer = vec![0u8; plan.len() as usize];
    file.read_exact(&mut buffer).await.map_err(storage)?;
    Ok(buffer)
}

async fn finalize(
    ctx: &UploadContext<'_>,
    target: &UploadTarget,
    upload_id: &str,
    original_name: &str,
    parts: usize,
) -> PipelineResult<()> {
    let url = format!(
        "{}?output=json&name={}&profile={PROFILE}&uploadId={upload_id}&biz=UGC",
        target.object_url(),
        query_escape(original_name)
    );
    let manifest = json!({
        "parts": (1..=parts)
            .map(|part| json!({"partNumber": part, "eTag": "etag"}))
            .collect::<Vec<_>>()
    });
    let response = ctx
        .send(
            HttpRequest::new("POST", url)
                .header("X-Upos-Auth", &target.auth)
                .body(Body::Json(manifest)),
        )
        .await?;
    if response.status != 200 {
        tracing::warn!(status = response.status, body = %crate::error::preview(&response.body, 256), "finalize not acknowledged");
        return Ok(());
    }
    let reply: FinalizeReply = serde_json::from_str(&response.body).unwrap_or_default();
    tracing::info!(
        bucket = reply.bucket.as_deref().unwrap_or_default(),
        key = reply.key.as_deref().unwrap_or_default(),
        location = reply.location.as_deref().unwrap_or_default(),
        "upload finalized"
    );
    Ok(())
}

async fn commit(ctx: &UploadContext<'_>, filename: &str) -> PipelineResult<()> {
    let url = ctx.api_url(&format!(
        "/intl/videoup/web2/uploading?csrf={}",
        ctx.session.csrf
    ));
    let form = vec![("filename".to_string(), filename.to_string())];
    ctx.api_call::<serde_json::Value>(
        "commit",
        HttpRequest::new("POST", url).body(Body::Form(form)),
        ErrorKind::Upload,
    )
    .await?;
    Ok(())
}

/// Uploads the media file and returns the server-side filename that the
/// publish call refers to.
pub(crate) async fn upload_video(ctx: &UploadContext<'_>, path: &Path) -> PipelineResult<String> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|err| PipelineError::storage(COMPONENT, path, err))?
        .len();
    let name = upload_name(path);
    let name = name.as_str();
    let unit = ctx.timing.retry_unit;

    let target = with_linear_retry("preupload", NEGOTIATION_ATTEMPTS, unit, ctx.cancel, move |_| {
        preupload(ctx, name, size)
    })
    .await
    .map_err(escalate)?;
    let target = &target;
    let upload_id = with_linear_retry("upload init", NEGOTIATION_ATTEMPTS, unit, ctx.cancel, move |_| {
        init_upload(ctx, target)
    })
    .await
    .map_err(escalate)?;

    let plans = plan_chunks(size, target.chunk_size);
    tracing::info!(
        path = %path.display(),
        size,
        chunks = plans.len(),
        chunk_size = target.chunk_size,
        filename = %target.filename,
        "uploading video"
    );
    let mut file = File::open(path)
        .await
        .map_err(|err| PipelineError::storage(COMPONENT, path, err))?;
    let upload_id = upload_id.as_str();
    let chunk_count = plans.len();
    for (position, plan) in plans.iter().enumerate() {
        if position > 0 {
            ctx.pause(ctx.timing.chunk_pause).await?;
        }
        let bytes = read_chunk(&mut file, path, plan).await?;
        let bytes = bytes.as_slice();
        with_linear_retry(
            "chunk upload",
            ctx.config.chunk_upload_retries,
            ctx.timing.chunk_retry_unit,
            ctx.cancel,
            move |_| put_chunk(ctx, target, upload_id, plan, chunk_count, size, bytes),
        )
        .await
        .map_err(escalate)?;
        tracing::debug!(chunk = plan.index, start = plan.start, end = plan.end, "chunk uploaded");
    }

    if let Err(err) = finalize(ctx, target, upload_id, name, chunk_count).await {
        if err.is(ErrorKind::Cancelled) {
            return Err(err);
        }
        tracing::warn!(error = %err, "finalize failed");
    }

    let filename = target.filename.as_str();
    with_linear_retry("commit", NEGOTIATION_ATTEMPTS, unit, ctx.cancel, move |_| {
        commit(ctx, filename)
    })
    .await
    .map_err(escalate)?;
    Ok(target.filename.clone())
}

/// Exhausted transient failures become a fatal `Upload`.
fn escalate(mut err: PipelineError) -> PipelineError {
    if err.is(ErrorKind::Transient) {
        err.kind = ErrorKind::Upload;
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plan_matches_negotiated_size() {
        let plans = plan_chunks(100_663_296, 22_020_096);
        let ranges: Vec<(u64, u64)> = plans.iter().map(|p| (p.start, p.end)).collect();
        assert_eq!(
            ranges,
            vec![
                (0, 22_020_096),
                (22_020_096, 44_040_192),
                (44_040_192, 66_060_288),
                (66_060_288, 88_080_384),
                (88_080_384, 100_663_296),
            ]
        );
    }

    #[test]
    fn chunk_ranges_partition_the_file() {
        for total in [0u64, 1, 2, 7, 22_020_095, 22_020_096, 22_020_097, 100_663_296] {
            for chunk_size in [1u64, 3, 1_000, 22_020_096] {
                let plans = plan_chunks(total, chunk_size);
                assert_eq!(plans.len() as u64, total.div_ceil(chunk_size));
                let mut cursor = 0;
                for (index, plan) in plans.iter().enumerate() {
                    assert_eq!(plan.index, index as u64);
                    assert_eq!(plan.start, cursor);
                    assert!(!plan.is_empty());
                    assert!(plan.len() <= chunk_size);
                    cursor = plan.end;
                }
                assert_eq!(cursor, total);
            }
        }
    }

    #[test]
    fn target_normalizes_preupload_reply() {
        let reply: PreuploadReply = serde_json::from_str(
            r#"{"OK":1,"auth":"ak=1\\u0026cdn=%5B%5D","endpoint":"//upos-sz-upcdnbda2.bilivideo.com","endpoints":["//a","//b"],"chunk_size":10485760,"upos_uri":"upos://iupever/n230101server.mp4","put_query":""}"#,
        )
        .unwrap();
        let target = UploadTarget::from_reply(&reply, "client.mp4").unwrap();
        assert_eq!(target.auth, "ak=1&cdn=%5B%5D");
        assert_eq!(target.endpoint, "https://upos-sz-upcdnbda2.bilivideo.com");
        assert_eq!(target.filename, "n230101server.mp4");
        assert_eq!(target.chunk_size, 10_485_760);
        assert_eq!(target.put_query, None);
        assert_eq!(
            target.object_url(),
            "https://upos-sz-upcdnbda2.bilivideo.com/iupever/n230101server.mp4"
        );
    }

    #[test]
    fn target_defaults() {
        let reply = PreuploadReply {
            ok: 1,
            auth: "a".into(),
            endpoint: "http://127.0.0.1:8080/".into(),
            ..PreuploadReply::default()
        };
        let target = UploadTarget::from_reply(&reply, "client.mp4").unwrap();
        assert_eq!(target.filename, "client.mp4");
        assert_eq!(target.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(target.endpoint, "http://127.0.0.1:8080");
        assert!(UploadTarget::from_reply(&PreuploadReply::default(), "x").is_err());
    }

    #[test]
    fn announced_name_is_the_local_file_name() {
        assert_eq!(
            upload_name(Path::new("/work/chan/abc/abc_1080p.mp4")),
            "abc_1080p.mp4"
        );
        assert_eq!(upload_name(Path::new("/")), "video.mp4");
        assert_eq!(query_escape("My clip #1&2.mp4"), "My+clip+%231%262.mp4");
    }

    #[test]
    fn escalation_only_touches_transient() {
        let transient = PipelineError::new(ErrorKind::Transient, COMPONENT, "HTTP 500");
        assert!(escalate(transient).is(ErrorKind::Upload));
        let auth = PipelineError::new(ErrorKind::Auth, COMPONENT, "expired");
        assert!(escalate(auth).is(ErrorKind::Auth));
    }
}
