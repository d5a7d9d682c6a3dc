#![forbid(unsafe_code)]

//! Cover lookup, MIME sniffing and the upload with its dimension fallback.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PipelineError, PipelineResult};

use super::http::{HttpRequest, Multipart};
use super::{ApiReply, UploadContext};

const COMPONENT: &str = "upload";

/// Destination code for a cover with unacceptable dimensions.
pub const COVER_DIMENSION_REJECTED: i64 = -702;

const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

/// First existing cover candidate: same basename as the video, the bare
/// video id, `cover.*`, then `thumbnail.jpg`.
pub fn find_cover(dir: &Path, video_path: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(stem) = video_path.file_stem().and_then(|stem| stem.to_str()) {
        candidates.push(dir.join(format!("{stem}.jpg")));
        if let Some((id, suffix)) = stem.rsplit_once('_')
            && suffix.ends_with('p')
        {
            candidates.push(dir.join(format!("{id}.jpg")));
        }
    }
    candidates.extend(
        COVER_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("cover.{ext}"))),
    );
    candidates.push(dir.join("thumbnail.jpg"));
    candidates.into_iter().find(|path| path.is_file())
}

/// MIME type from magic bytes, then the extension, then JPEG.
pub fn detect_image_mime(bytes: &[u8], path: &Path) -> String {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return "image/png".to_string();
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg".to_string();
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "image/webp".to_string();
    }
    mime_guess::from_path(path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string())
}

pub fn data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

#[derive(Debug, Default, Deserialize)]
struct CoverData {
    #[serde(default)]
    url: Option<String>,
}

enum CoverVerdict {
    Accepted(String),
    Rejected { code: i64, body: String },
}

async fn post_cover(ctx: &UploadContext<'_>, path: &Path) -> PipelineResult<CoverVerdict> {
    let bytes = fs::read(path).map_err(|err| PipelineError::storage(COMPONENT, path, err))?;
    let mime = detect_image_mime(&bytes, path);
    let form = Multipart::new().text("cover", &data_uri(&bytes, &mime));
    let url = ctx.api_url(&format!(
        "/intl/videoup/web2/cover?csrf={}",
        ctx.session.csrf
    ));
    let response = ctx
        .send(HttpRequest::new("POST", url).multipart(form))
        .await?;
    if response.status >= 500 {
        return Err(PipelineError::new(
            ErrorKind::Transient,
            COMPONENT,
            format!("cover upload: HTTP {}", response.status),
        )
        .with_preview(&response.body));
    }
    let reply: ApiReply<CoverData> = response.json()?;
    let top_level_url = serde_json::from_str::<CoverData>(&response.body)
        .ok()
        .and_then(|data| data.url);
    let url = reply.data.and_then(|data| data.url).or(top_level_url);
    match (reply.code, url) {
        (0, Some(url)) if !url.is_empty() => Ok(CoverVerdict::Accepted(url)),
        (code, _) => Ok(CoverVerdict::Rejected {
            code,
            body: response.body,
        }),
    }
}

/// Uploads the cover. A dimension rejection is compensated by letterboxing
/// the image to 1280x720, then by the video's first frame.
pub(crate) async fn upload_cover(
    ctx: &UploadContext<'_>,
    dir: &Path,
    cover_path: &Path,
    video_path: &Path,
) -> PipelineResult<String> {
    let (mut code, mut body) = match post_cover(ctx, cover_path).await? {
        CoverVerdict::Accepted(url) => return Ok(url),
        CoverVerdict::Rejected { code, body } => (code, body),
    };

    if code == COVER_DIMENSION_REJECTED && ctx.tools.has_transcoder() {
        tracing::warn!(cover = %cover_path.display(), "cover rejected for its dimensions, padding to 1280x720");
        let padded = dir.join("cover_1280x720.jpg");
        ctx.tools.pad_cover_to_720p(cover_path, &padded).await?;
        match post_cover(ctx, &padded).await? {
            CoverVerdict::Accepted(url) => return Ok(url),
            CoverVerdict::Rejected {
                code: next_code,
                body: next_body,
            } => {
                code = next_code;
                body = next_body;
            }
        }

        if video_path.is_file() {
            tracing::warn!(video = %video_path.display(), "padded cover rejected, trying the first video frame");
            let frame = dir.join("cover_frame.jpg");
            ctx.tools.extract_first_frame(video_path, &frame).await?;
            match post_cover(ctx, &frame).await? {
                CoverVerdict::Accepted(url) => return Ok(url),
                CoverVerdict::Rejected {
                    code: next_code,
                    body: next_body,
                } => {
                    code = next_code;
                    body = next_body;
                }
            }
        }
    }

    Err(PipelineError::new(
        ErrorKind::Upload,
        COMPONENT,
        format!("cover rejected with code {code}"),
    )
    .with_code(code)
    .with_preview(&body))
}
