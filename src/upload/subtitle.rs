#![forbid(unsafe_code)]

//! Best-effort subtitle upload through a one-time OSS form policy.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::subtitles::StyledSubtitles;

use super::http::{HttpRequest, Multipart};
use super::{UploadContext, with_linear_retry};

const COMPONENT: &str = "upload";
const SUBTITLE_ATTEMPTS: u32 = 3;

/// Name of a pre-rendered styled subtitle document, used verbatim.
pub const STYLED_SUBTITLES_FILE: &str = "styled_subtitles.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OssToken {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(rename = "OSSAccessKeyId", default)]
    pub access_key_id: String,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub success_action_status: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Number(number) => number.to_string(),
        _ => String::new(),
    })
}

/// `starts-with $key` prefix from a base64 OSS policy document.
pub fn policy_key_prefix(policy: &str) -> Option<String> {
    let decoded = STANDARD.decode(policy.trim()).ok()?;
    let document: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    document
        .get("conditions")?
        .as_array()?
        .iter()
        .filter_map(|condition| condition.as_array())
        .find_map(|condition| match condition.as_slice() {
            [op, field, prefix]
                if op.as_str() == Some("starts-with") && field.as_str() == Some("$key") =>
            {
                prefix.as_str().map(str::to_string)
            }
            _ => None,
        })
}

/// Object key to upload under. A key that is only a prefix gets a
/// `subtitle-{unix_ms}.json` name appended.
pub fn resolve_object_key(token: &OssToken, unix_ms: i64) -> String {
    let key = token
        .key
        .clone()
        .filter(|key| !key.is_empty())
        .or_else(|| token.key_prefix.clone())
        .unwrap_or_default();
    let looks_final = !key.is_empty() && !key.ends_with('_') && key.contains("subtitle-");
    if looks_final {
        return key;
    }
    let prefix = policy_key_prefix(&token.policy).unwrap_or(key);
    format!("{prefix}subtitle-{unix_ms}.json")
}

/// JSON payload for the first SRT: a sibling `styled_subtitles.json` if one
/// exists, else the SRT converted with the default style.
pub fn styled_payload(srt_path: &Path) -> PipelineResult<Vec<u8>> {
    if let Some(dir) = srt_path.parent() {
        let prepared = dir.join(STYLED_SUBTITLES_FILE);
        if prepared.is_file() {
            return fs::read(&prepared)
                .map_err(|err| PipelineError::storage(COMPONENT, &prepared, err));
        }
    }
    let content = fs::read_to_string(srt_path)
        .map_err(|err| PipelineError::storage(COMPONENT, srt_path, err))?;
    serde_json::to_vec(&StyledSubtitles::from_srt(&content)).map_err(|err| {
        PipelineError::new(ErrorKind::Upload, COMPONENT, format!("encoding subtitles: {err}"))
    })
}

async fn upload_once(ctx: &UploadContext<'_>, payload: &[u8]) -> PipelineResult<String> {
    let token_url = ctx.api_url(&format!(
        "/intl/videoup/web2/upload/subtitle/token?csrf={}",
        ctx.session.csrf
    ));
    let token: OssToken = ctx
        .api_call("subtitle token", HttpRequest::new("GET", token_url), ErrorKind::Upload)
        .await?
        .ok_or_else(|| PipelineError::new(ErrorKind::Upload, COMPONENT, "subtitle token reply without data"))?;
    if token.host.is_empty() {
        return Err(PipelineError::new(
            ErrorKind::Upload,
            COMPONENT,
            "subtitle token without host",
        ));
    }

    let key = resolve_object_key(&token, Utc::now().timestamp_millis());
    let host = if token.host.starts_with("//") {
        format!("https:{}", token.host)
    } else {
        token.host.clone()
    };
    let form = Multipart::new()
        .text("key", &key)
        .text("OSSAccessKeyId", &token.access_key_id)
        .text("policy", &token.policy)
        .text("signature", &token.signature)
        .text("success_action_status", &token.success_action_status)
        .text("Content-Type", "application/octet-stream")
        .file("file", "subtitle.json", "application/octet-stream", payload);
    let response = ctx
        .send(HttpRequest::new("POST", host).multipart(form))
        .await?;
    if response.status != 200 && response.status != 204 {
        return Err(PipelineError::new(
            ErrorKind::Transient,
            COMPONENT,
            format!("subtitle object upload: HTTP {}", response.status),
        )
        .with_preview(&response.body));
    }
    Ok(key)
}

/// Uploads the first SRT in `paths`. Any failure degrades to `None`; only
/// cancellation propagates.
pub(crate) async fn upload_subtitles(
    ctx: &UploadContext<'_>,
    paths: &[PathBuf],
) -> PipelineResult<Option<String>> {
    let Some(srt) = paths
        .iter()
        .find(|path| path.extension().is_some_and(|ext| ext == "srt"))
    else {
        return Ok(None);
    };
    let payload = match styled_payload(srt) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(path = %srt.display(), error = %err, "subtitle skipped");
            return Ok(None);
        }
    };
    let payload = &payload;
    let result = with_linear_retry(
        "subtitle upload",
        SUBTITLE_ATTEMPTS,
        ctx.timing.retry_unit,
        ctx.cancel,
        move |_| upload_once(ctx, payload),
    )
    .await;
    match result {
        Ok(key) => {
            tracing::info!(key = %key, "subtitle uploaded");
            Ok(Some(key))
        }
        Err(err) if err.is(ErrorKind::Cancelled) => Err(err),
        Err(err) => {
            tracing::warn!(error = %err, "subtitle upload failed, publishing without subtitles");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn policy_with_prefix(prefix: &str) -> String {
        let document = serde_json::json!({
            "expiration": "2030-01-01T00:00:00Z",
            "conditions": [
                ["content-length-range", 0, 10485760],
                ["starts-with", "$key", prefix]
            ]
        });
        STANDARD.encode(document.to_string())
    }

    #[test]
    fn prefix_keys_are_completed_from_the_policy() {
        let token = OssToken {
            key: Some("subtitle/2024/abc_".into()),
            policy: policy_with_prefix("subtitle/2024/abc_"),
            ..OssToken::default()
        };
        assert_eq!(
            resolve_object_key(&token, 1_700_000_000_000),
            "subtitle/2024/abc_subtitle-1700000000000.json"
        );

        let token = OssToken {
            key_prefix: Some("bucket/path/".into()),
            policy: policy_with_prefix("bucket/path/"),
            ..OssToken::default()
        };
        assert_eq!(
            resolve_object_key(&token, 5),
            "bucket/path/subtitle-5.json"
        );
    }

    #[test]
    fn final_keys_are_used_as_is() {
        let token = OssToken {
            key: Some("sub/subtitle-1.json".into()),
            ..OssToken::default()
        };
        assert_eq!(resolve_object_key(&token, 9), "sub/subtitle-1.json");
    }

    #[test]
    fn success_status_accepts_numbers() {
        let token: OssToken = serde_json::from_str(
            r#"{"host":"https://oss","key":"k_","OSSAccessKeyId":"id","policy":"p","signature":"s","success_action_status":200}"#,
        )
        .unwrap();
        assert_eq!(token.success_action_status, "200");
        assert_eq!(token.access_key_id, "id");
    }

    #[test]
    fn styled_payload_prefers_prepared_json() {
        let dir = tempdir().unwrap();
        let srt = dir.path().join("abc.en.srt");
        fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();
        let converted: serde_json::Value =
            serde_json::from_slice(&styled_payload(&srt).unwrap()).unwrap();
        assert_eq!(converted["body"][0]["content"], "hi");

        fs::write(dir.path().join(STYLED_SUBTITLES_FILE), br#"{"custom":true}"#).unwrap();
        assert_eq!(styled_payload(&srt).unwrap(), br#"{"custom":true}"#.to_vec());
    }
}
