#![forbid(unsafe_code)]

//! Account cookies, CSRF token and the header set every request carries.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::DESKTOP_USER_AGENT;
use crate::config::BilibiliConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult};

const COMPONENT: &str = "upload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize)]
struct JsonCookie {
    name: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonCookies {
    List(Vec<JsonCookie>),
    Wrapped { cookies: Vec<JsonCookie> },
    Map(HashMap<String, String>),
}

/// Parses a cookie export, trying JSON first and falling back to the
/// Netscape tab-separated format.
pub fn parse_cookies(raw: &str) -> Vec<Cookie> {
    if let Ok(parsed) = serde_json::from_str::<JsonCookies>(raw) {
        let mut cookies: Vec<Cookie> = match parsed {
            JsonCookies::List(list) | JsonCookies::Wrapped { cookies: list } => list
                .into_iter()
                .map(|cookie| Cookie {
                    name: cookie.name,
                    value: cookie.value,
                })
                .collect(),
            JsonCookies::Map(map) => map
                .into_iter()
                .map(|(name, value)| Cookie { name, value })
                .collect(),
        };
        cookies.sort_by(|a, b| a.name.cmp(&b.name));
        return cookies;
    }
    raw.lines()
        .filter_map(|line| {
            let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
            if line.starts_with('#') || line.trim().is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(Cookie {
                name: fields[5].to_string(),
                value: fields[6].trim_end().to_string(),
            })
        })
        .collect()
}

pub fn load_cookies(path: &Path) -> PipelineResult<Vec<Cookie>> {
    let raw = fs::read_to_string(path).map_err(|err| {
        PipelineError::new(
            ErrorKind::Auth,
            COMPONENT,
            format!("cannot read cookies {}: {err}", path.display()),
        )
        .with_source(err)
    })?;
    Ok(parse_cookies(&raw))
}

/// `csrf` or `bili_jct`, whichever is present.
pub fn csrf_token(cookies: &[Cookie]) -> Option<String> {
    ["csrf", "bili_jct"].iter().find_map(|wanted| {
        cookies
            .iter()
            .find(|cookie| cookie.name == *wanted && !cookie.value.is_empty())
            .map(|cookie| cookie.value.clone())
    })
}

/// Which `Referer`/`Origin` pair a host expects.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

/// Authenticated identity of one destination account.
#[derive(Debug, Clone)]
pub struct Session {
    pub account: String,
    pub csrf: String,
    cookie_header: String,
    studio_root: String,
    base_url: String,
}

impl Session {
    pub fn from_cookies(
        account: &str,
        cookies: &[Cookie],
        config: &BilibiliConfig,
    ) -> PipelineResult<Self> {
        let csrf = csrf_token(cookies).ok_or_else(|| {
            PipelineError::new(
                ErrorKind::Auth,
                COMPONENT,
                format!("account {account} has no csrf or bili_jct cookie"),
            )
        })?;
        let cookie_header = cookies
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Self {
            account: account.to_string(),
            csrf,
            cookie_header,
            studio_root: format!("{}/", config.studio_base.trim_end_matches('/')),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Loads the account's cookie file (per account, else global).
    pub fn load(account: &str, config: &BilibiliConfig) -> PipelineResult<Self> {
        let path = config.cookies_for(account).ok_or_else(|| {
            PipelineError::new(
                ErrorKind::Auth,
                COMPONENT,
                format!("no cookie file configured for account {account}"),
            )
        })?;
        let cookies = load_cookies(&path)?;
        Self::from_cookies(account, &cookies, config)
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    /// User agent, cookies, and the `Referer`/`Origin` the target host
    /// expects: the studio root for API and object-storage hosts, the public
    /// site otherwise.
    pub fn headers_for(&self, url: &str) -> Vec<(String, String)> {
        let host = host_of(url);
        let studio = host.starts_with("upos-") || host.starts_with("api.") || host.contains("studio.");
        let referer = if studio {
            self.studio_root.clone()
        } else {
            format!("{}/", self.base_url)
        };
        let origin = referer.trim_end_matches('/').to_string();
        vec![
            ("User-Agent".to_string(), DESKTOP_USER_AGENT.to_string()),
            ("Cookie".to_string(), self.cookie_header.clone()),
            ("Referer".to_string(), referer),
            ("Origin".to_string(), origin),
        ]
    }
}
