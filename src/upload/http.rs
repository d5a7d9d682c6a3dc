#![forbid(unsafe_code)]

//! Blocking `ureq` calls moved onto the blocking pool and raced against the
//! root cancellation token.

use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::DESKTOP_USER_AGENT;
use crate::error::{ErrorKind, PipelineError, PipelineResult};

const COMPONENT: &str = "upload";

#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn multipart(self, form: Multipart) -> Self {
        let (content_type, bytes) = form.finish();
        self.header("Content-Type", content_type)
            .body(Body::Bytes(bytes))
    }
}

/// Status and body of any answered request, 4xx/5xx included.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> PipelineResult<T> {
        serde_json::from_str(&self.body).map_err(|err| {
            PipelineError::new(
                ErrorKind::Upload,
                COMPONENT,
                format!("unexpected response body (HTTP {}): {err}", self.status),
            )
            .with_preview(&self.body)
        })
    }
}

#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(DESKTOP_USER_AGENT)
            .build();
        Self { agent }
    }

    /// Sends one request. Transport failures are `Transient`; any HTTP status
    /// is returned to the caller for classification.
    pub async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<HttpResponse> {
        let agent = self.agent.clone();
        let task = tokio::task::spawn_blocking(move || execute(&agent, request));
        tokio::select! {
            joined = task => joined.map_err(|err| {
                PipelineError::new(ErrorKind::Transient, COMPONENT, format!("request task failed: {err}"))
            })?,
            // The blocking call is abandoned; its socket closes on timeout.
            _ = cancel.cancelled() => Err(PipelineError::cancelled(COMPONENT)),
        }
    }
}

fn execute(agent: &ureq::Agent, request: HttpRequest) -> PipelineResult<HttpResponse> {
    let mut builder = agent.request(request.method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.set(name, value);
    }
    let result = match request.body {
        Body::Empty => builder.call(),
        Body::Bytes(bytes) => builder.send_bytes(&bytes),
        Body::Form(fields) => {
            let pairs: Vec<(&str, &str)> = fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            builder.send_form(&pairs)
        }
        Body::Json(value) => builder.send_json(value),
    };
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(transport)) => {
            return Err(PipelineError::new(
                ErrorKind::Transient,
                COMPONENT,
                format!("{} {}: {transport}", request.method, request.url),
            ));
        }
    };
    let status = response.status();
    let body = response.into_string().map_err(|err| {
        PipelineError::new(
            ErrorKind::Transient,
            COMPONENT,
            format!("reading response of {} {}: {err}", request.method, request.url),
        )
        .with_source(err)
    })?;
    Ok(HttpResponse { status, body })
}

/// Minimal `multipart/form-data` encoder.
pub struct Multipart {
    boundary: String,
    body: Vec<u8>,
}

impl Multipart {
    pub fn new() -> Self {
        Self {
            boundary: format!("----tube2bili{:016x}", rand::random::<u64>()),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Returns the `Content-Type` header value and the encoded body.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}
