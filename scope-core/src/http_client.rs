use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, ScopeError};
use crate::stream::{ByteStream, body_stream};

/// Turns a non-success status, its `Retry-After` and its body into an error.
pub type ErrorMapper = fn(StatusCode, Option<u64>, &str) -> ScopeError;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    map_error: ErrorMapper,
}

/// Successful streaming response: upstream metadata plus the untouched body.
pub struct StreamResponse {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub body: ByteStream,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ScopeError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self { inner, user_agent: "scope/0.1".to_string(), map_error: map_http_error })
    }

    /// Replace the upstream status mapping, e.g. when talking to a Scope server.
    pub fn with_error_mapper(mut self, map_error: ErrorMapper) -> Self {
        self.map_error = map_error;
        self
    }

    fn request(&self, builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        let req = builder.header("User-Agent", &self.user_agent);
        match bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// POST JSON and hand back the response body as an unparsed byte stream.
    /// Non-success statuses are mapped before any body byte is exposed.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> CoreResult<StreamResponse> {
        let req = self
            .request(self.inner.post(url).json(body), bearer)
            .header("Accept", "text/event-stream");
        let resp = req.send().await.map_err(network_error)?;
        let resp = check_status(resp, self.map_error).await?;
        Ok(StreamResponse {
            status: resp.status(),
            request_id: extract_request_id(resp.headers()),
            body: body_stream(resp),
        })
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> CoreResult<R> {
        let req = self.request(self.inner.post(url).json(body), bearer);
        let resp = req.send().await.map_err(network_error)?;
        decode_json(check_status(resp, self.map_error).await?).await
    }

    pub async fn patch_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
    ) -> CoreResult<R> {
        let req = self.request(self.inner.patch(url).json(body), None);
        let resp = req.send().await.map_err(network_error)?;
        decode_json(check_status(resp, self.map_error).await?).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, url: &str, bearer: Option<&str>) -> CoreResult<R> {
        let req = self.request(self.inner.get(url), bearer);
        let resp = req.send().await.map_err(network_error)?;
        decode_json(check_status(resp, self.map_error).await?).await
    }

    pub async fn delete_json<R: DeserializeOwned>(&self, url: &str) -> CoreResult<R> {
        let req = self.request(self.inner.delete(url), None);
        let resp = req.send().await.map_err(network_error)?;
        decode_json(check_status(resp, self.map_error).await?).await
    }

    pub async fn post_multipart<R: DeserializeOwned>(
        &self,
        url: &str,
        form: reqwest::multipart::Form,
        bearer: Option<&str>,
    ) -> CoreResult<R> {
        let req = self.request(self.inner.post(url).multipart(form), bearer);
        let resp = req.send().await.map_err(network_error)?;
        decode_json(check_status(resp, self.map_error).await?).await
    }
}

fn network_error(e: reqwest::Error) -> ScopeError {
    ScopeError::Network(e.to_string())
}

async fn check_status(resp: reqwest::Response, map_error: ErrorMapper) -> CoreResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let ra = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    Err(map_error(status, ra, &body))
}

async fn decode_json<R: DeserializeOwned>(resp: reqwest::Response) -> CoreResult<R> {
    let status = resp.status();
    resp.json::<R>().await.map_err(|e| ScopeError::UpstreamBadRequest {
        status: status.as_u16(),
        message: format!("json decode error: {e}"),
    })
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "openai-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

/// Translate an upstream status into the caller-facing error.
pub fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ScopeError {
    match status {
        StatusCode::UNAUTHORIZED => ScopeError::UpstreamAuth,
        StatusCode::TOO_MANY_REQUESTS => ScopeError::RateLimited { retry_after },
        s if s.is_server_error() => ScopeError::UpstreamUnavailable { status: s.as_u16() },
        s => ScopeError::UpstreamBadRequest { status: s.as_u16(), message: truncate(body, 300) },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let mut t: String = s.chars().take(max).collect();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
