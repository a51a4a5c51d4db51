//! Server-side forwarding of chat turns to the upstream provider.
//!
//! The relay never looks inside the completion body: bytes arrive from
//! upstream and leave towards the client in the same chunks and order.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{EnvDefaults, UpstreamCfg};
use crate::error::{CoreResult, ScopeError};
use crate::http_client::HttpClient;
use crate::model::{ChatMessage, ChatTurnRequest, ModelInfo};
use crate::models::ModelFilter;
use crate::store::{SETTING_API_KEY, SETTING_SELECTED_MODEL, SettingsStore};
use crate::stream::ByteStream;
use crate::telemetry::{RelayOutcome, RelayTrace, TelemetrySink};

const WEB_SEARCH_HINT: &str = "The user enabled web search mode. When the answer depends on recent \
     events or fast-changing facts, say so plainly and point out where your knowledge may be out of date.";
const THINK_HARDER_HINT: &str = "The user asked you to think harder. Work through the problem step by \
     step, check your reasoning, and give a careful, thorough answer.";

/// Credential and model for one request, resolved once and passed down.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub api_key: SecretString,
    pub model: String,
}

impl TurnConfig {
    /// Credential: stored setting, then the environment default.
    /// Model: explicit request value, then the stored selection, then the configured default.
    pub async fn resolve(
        settings: &dyn SettingsStore,
        env: &EnvDefaults,
        upstream: &UpstreamCfg,
        requested_model: Option<&str>,
    ) -> CoreResult<Self> {
        let api_key = match non_blank(settings.get_setting(SETTING_API_KEY).await?) {
            Some(stored) => SecretString::from(stored),
            None => env.api_key.clone().ok_or(ScopeError::MissingCredential)?,
        };
        let model = match non_blank(requested_model.map(str::to_string)) {
            Some(m) => m,
            None => non_blank(settings.get_setting(SETTING_SELECTED_MODEL).await?)
                .unwrap_or_else(|| upstream.default_model.clone()),
        };
        Ok(Self { api_key, model })
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// The synthesized leading system message for the requested modes, if any.
pub fn mode_system_message(web_search: bool, think_harder: bool) -> Option<ChatMessage> {
    let hints: Vec<&str> = [(web_search, WEB_SEARCH_HINT), (think_harder, THINK_HARDER_HINT)]
        .into_iter()
        .filter_map(|(on, hint)| on.then_some(hint))
        .collect();
    (!hints.is_empty()).then(|| ChatMessage::system(hints.join("\n\n")))
}

/// Messages as sent upstream: mode hint first, then the conversation unchanged.
pub fn upstream_messages(req: &ChatTurnRequest) -> Vec<ChatMessage> {
    mode_system_message(req.web_search, req.think_harder)
        .into_iter()
        .chain(req.messages.iter().cloned())
        .collect()
}

#[derive(Serialize)]
struct UpstreamChatReq<'a> {
    model: &'a str,
    stream: bool,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ModelsResp {
    data: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct TranscriptionResp {
    #[serde(default)]
    text: Option<String>,
}

/// Uploaded audio handed to the transcription endpoint.
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone)]
pub struct Relay {
    http: HttpClient,
    base_url: String,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl Relay {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into().trim_end_matches('/').to_string(), sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start a streamed completion and return the upstream body untouched.
    #[tracing::instrument(skip_all, fields(llm.model = %turn.model, messages = req.messages.len()))]
    pub async fn relay_chat(&self, turn: &TurnConfig, req: &ChatTurnRequest) -> CoreResult<ByteStream> {
        let started = Instant::now();
        let messages = upstream_messages(req);
        let payload = UpstreamChatReq { model: &turn.model, stream: true, messages: &messages };
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut trace = RelayTrace::new(&turn.model);

        match self.http.post_stream(&url, &payload, Some(turn.api_key.expose_secret())).await {
            Ok(resp) => {
                trace.upstream_status = Some(resp.status.as_u16());
                trace.upstream_request_id = resp.request_id;
                trace.first_byte_ms = Some(started.elapsed().as_millis() as u64);
                tracing::debug!(upstream.status = resp.status.as_u16(), "upstream stream opened");
                Ok(TracedStream { inner: resp.body, trace: Some(trace), started, sink: self.sink.clone() }
                    .boxed())
            }
            Err(e) => {
                tracing::warn!(error.kind = e.kind(), error = %e, "upstream refused chat request");
                let mut trace = trace.failed(e.kind());
                trace.upstream_status = upstream_status(&e);
                trace.duration_ms = started.elapsed().as_millis() as u64;
                if let Some(sink) = &self.sink {
                    sink.record(trace);
                }
                Err(e)
            }
        }
    }

    pub async fn list_models(&self, api_key: &SecretString, filter: &ModelFilter) -> CoreResult<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", self.base_url);
        let resp: ModelsResp = self.http.get_json(&url, Some(api_key.expose_secret())).await?;
        let total = resp.data.len();
        let models = filter.apply(resp.data);
        tracing::debug!(total, listed = models.len(), "fetched upstream models");
        Ok(models)
    }

    pub async fn transcribe(&self, api_key: &SecretString, model: &str, audio: AudioUpload) -> CoreResult<String> {
        let mut part = reqwest::multipart::Part::bytes(audio.bytes.to_vec())
            .file_name(audio.file_name.unwrap_or_else(|| "audio.webm".to_string()));
        if let Some(ct) = audio.content_type {
            part = part
                .mime_str(&ct)
                .map_err(|e| ScopeError::Validation(format!("invalid audio content type '{ct}': {e}")))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part).text("model", model.to_string());
        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let resp: TranscriptionResp = self.http.post_multipart(&url, form, Some(api_key.expose_secret())).await?;
        Ok(resp.text.unwrap_or_default())
    }
}

fn upstream_status(e: &ScopeError) -> Option<u16> {
    match e {
        ScopeError::UpstreamAuth => Some(401),
        ScopeError::RateLimited { .. } => Some(429),
        ScopeError::UpstreamUnavailable { status } | ScopeError::UpstreamBadRequest { status, .. } => {
            Some(*status)
        }
        _ => None,
    }
}

/// Pass-through wrapper that counts bytes and records how the body ended.
struct TracedStream {
    inner: ByteStream,
    trace: Option<RelayTrace>,
    started: Instant,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl TracedStream {
    fn finish(&mut self, outcome: RelayOutcome, error_kind: Option<&str>) {
        let Some(mut trace) = self.trace.take() else {
            return;
        };
        trace.outcome = outcome;
        trace.error_kind = error_kind.map(str::to_string);
        trace.duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::debug!(
            bytes = trace.bytes,
            duration_ms = trace.duration_ms,
            outcome = outcome.as_str(),
            "relay stream ended"
        );
        if let Some(sink) = &self.sink {
            sink.record(trace);
        }
    }
}

impl Stream for TracedStream {
    type Item = CoreResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(t) = this.trace.as_mut() {
                    t.bytes += chunk.len() as u64;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(RelayOutcome::Failed, Some(e.kind()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(RelayOutcome::Completed, None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TracedStream {
    fn drop(&mut self) {
        self.finish(RelayOutcome::Cancelled, None);
    }
}
