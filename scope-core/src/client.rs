//! Typed client for a running Scope server.

use reqwest::StatusCode;
use serde::{Deserialize, de::IgnoredAny};
use serde_json::json;

use crate::decoder::decode_stream;
use crate::error::{CoreResult, ScopeError};
use crate::http_client::HttpClient;
use crate::model::{ChatTurnRequest, Conversation, ConversationDetail, ModelInfo, Role, StoredMessage};
use crate::relay::AudioUpload;
use crate::stream::DeltaStream;

#[derive(Deserialize)]
struct SettingResp {
    value: Option<String>,
}

#[derive(Deserialize)]
struct ModelsResp {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct TranscriptResp {
    text: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Map a Scope server's error response. The server already translated any
/// upstream failure, so its `{"error"}` message is kept as-is.
pub fn map_server_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ScopeError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        StatusCode::NOT_FOUND => {
            ScopeError::NotFound(message.strip_prefix("not found: ").unwrap_or(&message).to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => ScopeError::RateLimited { retry_after },
        StatusCode::PAYLOAD_TOO_LARGE => ScopeError::PayloadTooLarge(message),
        s if s.is_client_error() => ScopeError::Validation(message),
        s => ScopeError::Server { status: s.as_u16(), message },
    }
}

#[derive(Debug, Clone)]
pub struct ScopeClient {
    http: HttpClient,
    base_url: String,
}

impl ScopeClient {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http: http.with_error_mapper(map_server_error),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Start one chat turn and decode the relayed body into text deltas.
    /// Errors before the first byte (missing credential, rate limit, ...) are returned here.
    pub async fn stream_turn(&self, req: &ChatTurnRequest) -> CoreResult<DeltaStream> {
        let resp = self.http.post_stream(&self.url("/api/chat"), req, None).await?;
        Ok(decode_stream(resp.body))
    }

    pub async fn get_setting(&self, key: &str) -> CoreResult<Option<String>> {
        let resp: SettingResp = self.http.get_json(&self.url(&format!("/api/settings/{key}")), None).await?;
        Ok(resp.value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> CoreResult<()> {
        let _: IgnoredAny = self
            .http
            .post_json(&self.url(&format!("/api/settings/{key}")), &json!({ "value": value }), None)
            .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> CoreResult<()> {
        let _: IgnoredAny = self.http.delete_json(&self.url(&format!("/api/settings/{key}"))).await?;
        Ok(())
    }

    pub async fn list_conversations(&self) -> CoreResult<Vec<Conversation>> {
        self.http.get_json(&self.url("/api/conversations"), None).await
    }

    pub async fn create_conversation(&self, title: &str) -> CoreResult<Conversation> {
        self.http.post_json(&self.url("/api/conversations"), &json!({ "title": title }), None).await
    }

    pub async fn get_conversation(&self, id: &str) -> CoreResult<ConversationDetail> {
        self.http.get_json(&self.url(&format!("/api/conversations/{id}")), None).await
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) -> CoreResult<()> {
        let _: IgnoredAny = self
            .http
            .patch_json(&self.url(&format!("/api/conversations/{id}")), &json!({ "title": title }))
            .await?;
        Ok(())
    }

    pub async fn delete_conversation(&self, id: &str) -> CoreResult<()> {
        let _: IgnoredAny = self.http.delete_json(&self.url(&format!("/api/conversations/{id}"))).await?;
        Ok(())
    }

    pub async fn add_message(&self, conversation_id: &str, role: Role, content: &str) -> CoreResult<StoredMessage> {
        self.http
            .post_json(
                &self.url(&format!("/api/conversations/{conversation_id}/messages")),
                &json!({ "role": role, "content": content }),
                None,
            )
            .await
    }

    pub async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
        let resp: ModelsResp = self.http.get_json(&self.url("/api/models"), None).await?;
        Ok(resp.models)
    }

    pub async fn transcribe(&self, audio: AudioUpload) -> CoreResult<String> {
        let mut part = reqwest::multipart::Part::bytes(audio.bytes.to_vec())
            .file_name(audio.file_name.unwrap_or_else(|| "audio.webm".to_string()));
        if let Some(ct) = audio.content_type {
            part = part
                .mime_str(&ct)
                .map_err(|e| ScopeError::Validation(format!("invalid audio content type '{ct}': {e}")))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp: TranscriptResp = self.http.post_multipart(&self.url("/api/transcribe"), form, None).await?;
        Ok(resp.text)
    }
}
