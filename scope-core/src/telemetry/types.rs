use serde::{Deserialize, Serialize};

use super::keys::*;

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayOutcome {
    /// Upstream closed the body normally.
    Completed,
    /// Upstream refused the request or the body failed mid-stream.
    Failed,
    /// The downstream client went away before the body ended.
    Cancelled,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One record per relay call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTrace {
    pub model: String,
    pub upstream_status: Option<u16>,
    pub upstream_request_id: Option<String>,
    /// Time until the upstream response headers arrived.
    pub first_byte_ms: Option<u64>,
    pub duration_ms: u64,
    /// Body bytes handed to the client.
    pub bytes: u64,
    pub outcome: RelayOutcome,
    pub error_kind: Option<String>,
}

impl RelayTrace {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            upstream_status: None,
            upstream_request_id: None,
            first_byte_ms: None,
            duration_ms: 0,
            bytes: 0,
            outcome: RelayOutcome::Completed,
            error_kind: None,
        }
    }

    pub fn failed(mut self, kind: &str) -> Self {
        self.outcome = RelayOutcome::Failed;
        self.error_kind = Some(kind.to_string());
        self
    }

    /// Flatten into stable key/value pairs for exporters.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (KEY_MODEL, self.model.clone()),
            (KEY_DURATION_MS, self.duration_ms.to_string()),
            (KEY_BYTES, self.bytes.to_string()),
            (KEY_OUTCOME, self.outcome.as_str().to_string()),
        ];
        if let Some(s) = self.upstream_status {
            out.push((KEY_UPSTREAM_STATUS, s.to_string()));
        }
        if let Some(id) = &self.upstream_request_id {
            out.push((KEY_UPSTREAM_REQUEST_ID, id.clone()));
        }
        if let Some(ms) = self.first_byte_ms {
            out.push((KEY_FIRST_BYTE_MS, ms.to_string()));
        }
        if let Some(kind) = &self.error_kind {
            out.push((KEY_ERROR_KIND, kind.clone()));
        }
        out
    }
}
