/// Span/log attribute keys for relay calls.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_UPSTREAM_STATUS: &str = "upstream.status";
pub const KEY_UPSTREAM_REQUEST_ID: &str = "upstream.req_id";

pub const KEY_FIRST_BYTE_MS: &str = "latency.first_byte_ms";
pub const KEY_DURATION_MS: &str = "latency.total_ms";
pub const KEY_BYTES: &str = "stream.bytes";
pub const KEY_OUTCOME: &str = "stream.outcome";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
