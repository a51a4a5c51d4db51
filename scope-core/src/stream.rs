//! Streaming primitives shared by the relay (server side) and the decoder (client side).
//!
//! Contract:
//! - A `ByteStream` yields raw body chunks exactly as the transport delivered them.
//!   Chunk boundaries carry no meaning; they may split lines, events or UTF-8 characters.
//! - A transport failure is yielded once as `Err(ScopeError::Network)` and the stream ends.
//! - Source closure is normal termination, never an error.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};

use crate::error::{CoreResult, ScopeError};

/// Raw body bytes, passed through untouched.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

/// Decoded text deltas, in arrival order.
pub type DeltaStream = BoxStream<'static, CoreResult<String>>;

/// Adapt a reqwest body into a `ByteStream`, ending after the first transport error.
pub fn body_stream(resp: reqwest::Response) -> ByteStream {
    let mut failed = false;
    resp.bytes_stream()
        .map(|item| item.map_err(|e| ScopeError::Network(e.to_string())))
        .take_while(move |item| {
            let keep = !failed;
            failed = item.is_err();
            futures::future::ready(keep)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn byte_stream_is_object_safe_and_ordered() {
        let chunks: Vec<CoreResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"da")), Ok(Bytes::from_static(b"ta: x\n\n"))];
        let s: ByteStream = stream::iter(chunks).boxed();
        let collected: Vec<Bytes> = s.map(|c| c.unwrap()).collect().await;
        assert_eq!(collected.concat(), b"data: x\n\n");
    }
}
