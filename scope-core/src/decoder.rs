//! Client-side decoding of an OpenAI-style SSE byte stream into text deltas.
//!
//! Events are delimited by a blank line (`"\n\n"`). Within an event every
//! `data:` line is handled on its own: `[DONE]` ends the sequence, JSON with a
//! string at `choices[0].delta.content` yields that string, anything else is
//! skipped. Skips are tolerated and counted, never surfaced as errors.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use crate::error::CoreResult;
use crate::stream::DeltaStream;

const EVENT_DELIMITER: &str = "\n\n";
const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// Incremental UTF-8 decoding that carries split multi-byte sequences across reads.
/// Invalid sequences decode to U+FFFD instead of failing.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    // from_utf8 already validated this prefix.
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + bad;
                        }
                        None => {
                            // Incomplete trailing sequence: keep it for the next read.
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Counters describing one decode run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Complete events removed from the buffer.
    pub events: u64,
    /// Deltas yielded to the caller.
    pub deltas: u64,
    /// `data:` lines whose payload was not valid JSON.
    pub malformed_frames: u64,
    /// `data:` lines with valid JSON but no string at `choices[0].delta.content`.
    pub empty_frames: u64,
}

impl DecodeStats {
    pub fn skipped(&self) -> u64 {
        self.malformed_frames + self.empty_frames
    }
}

/// Push-based SSE decoder. Feed raw chunks, collect deltas.
///
/// Once the terminator has been seen, further input is ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Carry,
    buffer: String,
    done: bool,
    stats: DecodeStats,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `data: [DONE]` line has been processed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one raw chunk, appending every delta it completes to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut VecDeque<String>) {
        if self.done {
            return;
        }
        self.utf8.decode(chunk, &mut self.buffer);

        while let Some(idx) = self.buffer.find(EVENT_DELIMITER) {
            let event: String = self.buffer.drain(..idx + EVENT_DELIMITER.len()).collect();
            self.stats.events += 1;
            self.process_event(&event[..idx], out);
            if self.done {
                self.buffer.clear();
                return;
            }
        }
    }

    fn process_event(&mut self, event: &str, out: &mut VecDeque<String>) {
        for line in event.split('\n') {
            let Some(data) = line.trim().strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let data = data.trim();
            if data == DONE_MARKER {
                self.done = true;
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(json) => match json.pointer("/choices/0/delta/content").and_then(Value::as_str) {
                    Some(delta) => {
                        self.stats.deltas += 1;
                        out.push_back(delta.to_string());
                    }
                    None => self.stats.empty_frames += 1,
                },
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    tracing::debug!(error = %e, frame_len = data.len(), "skipping malformed SSE frame");
                }
            }
        }
    }
}

struct DecodeState<S> {
    source: Option<S>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

/// Turn a raw byte stream into a lazy stream of deltas.
///
/// The source is read only when no decoded delta is waiting. The sequence ends
/// on `[DONE]` (the source is dropped without further reads), on source closure,
/// or after yielding the first transport error. Dropping the returned stream
/// drops the source.
pub fn decode_stream<S>(source: S) -> DeltaStream
where
    S: Stream<Item = CoreResult<Bytes>> + Send + Unpin + 'static,
{
    let state = DecodeState { source: Some(source), decoder: SseDecoder::new(), ready: VecDeque::new() };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.ready.pop_front() {
                return Some((Ok(delta), st));
            }
            if st.decoder.is_done() {
                st.source = None;
                log_summary(&st.decoder, true);
                return None;
            }
            let source = st.source.as_mut()?;
            match source.next().await {
                Some(Ok(chunk)) => st.decoder.feed(&chunk, &mut st.ready),
                Some(Err(e)) => {
                    st.source = None;
                    tracing::warn!(error = %e, "stream source failed mid-decode");
                    return Some((Err(e), st));
                }
                None => {
                    st.source = None;
                    log_summary(&st.decoder, false);
                    return None;
                }
            }
        }
    })
    .boxed()
}

fn log_summary(decoder: &SseDecoder, terminated: bool) {
    let stats = decoder.stats();
    if stats.malformed_frames > 0 {
        tracing::warn!(
            malformed = stats.malformed_frames,
            events = stats.events,
            "stream contained malformed frames"
        );
    }
    tracing::debug!(
        events = stats.events,
        deltas = stats.deltas,
        skipped = stats.skipped(),
        terminated,
        "stream decode finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScopeError;
    use futures::stream;
    use proptest::prelude::*;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut dec = SseDecoder::new();
        let mut out = VecDeque::new();
        for c in chunks {
            dec.feed(c, &mut out);
        }
        out.into_iter().collect()
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<CoreResult<String>> {
        let src = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        decode_stream(src).collect().await
    }

    #[test]
    fn hello_scenario() {
        let input = format!("{}{}data: [DONE]\n\n", frame("Hel"), frame("lo"));
        assert_eq!(decode_all(&[input.as_bytes()]), vec!["Hel", "lo"]);
    }

    #[test]
    fn multiple_data_lines_in_one_event_yield_in_order() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            "\n"
        );
        assert_eq!(decode_all(&[input.as_bytes()]), vec!["a", "b"]);
    }

    #[test]
    fn malformed_json_is_skipped_and_counted() {
        let input = format!("data: {{not valid json}}\n\n{}", frame("ok"));
        let mut dec = SseDecoder::new();
        let mut out = VecDeque::new();
        dec.feed(input.as_bytes(), &mut out);
        assert_eq!(out, VecDeque::from(vec!["ok".to_string()]));
        assert_eq!(dec.stats().malformed_frames, 1);
        assert_eq!(dec.stats().deltas, 1);
    }

    #[test]
    fn absent_or_non_string_content_is_skipped() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":42}}]}\n\n",
            "data: {\"choices\":[]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        );
        let mut dec = SseDecoder::new();
        let mut out = VecDeque::new();
        dec.feed(input.as_bytes(), &mut out);
        // An empty string is still a string and is yielded.
        assert_eq!(out, VecDeque::from(vec![String::new(), "x".to_string()]));
        assert_eq!(dec.stats().empty_frames, 3);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let input = format!(": keep-alive\nevent: message\nid: 7\n{}", frame("z"));
        assert_eq!(decode_all(&[input.as_bytes()]), vec!["z"]);
    }

    #[test]
    fn done_stops_within_the_same_event() {
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        );
        let mut dec = SseDecoder::new();
        let mut out = VecDeque::new();
        dec.feed(input.as_bytes(), &mut out);
        assert_eq!(out, VecDeque::from(vec!["a".to_string()]));
        assert!(dec.is_done());
    }

    #[test]
    fn done_ignores_all_later_input() {
        let first = format!("{}data: [DONE]\n\n{}", frame("a"), frame("b"));
        let second = frame("c");
        assert_eq!(decode_all(&[first.as_bytes(), second.as_bytes()]), vec!["a"]);
    }

    #[test]
    fn done_marker_tolerates_whitespace() {
        let input = format!("{}data:[DONE]   \n\n{}", frame("a"), frame("b"));
        assert_eq!(decode_all(&[input.as_bytes()]), vec!["a"]);
    }

    #[test]
    fn event_split_mid_line_waits_for_delimiter() {
        let input = frame("hello");
        let (a, b) = input.as_bytes().split_at(10);
        let mut dec = SseDecoder::new();
        let mut out = VecDeque::new();
        dec.feed(a, &mut out);
        assert!(out.is_empty());
        dec.feed(b, &mut out);
        assert_eq!(out, VecDeque::from(vec!["hello".to_string()]));
    }

    #[test]
    fn multibyte_character_split_across_reads() {
        let input = frame("héllo 🌍");
        let bytes = input.as_bytes();
        let globe = bytes.iter().position(|&b| b == 0xF0).unwrap();
        let chunks: Vec<&[u8]> = vec![&bytes[..globe + 1], &bytes[globe + 1..globe + 3], &bytes[globe + 3..]];
        assert_eq!(decode_all(&chunks), vec!["héllo 🌍"]);
    }

    #[test]
    fn invalid_utf8_becomes_replacement_character() {
        let mut bytes = b"data: {\"choices\":[{\"delta\":{\"content\":\"a".to_vec();
        bytes.push(0xFF);
        bytes.extend_from_slice(b"b\"}}]}\n\n");
        assert_eq!(decode_all(&[&bytes]), vec!["a\u{FFFD}b"]);
    }

    #[test]
    fn unterminated_trailing_event_is_discarded() {
        let input = format!("{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"tail\"}}}}]}}\n", frame("a"));
        assert_eq!(decode_all(&[input.as_bytes()]), vec!["a"]);
    }

    #[tokio::test]
    async fn stream_ends_without_done() {
        let out = collect(vec![frame("x").into_bytes(), frame("y").into_bytes()]).await;
        let out: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn stream_stops_reading_after_done() {
        let reads = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = reads.clone();
        let chunks = vec![
            format!("{}data: [DONE]\n\n", frame("a")).into_bytes(),
            frame("never").into_bytes(),
        ];
        let src = stream::iter(chunks).map(move |c| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Bytes::from(c))
        });
        let out: Vec<String> = decode_stream(src).map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["a"]);
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_is_surfaced_once_then_ends() {
        let items: Vec<CoreResult<Bytes>> = vec![
            Ok(Bytes::from(frame("part"))),
            Err(ScopeError::Network("connection reset".into())),
            Ok(Bytes::from(frame("after"))),
        ];
        let out: Vec<CoreResult<String>> = decode_stream(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "part");
        assert!(matches!(out[1], Err(ScopeError::Network(_))));
    }

    #[tokio::test]
    async fn stream_is_lazy() {
        let mut s = decode_stream(stream::iter(vec![Ok(Bytes::from(format!("{}{}", frame("1"), frame("2"))))]));
        assert_eq!(s.next().await.unwrap().unwrap(), "1");
        assert_eq!(s.next().await.unwrap().unwrap(), "2");
        assert!(s.next().await.is_none());
    }

    struct DropFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dropping_consumer_drops_source() {
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let src = stream::iter(vec![Ok(Bytes::from(frame("first")))])
            .chain(stream::pending())
            .map(move |item: CoreResult<Bytes>| {
                let _held = &flag;
                item
            });
        let mut deltas = decode_stream(src);
        assert_eq!(deltas.next().await.unwrap().unwrap(), "first");
        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));

        drop(deltas);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    fn partition(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
        points.sort_unstable();
        points.dedup();
        let mut chunks = Vec::new();
        let mut prev = 0;
        for p in points {
            chunks.push(bytes[prev..p].to_vec());
            prev = p;
        }
        chunks.push(bytes[prev..].to_vec());
        chunks
    }

    proptest! {
        #[test]
        fn any_chunking_yields_identical_output(
            contents in proptest::collection::vec("[a-zé🌍\\n ]{0,6}", 1..8),
            cuts in proptest::collection::vec(any::<usize>(), 0..12),
            with_noise in any::<bool>(),
        ) {
            let mut input = String::new();
            for (i, c) in contents.iter().enumerate() {
                if with_noise && i % 2 == 1 {
                    input.push_str("data: {not valid json}\n\n");
                }
                input.push_str(&frame(c));
            }
            input.push_str("data: [DONE]\n\n");
            input.push_str(&frame("ignored"));

            let whole = decode_all(&[input.as_bytes()]);
            let pieces = partition(input.as_bytes(), &cuts);
            let refs: Vec<&[u8]> = pieces.iter().map(|p| p.as_slice()).collect();
            let chunked = decode_all(&refs);

            prop_assert_eq!(&whole, &contents);
            prop_assert_eq!(chunked, whole);
        }
    }
}
