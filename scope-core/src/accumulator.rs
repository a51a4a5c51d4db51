//! Throttled rendering of a growing assistant message.
//!
//! Every delta is appended to the running content, but the content is only
//! committed to the sink when at least [`COMMIT_INTERVAL`] has passed since the
//! previous commit. One unconditional commit follows the last delta, so the
//! final committed value is always the full concatenation.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::{CoreResult, ScopeError};

/// One frame at 60 Hz.
pub const COMMIT_INTERVAL: Duration = Duration::from_millis(16);

/// Receives committed snapshots of the message. Each snapshot extends the previous one.
pub trait RenderSink {
    fn commit(&mut self, content: &str);
}

impl<F: FnMut(&str)> RenderSink for F {
    fn commit(&mut self, content: &str) {
        self(content)
    }
}

#[derive(Debug)]
pub struct RenderAccumulator {
    content: String,
    last_commit: Instant,
    commits: usize,
}

impl RenderAccumulator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self { content: String::new(), last_commit: now, commits: 0 }
    }

    /// Append a delta observed at `now`. Returns the content to commit, if the
    /// throttle allows one.
    pub fn push_at(&mut self, delta: &str, now: Instant) -> Option<&str> {
        self.content.push_str(delta);
        if now.saturating_duration_since(self.last_commit) < COMMIT_INTERVAL {
            return None;
        }
        self.last_commit = now;
        self.commits += 1;
        Some(&self.content)
    }

    pub fn push(&mut self, delta: &str) -> Option<&str> {
        self.push_at(delta, Instant::now())
    }

    /// The unconditional final commit.
    pub fn finish(&mut self) -> &str {
        self.commits += 1;
        &self.content
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl Default for RenderAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of rendering one stream.
#[derive(Debug)]
pub struct RenderOutcome {
    /// Full concatenation of every delta received.
    pub content: String,
    pub commits: usize,
    /// Set when the stream ended with a transport error. `content` still holds
    /// everything received before it.
    pub error: Option<ScopeError>,
}

/// Drain a delta stream into `sink` with throttled commits.
pub async fn render<S, K>(mut deltas: S, sink: &mut K) -> RenderOutcome
where
    S: Stream<Item = CoreResult<String>> + Unpin,
    K: RenderSink + ?Sized,
{
    let mut acc = RenderAccumulator::new();
    let mut error = None;
    while let Some(item) = deltas.next().await {
        match item {
            Ok(delta) => {
                if let Some(snapshot) = acc.push(&delta) {
                    sink.commit(snapshot);
                }
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    sink.commit(acc.finish());
    RenderOutcome { commits: acc.commits(), content: acc.content, error }
}
