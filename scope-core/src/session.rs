//! Client-side chat session: transcript, persistence and streamed replies.

use futures::Stream;

use crate::accumulator::{RenderSink, render};
use crate::client::ScopeClient;
use crate::error::{CoreResult, ScopeError};
use crate::model::{ChatMessage, ChatTurnRequest, Role};

/// Shown as its own assistant message when a turn fails.
pub const CONNECTION_LOST_NOTICE: &str = "⚠️ Connection lost. Please try again.";

const TITLE_CHARS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub message: ChatMessage,
    /// Local notices are displayed but never sent upstream or persisted.
    pub notice: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(TranscriptEntry { message, notice: false });
    }

    pub fn push_notice(&mut self, text: &str) {
        self.entries.push(TranscriptEntry { message: ChatMessage::assistant(text), notice: true });
    }

    /// Append an empty assistant message and return its index.
    pub fn begin_assistant(&mut self) -> usize {
        self.push(ChatMessage::assistant(""));
        self.entries.len() - 1
    }

    pub fn update(&mut self, index: usize, content: &str) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.message.content.clear();
            entry.message.content.push_str(content);
        }
    }

    /// Conversation as sent upstream: no notices, no empty placeholders.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter(|e| !e.notice && !e.message.content.is_empty())
            .map(|e| e.message.clone())
            .collect()
    }
}

/// What one `send` produced.
#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: String,
    pub commits: usize,
    pub error: Option<ScopeError>,
}

/// Commits go to the transcript first, then to the observer.
struct TranscriptSink<'a, K: ?Sized> {
    transcript: &'a mut Transcript,
    index: usize,
    observer: &'a mut K,
}

impl<K: RenderSink + ?Sized> RenderSink for TranscriptSink<'_, K> {
    fn commit(&mut self, content: &str) {
        self.transcript.update(self.index, content);
        self.observer.commit(content);
    }
}

pub struct ChatSession {
    client: ScopeClient,
    transcript: Transcript,
    conversation_id: Option<String>,
    pub web_search: bool,
    pub think_harder: bool,
    pub model: Option<String>,
}

impl ChatSession {
    pub fn new(client: ScopeClient) -> Self {
        Self {
            client,
            transcript: Transcript::default(),
            conversation_id: None,
            web_search: false,
            think_harder: false,
            model: None,
        }
    }

    /// Continue a stored conversation.
    pub async fn resume(client: ScopeClient, conversation_id: &str) -> CoreResult<Self> {
        let detail = client.get_conversation(conversation_id).await?;
        let mut session = Self::new(client);
        for m in detail.messages {
            session.transcript.push(ChatMessage { role: m.role, content: m.content });
        }
        session.conversation_id = Some(detail.conversation.id);
        Ok(session)
    }

    pub fn client(&self) -> &ScopeClient {
        &self.client
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Forget the transcript; the next message opens a new conversation.
    pub fn start_new(&mut self) {
        self.transcript = Transcript::default();
        self.conversation_id = None;
    }

    /// Send one user message and stream the reply into the transcript and `observer`.
    /// Blank input is ignored and yields `None`.
    pub async fn send<K>(&mut self, text: &str, observer: &mut K) -> Option<TurnOutcome>
    where
        K: RenderSink + ?Sized,
    {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.ensure_conversation(text).await;
        self.transcript.push(ChatMessage::user(text));
        self.persist(Role::User, text).await;

        let req = ChatTurnRequest {
            messages: self.transcript.history(),
            web_search: self.web_search,
            think_harder: self.think_harder,
            model: self.model.clone(),
        };
        let outcome = match self.client.stream_turn(&req).await {
            Ok(deltas) => self.render_reply(deltas, observer).await,
            Err(e) => TurnOutcome { reply: String::new(), commits: 0, error: Some(e) },
        };
        self.finish_turn(&outcome).await;
        Some(outcome)
    }

    /// A failed turn keeps its partial reply on screen but is not stored.
    async fn finish_turn(&mut self, outcome: &TurnOutcome) {
        match &outcome.error {
            None if !outcome.reply.is_empty() => self.persist(Role::Assistant, &outcome.reply).await,
            None => {}
            Some(e) => {
                tracing::warn!(error.kind = e.kind(), error = %e, "chat turn failed");
                self.transcript.push_notice(CONNECTION_LOST_NOTICE);
            }
        }
    }

    async fn render_reply<S, K>(&mut self, deltas: S, observer: &mut K) -> TurnOutcome
    where
        S: Stream<Item = CoreResult<String>> + Unpin,
        K: RenderSink + ?Sized,
    {
        let index = self.transcript.begin_assistant();
        let mut sink = TranscriptSink { transcript: &mut self.transcript, index, observer };
        let rendered = render(deltas, &mut sink).await;
        TurnOutcome { reply: rendered.content, commits: rendered.commits, error: rendered.error }
    }

    async fn ensure_conversation(&mut self, first_message: &str) {
        if self.conversation_id.is_some() {
            return;
        }
        let title: String = first_message.trim().chars().take(TITLE_CHARS).collect();
        match self.client.create_conversation(&title).await {
            Ok(c) => self.conversation_id = Some(c.id),
            Err(e) => tracing::warn!(error = %e, "could not create conversation; continuing unsaved"),
        }
    }

    async fn persist(&self, role: Role, content: &str) {
        let Some(id) = self.conversation_id.as_deref() else {
            return;
        };
        if let Err(e) = self.client.add_message(id, role, content).await {
            tracing::warn!(conversation = id, error = %e, "failed to persist message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpClient;
    use futures::stream;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    const NOW: &str = "2024-05-01T12:00:00Z";

    fn session(server: &MockServer) -> ChatSession {
        ChatSession::new(ScopeClient::new(HttpClient::new_default().unwrap(), server.base_url()))
    }

    fn mock_storage(server: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
        let create = server.mock(|when, then| {
            when.method(POST).path("/api/conversations");
            then.status(200).json_body(json!({
                "id": "c1", "title": "t", "createdAt": NOW, "updatedAt": NOW
            }));
        });
        let messages = server.mock(|when, then| {
            when.method(POST).path("/api/conversations/c1/messages");
            then.status(200).json_body(json!({
                "id": "m", "conversationId": "c1", "role": "user", "content": "x", "createdAt": NOW
            }));
        });
        (create, messages)
    }

    fn contents(s: &ChatSession) -> Vec<(Role, String, bool)> {
        s.transcript()
            .entries()
            .iter()
            .map(|e| (e.message.role, e.message.content.clone(), e.notice))
            .collect()
    }

    #[tokio::test]
    async fn successful_turn_renders_and_persists() {
        let server = MockServer::start();
        let (create, messages) = mock_storage(&server);
        let chat = server.mock(|when, then| {
            when.method(POST).path("/api/chat").body_contains(r#""content":"Say hello""#);
            then.status(200).header("content-type", "text/event-stream").body(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: [DONE]\n\n",
            ));
        });

        let mut s = session(&server);
        let mut seen = Vec::new();
        let outcome = s.send("Say hello", &mut |c: &str| seen.push(c.to_string())).await.expect("sent");

        assert_eq!(outcome.reply, "Hello");
        assert!(outcome.error.is_none());
        assert_eq!(seen.last().map(String::as_str), Some("Hello"));
        assert_eq!(
            contents(&s),
            vec![(Role::User, "Say hello".into(), false), (Role::Assistant, "Hello".into(), false)]
        );
        assert_eq!(s.conversation_id(), Some("c1"));
        create.assert();
        chat.assert();
        messages.assert_hits(2);
    }

    #[tokio::test]
    async fn blank_input_does_nothing() {
        let server = MockServer::start();
        let (create, _) = mock_storage(&server);
        let mut s = session(&server);
        assert!(s.send("   \n", &mut |_: &str| {}).await.is_none());
        assert!(s.transcript().entries().is_empty());
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn refused_turn_appends_notice() {
        let server = MockServer::start();
        let (_create, messages) = mock_storage(&server);
        server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(503).json_body(json!({ "error": "no API credential configured" }));
        });

        let mut s = session(&server);
        let outcome = s.send("hi", &mut |_: &str| {}).await.expect("sent");
        assert!(outcome.error.is_some());
        assert_eq!(
            contents(&s),
            vec![
                (Role::User, "hi".into(), false),
                (Role::Assistant, CONNECTION_LOST_NOTICE.into(), true),
            ]
        );
        // Only the user message is stored.
        messages.assert_hits(1);
    }

    #[tokio::test]
    async fn stream_failure_keeps_partial_reply() {
        let server = MockServer::start();
        let mut s = session(&server);
        s.transcript.push(ChatMessage::user("q"));
        let deltas = stream::iter(vec![
            Ok("partial".to_string()),
            Err(ScopeError::Network("connection reset".into())),
        ]);
        let outcome = s.render_reply(deltas, &mut |_: &str| {}).await;
        assert_eq!(outcome.reply, "partial");
        assert!(matches!(outcome.error, Some(ScopeError::Network(_))));
        assert_eq!(s.transcript().entries()[1].message.content, "partial");
    }

    #[tokio::test]
    async fn failed_turn_is_not_persisted() {
        let server = MockServer::start();
        let (_create, messages) = mock_storage(&server);
        let mut s = session(&server);
        s.ensure_conversation("q").await;
        let outcome = TurnOutcome {
            reply: "partial".into(),
            commits: 1,
            error: Some(ScopeError::Network("connection reset".into())),
        };
        s.finish_turn(&outcome).await;
        messages.assert_hits(0);
        let last = s.transcript().entries().last().expect("notice");
        assert!(last.notice);
        assert_eq!(last.message.content, CONNECTION_LOST_NOTICE);
    }

    #[tokio::test]
    async fn user_text_is_trimmed_before_sending() {
        let server = MockServer::start();
        let (_create, messages) = mock_storage(&server);
        let chat = server.mock(|when, then| {
            when.method(POST).path("/api/chat").body_contains(r#""content":"hi there""#);
            then.status(200).body("data: [DONE]\n\n");
        });
        let mut s = session(&server);
        s.send("  hi there \n", &mut |_: &str| {}).await.expect("sent");
        chat.assert();
        assert_eq!(s.transcript().entries()[0].message.content, "hi there");
        messages.assert_hits(1);
    }

    #[tokio::test]
    async fn title_is_first_32_characters() {
        let server = MockServer::start();
        let long = "é".repeat(40);
        let expected_title: String = "é".repeat(32);
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/api/conversations")
                .json_body(json!({ "title": expected_title }));
            then.status(200).json_body(json!({
                "id": "c9", "title": "t", "createdAt": NOW, "updatedAt": NOW
            }));
        });
        let mut s = session(&server);
        s.ensure_conversation(&long).await;
        create.assert();
        assert_eq!(s.conversation_id(), Some("c9"));
    }

    #[test]
    fn history_skips_notices_and_placeholders() {
        let mut t = Transcript::default();
        t.push(ChatMessage::user("a"));
        t.begin_assistant();
        t.push_notice(CONNECTION_LOST_NOTICE);
        assert_eq!(t.history(), vec![ChatMessage::user("a")]);
    }
}
