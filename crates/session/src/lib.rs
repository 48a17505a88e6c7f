//! Single-flight conversation sessions over any [`ModelClient`].
//!
//! A [`Conversation`] owns an ordered message history and allows at most one
//! in-flight operation; a second call while one is running is rejected with
//! [`ChatError::Concurrency`] rather than queued.

use futures::StreamExt;
use parking_lot::Mutex;
use relay_core::llm::{ChatError, ChatOpts, ChatStream, Message, ModelClient, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub system: Option<String>,
    pub initial_messages: Vec<Message>,
}

pub struct Conversation<C> {
    client: C,
    opts: ChatOpts,
    state: Mutex<State>,
    busy: AtomicBool,
}

struct State {
    system: Option<String>,
    history: Vec<Message>,
}

/// Releases the single-flight gate on every exit path, including drops of an
/// abandoned stream.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: ModelClient> Conversation<C> {
    pub fn new(client: C, options: SessionOptions) -> Result<Self, ChatError> {
        if options
            .initial_messages
            .iter()
            .any(|m| m.role == Role::System)
        {
            return Err(ChatError::Validation(
                "seed messages must be user or assistant; set the system prompt via `system`"
                    .into(),
            ));
        }
        Ok(Self {
            client,
            opts: ChatOpts::default(),
            state: Mutex::new(State {
                system: options.system,
                history: options.initial_messages,
            }),
            busy: AtomicBool::new(false),
        })
    }

    /// Per-send options: model override, sampling, retry policy, cancellation.
    pub fn with_opts(mut self, opts: ChatOpts) -> Self {
        self.opts = opts;
        self
    }

    fn acquire(&self) -> Result<FlightGuard<'_>, ChatError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ChatError::Concurrency);
        }
        Ok(FlightGuard(&self.busy))
    }

    /// Fresh copy of the transcript, system prompt first. Mutating the
    /// returned vector never affects the session.
    pub fn history(&self) -> Vec<Message> {
        let st = self.state.lock();
        let mut out = Vec::with_capacity(st.history.len() + 1);
        if let Some(sys) = &st.system {
            out.push(Message::system(sys.clone()));
        }
        out.extend(st.history.iter().cloned());
        out
    }

    /// Send one user message and wait for the full reply. The user message is
    /// recorded before the request goes out and stays in history even when
    /// the request fails; the assistant reply is recorded on success only.
    pub async fn send(&self, content: impl Into<String>) -> Result<String, ChatError> {
        let _guard = self.acquire()?;
        self.state
            .lock()
            .history
            .push(Message::user(content.into()));
        let msgs = self.history();
        let reply = self.client.send_chat(&msgs, &self.opts).await?;
        self.state
            .lock()
            .history
            .push(Message::assistant(reply.content.clone()));
        Ok(reply.content)
    }

    /// Send one user message and stream the reply. The gate is taken and the
    /// user message recorded before this returns; the request itself runs on
    /// first poll of the returned stream. Deltas accumulate in a pending
    /// buffer that is committed as a single assistant message only when the
    /// stream is exhausted cleanly; on error or abandonment the buffer is
    /// discarded and the gate is released when the stream drops.
    pub fn send_stream(&self, content: impl Into<String>) -> Result<ChatStream<'_>, ChatError> {
        let guard = self.acquire()?;
        self.state
            .lock()
            .history
            .push(Message::user(content.into()));
        let msgs = self.history();
        let opts = self.opts.clone();
        let s = async_stream::stream! {
            let _guard = guard;
            let mut inner = match self.client.stream_chat(msgs, opts).await {
                Ok(s) => s,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut pending = String::new();
            while let Some(item) = inner.next().await {
                match item {
                    Ok(delta) => {
                        pending.push_str(&delta);
                        yield Ok(delta);
                    }
                    Err(e) => {
                        debug!("stream failed after {} buffered bytes", pending.len());
                        yield Err(e);
                        return;
                    }
                }
            }
            self.state.lock().history.push(Message::assistant(pending));
        };
        Ok(Box::pin(s))
    }

    /// Append a message without calling the model. The system prompt is not
    /// settable here; it belongs to session construction.
    pub fn add_message(&self, role: Role, content: impl Into<String>) -> Result<(), ChatError> {
        let _guard = self.acquire()?;
        if role == Role::System {
            return Err(ChatError::Validation(
                "the system prompt can only be set when the session is created".into(),
            ));
        }
        self.state.lock().history.push(Message {
            role,
            content: content.into(),
        });
        Ok(())
    }

    /// Empty the history, keeping the system prompt.
    pub fn clear(&self) -> Result<(), ChatError> {
        let _guard = self.acquire()?;
        self.state.lock().history.clear();
        Ok(())
    }

    /// Empty the history and discard the system prompt.
    pub fn clear_all(&self) -> Result<(), ChatError> {
        let _guard = self.acquire()?;
        let mut st = self.state.lock();
        st.history.clear();
        st.system = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::pin_mut;
    use relay_core::llm::{ChatResponse, Usage};
    use std::task::Poll;

    fn reply(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            usage: Usage::default(),
            model: "test-model".into(),
            id: "resp-1".into(),
            finish_reason: Some("stop".into()),
            latency_ms: 0,
        }
    }

    /// Answers every send with a fixed reply and records each transcript it
    /// was handed.
    struct EchoClient {
        answer: &'static str,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl EchoClient {
        fn new(answer: &'static str) -> Self {
            Self {
                answer,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for EchoClient {
        async fn send_chat(
            &self,
            msgs: &[Message],
            _opts: &ChatOpts,
        ) -> Result<ChatResponse, ChatError> {
            self.seen.lock().push(msgs.to_vec());
            Ok(reply(self.answer))
        }

        async fn stream_chat<'a>(
            &'a self,
            _msgs: Vec<Message>,
            _opts: ChatOpts,
        ) -> Result<ChatStream<'a>, ChatError> {
            let items = vec![Ok("He".to_string()), Ok("y".to_string())];
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Never resolves; used to hold the session busy.
    struct StallClient;

    #[async_trait]
    impl ModelClient for StallClient {
        async fn send_chat(
            &self,
            _msgs: &[Message],
            _opts: &ChatOpts,
        ) -> Result<ChatResponse, ChatError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }

        async fn stream_chat<'a>(
            &'a self,
            _msgs: Vec<Message>,
            _opts: ChatOpts,
        ) -> Result<ChatStream<'a>, ChatError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Streams one delta, then fails; plain sends succeed.
    struct FlakyStreamClient;

    #[async_trait]
    impl ModelClient for FlakyStreamClient {
        async fn send_chat(
            &self,
            _msgs: &[Message],
            _opts: &ChatOpts,
        ) -> Result<ChatResponse, ChatError> {
            Ok(reply("recovered"))
        }

        async fn stream_chat<'a>(
            &'a self,
            _msgs: Vec<Message>,
            _opts: ChatOpts,
        ) -> Result<ChatStream<'a>, ChatError> {
            let items = vec![
                Ok("Hi".to_string()),
                Err(ChatError::Network("connection reset".into())),
            ];
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Always fails plain sends.
    struct FailClient;

    #[async_trait]
    impl ModelClient for FailClient {
        async fn send_chat(
            &self,
            _msgs: &[Message],
            _opts: &ChatOpts,
        ) -> Result<ChatResponse, ChatError> {
            Err(ChatError::Server(500))
        }

        async fn stream_chat<'a>(
            &'a self,
            _msgs: Vec<Message>,
            _opts: ChatOpts,
        ) -> Result<ChatStream<'a>, ChatError> {
            Err(ChatError::Server(500))
        }
    }

    fn session_with(system: &str, client: EchoClient) -> Conversation<EchoClient> {
        Conversation::new(
            client,
            SessionOptions {
                system: Some(system.into()),
                initial_messages: Vec::new(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn system_prompt_leads_every_transcript_and_survives_clear() {
        let conv = session_with("Be brief.", EchoClient::new("ok"));
        conv.send("Hello").await.unwrap();
        conv.send("How are you?").await.unwrap();

        let seen = conv.client.seen.lock();
        assert_eq!(seen.len(), 2);
        for transcript in seen.iter() {
            assert_eq!(transcript[0], Message::system("Be brief."));
        }
        // The second request carried the full prior exchange.
        assert_eq!(
            seen[1],
            vec![
                Message::system("Be brief."),
                Message::user("Hello"),
                Message::assistant("ok"),
                Message::user("How are you?"),
            ]
        );
        drop(seen);

        conv.clear().unwrap();
        assert_eq!(conv.history(), vec![Message::system("Be brief.")]);
    }

    #[tokio::test]
    async fn clear_all_discards_the_system_prompt() {
        let conv = session_with("Be brief.", EchoClient::new("ok"));
        conv.send("Hello").await.unwrap();
        conv.clear_all().unwrap();
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn history_returns_a_defensive_copy() {
        let conv = session_with("sys", EchoClient::new("ok"));
        let mut copy = conv.history();
        copy.push(Message::user("not really here"));
        copy[0].content = "tampered".into();
        assert_eq!(conv.history(), vec![Message::system("sys")]);
    }

    #[tokio::test]
    async fn failed_send_keeps_the_user_message_and_goes_idle() {
        let conv = Conversation::new(FailClient, SessionOptions::default()).unwrap();
        let err = conv.send("Hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Server(500)));
        assert_eq!(conv.history(), vec![Message::user("Hello")]);
        // Gate released: local mutation works again.
        conv.add_message(Role::Assistant, "manual note").unwrap();
    }

    #[tokio::test]
    async fn concurrent_calls_are_rejected_without_waiting() {
        let conv = Conversation::new(StallClient, SessionOptions::default()).unwrap();
        {
            let first = conv.send("one");
            pin_mut!(first);
            assert!(futures::poll!(first.as_mut()).is_pending());

            // A second send fails on its first poll, before any suspension.
            let second = conv.send("two");
            pin_mut!(second);
            match futures::poll!(second.as_mut()) {
                Poll::Ready(Err(ChatError::Concurrency)) => {}
                other => panic!("expected immediate Concurrency, got {other:?}"),
            }

            // The synchronous operations are rejected outright as well.
            assert!(matches!(
                conv.add_message(Role::User, "x"),
                Err(ChatError::Concurrency)
            ));
            assert!(matches!(conv.clear(), Err(ChatError::Concurrency)));
            assert!(matches!(conv.clear_all(), Err(ChatError::Concurrency)));
            assert!(matches!(
                conv.send_stream("x").map(|_| ()),
                Err(ChatError::Concurrency)
            ));
        }
        // The stalled call was dropped with its scope, releasing the gate.
        conv.add_message(Role::User, "queued later").unwrap();
    }

    #[tokio::test]
    async fn stream_commits_only_on_successful_exhaustion() {
        let conv = session_with("sys", EchoClient::new("unused"));
        let stream = conv.send_stream("Hello").unwrap();
        let items: Vec<_> = stream.collect().await;
        assert!(items.iter().all(Result::is_ok));

        let hist = conv.history();
        assert_eq!(
            hist,
            vec![
                Message::system("sys"),
                Message::user("Hello"),
                Message::assistant("Hey"),
            ]
        );
    }

    #[tokio::test]
    async fn stream_failure_keeps_the_user_message_and_goes_idle() {
        let conv = Conversation::new(FlakyStreamClient, SessionOptions::default()).unwrap();
        let stream = conv.send_stream("Hello").unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "Hi");
        assert!(matches!(items[1], Err(ChatError::Network(_))));

        // User message stands, no assistant message was committed.
        assert_eq!(conv.history(), vec![Message::user("Hello")]);

        // Back to Idle: a plain send succeeds afterwards.
        let answer = conv.send("again").await.unwrap();
        assert_eq!(answer, "recovered");
        assert_eq!(
            conv.history(),
            vec![
                Message::user("Hello"),
                Message::user("again"),
                Message::assistant("recovered"),
            ]
        );
    }

    #[tokio::test]
    async fn abandoning_a_stream_releases_the_gate_without_committing() {
        let conv = session_with("sys", EchoClient::new("unused"));
        {
            let mut stream = conv.send_stream("Hello").unwrap();
            assert_eq!(stream.next().await.unwrap().unwrap(), "He");
            // Busy while the stream is alive.
            assert!(matches!(conv.clear(), Err(ChatError::Concurrency)));
        }
        // Dropped mid-iteration: gate open, nothing committed.
        assert_eq!(
            conv.history(),
            vec![Message::system("sys"), Message::user("Hello")]
        );
        conv.clear().unwrap();
    }

    #[tokio::test]
    async fn system_role_is_rejected_in_seeds_and_appends() {
        let err = Conversation::new(
            EchoClient::new("ok"),
            SessionOptions {
                system: None,
                initial_messages: vec![Message::system("sneaky")],
            },
        )
        .err()
        .expect("system seed must be rejected");
        assert!(matches!(err, ChatError::Validation(_)));

        let conv = session_with("sys", EchoClient::new("ok"));
        match conv.add_message(Role::System, "late prompt") {
            Err(ChatError::Validation(msg)) => {
                assert!(msg.contains("system prompt"), "message was {msg:?}");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        // The rejection itself must not leave the session busy.
        conv.add_message(Role::User, "fine").unwrap();
    }

    #[tokio::test]
    async fn seeded_messages_are_part_of_the_transcript() {
        let conv = Conversation::new(
            EchoClient::new("ok"),
            SessionOptions {
                system: Some("sys".into()),
                initial_messages: vec![
                    Message::user("earlier question"),
                    Message::assistant("earlier answer"),
                ],
            },
        )
        .unwrap();
        conv.send("next").await.unwrap();
        let seen = conv.client.seen.lock();
        assert_eq!(
            seen[0],
            vec![
                Message::system("sys"),
                Message::user("earlier question"),
                Message::assistant("earlier answer"),
                Message::user("next"),
            ]
        );
    }
}
