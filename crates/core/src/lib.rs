pub mod llm {
    use async_trait::async_trait;
    use futures::Stream;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;
    use tokio_util::sync::CancellationToken;

    use std::pin::Pin;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Message {
        pub role: Role,
        pub content: String,
    }

    impl Message {
        pub fn system<S: Into<String>>(s: S) -> Self {
            Self {
                role: Role::System,
                content: s.into(),
            }
        }
        pub fn user<S: Into<String>>(s: S) -> Self {
            Self {
                role: Role::User,
                content: s.into(),
            }
        }
        pub fn assistant<S: Into<String>>(s: S) -> Self {
            Self {
                role: Role::Assistant,
                content: s.into(),
            }
        }
    }

    /// Per-call options. `retry_enabled`/`max_retries` left as `None` fall
    /// back to the client configuration (enabled, 3 retries).
    #[derive(Clone, Debug)]
    pub struct ChatOpts {
        pub model: Option<String>,
        pub temperature: Option<f32>,
        pub top_p: Option<f32>,
        pub max_tokens: Option<u32>,
        pub stop: Option<Vec<String>>,
        pub retry_enabled: Option<bool>,
        pub max_retries: Option<u32>,
        pub cancel: CancellationToken,
    }

    impl Default for ChatOpts {
        fn default() -> Self {
            Self {
                model: None,
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: None,
                retry_enabled: None,
                max_retries: None,
                cancel: CancellationToken::new(),
            }
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Usage {
        pub prompt_tokens: u32,
        pub completion_tokens: u32,
        pub total_tokens: u32,
    }

    #[derive(Clone, Debug)]
    pub struct ChatResponse {
        pub content: String,
        pub usage: Usage,
        pub model: String,
        pub id: String,
        pub finish_reason: Option<String>,
        pub latency_ms: u64,
    }

    #[derive(Error, Debug)]
    pub enum ChatError {
        #[error("invalid request: {0}")]
        Validation(String),
        #[error("auth rejected (http {0})")]
        Auth(u16),
        #[error("rate limited (http {status})")]
        RateLimit {
            status: u16,
            retry_after: Option<f64>,
        },
        #[error("model not found (http {0})")]
        Model(u16),
        #[error("server error (http {0})")]
        Server(u16),
        #[error("network: {0}")]
        Network(String),
        #[error("parse: {0}")]
        Parse(String),
        #[error("a request is already in flight")]
        Concurrency,
        #[error("canceled")]
        Canceled(Option<String>),
    }

    /// Map a non-2xx HTTP status to its failure kind. Pure; the caller
    /// supplies a pre-validated Retry-After hint for 429 responses.
    pub fn classify_status(status: u16, retry_after: Option<f64>) -> ChatError {
        match status {
            429 => ChatError::RateLimit {
                status,
                retry_after,
            },
            401 | 403 => ChatError::Auth(status),
            404 => ChatError::Model(status),
            _ => ChatError::Server(status),
        }
    }

    pub type ChatStream<'a> = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send + 'a>>;

    #[async_trait]
    pub trait ModelClient: Send + Sync {
        async fn send_chat(
            &self,
            msgs: &[Message],
            opts: &ChatOpts,
        ) -> Result<ChatResponse, ChatError>;
        async fn stream_chat<'a>(
            &'a self,
            msgs: Vec<Message>,
            opts: ChatOpts,
        ) -> Result<ChatStream<'a>, ChatError>;
    }

}
