use crate::openai::config::OpenAiConfig;
use crate::openai::retry::{self, RetryPolicy};
use crate::openai::sse::{self, excerpt};
use async_trait::async_trait;
use futures::TryStreamExt;
use relay_core::llm::{
    classify_status, ChatError, ChatOpts, ChatResponse, ChatStream, Message, ModelClient, Role,
    Usage,
};
use reqwest::{header, Client};
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> anyhow::Result<Self> {
        if cfg.api_key.is_empty() {
            anyhow::bail!("api key is required");
        }
        url::Url::parse(&cfg.base_url)
            .map_err(|e| anyhow::anyhow!("invalid base url {:?}: {e}", cfg.base_url))?;
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", cfg.api_key))?,
        );
        let mut builder = Client::builder()
            .default_headers(headers)
            .use_rustls_tls()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .connect_timeout(Duration::from_secs(10));
        if let Some(p) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(p)?);
        }
        let http = builder.build()?;
        Ok(Self { http, cfg })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }

    fn map_messages(&self, msgs: &[Message]) -> Vec<serde_json::Value> {
        msgs.iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                serde_json::json!({"role": role, "content": m.content})
            })
            .collect()
    }

    fn request_body(&self, msgs: &[Message], opts: &ChatOpts, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": opts.model.as_deref().unwrap_or(&self.cfg.model),
            "messages": self.map_messages(msgs),
            "stream": stream,
            "temperature": opts.temperature,
            "top_p": opts.top_p,
            "max_tokens": opts.max_tokens,
            "stop": opts.stop,
        })
    }

    fn policy_for(&self, opts: &ChatOpts) -> RetryPolicy {
        RetryPolicy::new(
            opts.max_retries.unwrap_or(self.cfg.max_retries),
            opts.retry_enabled.unwrap_or(self.cfg.retry_enabled),
        )
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn send_chat(
        &self,
        msgs: &[Message],
        opts: &ChatOpts,
    ) -> Result<ChatResponse, ChatError> {
        if msgs.is_empty() {
            return Err(ChatError::Validation("messages must not be empty".into()));
        }
        let url = self.chat_url();
        let body = self.request_body(msgs, opts, false);
        let model = opts.model.clone().unwrap_or_else(|| self.cfg.model.clone());
        info!(target:"providers::openai", "chat request model={model} url={url}");
        let policy = self.policy_for(opts);
        let started = Instant::now();
        let resp = retry::execute(&policy, &opts.cancel, || {
            let req = self
                .http
                .post(&url)
                .timeout(self.cfg.request_timeout)
                .json(&body);
            attempt_once(req)
        })
        .await?;
        let raw = resp.text().await.map_err(map_reqwest_err)?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let reply = parse_completion(&raw, &model, latency_ms)?;
        debug!(
            target:"providers::openai",
            "chat done id={} total_tokens={} latency_ms={latency_ms}",
            reply.id,
            reply.usage.total_tokens
        );
        Ok(reply)
    }

    async fn stream_chat<'a>(
        &'a self,
        msgs: Vec<Message>,
        opts: ChatOpts,
    ) -> Result<ChatStream<'a>, ChatError> {
        if msgs.is_empty() {
            return Err(ChatError::Validation("messages must not be empty".into()));
        }
        let url = self.chat_url();
        let body = self.request_body(&msgs, &opts, true);
        info!(
            target:"providers::openai",
            "chat stream model={} url={url}",
            opts.model.as_deref().unwrap_or(&self.cfg.model)
        );
        // A response the server may already be emitting (and billing) must
        // not be replayed; the first failure is final.
        let resp = retry::execute(&RetryPolicy::no_retry(), &opts.cancel, || {
            let req = self.http.post(&url).json(&body);
            attempt_once(req)
        })
        .await?;
        let source = resp.bytes_stream().map_err(map_reqwest_err);
        Ok(sse::delta_stream(
            source,
            opts.cancel.clone(),
            self.cfg.stream_idle_timeout,
        ))
    }
}

async fn attempt_once(req: reqwest::RequestBuilder) -> Result<reqwest::Response, ChatError> {
    let resp = req.send().await.map_err(map_reqwest_err)?;
    let status = resp.status();
    if !status.is_success() {
        let retry_after = retry::parse_retry_after(resp.headers());
        let body = resp.text().await.ok();
        warn!(target:"providers::openai", "chat non-2xx status={status} body={body:?}");
        return Err(classify_status(status.as_u16(), retry_after));
    }
    Ok(resp)
}

fn map_reqwest_err(e: reqwest::Error) -> ChatError {
    ChatError::Network(e.to_string())
}

fn parse_completion(
    raw: &str,
    fallback_model: &str,
    latency_ms: u64,
) -> Result<ChatResponse, ChatError> {
    let v: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ChatError::Parse(format!("invalid response body ({e}): {}", excerpt(raw))))?;
    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| ChatError::Parse(format!("response missing choices: {}", excerpt(raw))))?;
    let message = choice
        .get("message")
        .filter(|m| m.is_object())
        .ok_or_else(|| ChatError::Parse(format!("choice missing message: {}", excerpt(raw))))?;
    // An absent content field is a malformed reply; an explicit null or
    // empty string is an accepted empty response.
    let content = match message.get("content") {
        None => {
            return Err(ChatError::Parse(format!(
                "message missing content: {}",
                excerpt(raw)
            )))
        }
        Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(ChatError::Parse(format!(
                "non-text message content: {}",
                excerpt(raw)
            )))
        }
    };
    let usage = v.get("usage").map(parse_usage).unwrap_or_default();
    Ok(ChatResponse {
        content,
        usage,
        model: v["model"].as_str().unwrap_or(fallback_model).to_string(),
        id: v["id"].as_str().unwrap_or_default().to_string(),
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        latency_ms,
    })
}

fn parse_usage(u: &serde_json::Value) -> Usage {
    Usage {
        prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: u["total_tokens"].as_u64().unwrap_or(0) as u32,
    }
}
