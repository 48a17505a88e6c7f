//! Incremental decoder for the newline-framed chat-completions stream.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use relay_core::llm::{ChatError, ChatStream};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const EXCERPT_MAX: usize = 200;

/// Bounded excerpt of an offending payload for diagnostics.
pub(crate) fn excerpt(s: &str) -> String {
    if s.chars().count() <= EXCERPT_MAX {
        s.to_string()
    } else {
        let cut: String = s.chars().take(EXCERPT_MAX).collect();
        format!("{cut}…")
    }
}

/// Reassembles newline-delimited frames from arbitrarily-split reads. The
/// trailing incomplete line is carried over to the next push.
#[derive(Default)]
pub(crate) struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub(crate) fn next_line(&mut self) -> Option<Result<String, ChatError>> {
        let pos = twoway::find_bytes(&self.buf, b"\n")?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        match std::str::from_utf8(&line) {
            Ok(s) => Some(Ok(s.to_string())),
            Err(e) => Some(Err(ChatError::Parse(format!("invalid utf-8 in stream: {e}")))),
        }
    }
}

pub(crate) enum Frame {
    Delta(String),
    Done,
    Skip,
}

/// One frame: empty lines and `:` comments are ignored, `data: [DONE]`
/// terminates, other data payloads must be JSON carrying the delta at
/// `choices[0].delta.content`. Frames without a content string (role
/// announcements, finish markers) and empty-string deltas are skipped.
pub(crate) fn parse_line(line: &str) -> Result<Frame, ChatError> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(Frame::Skip);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(Frame::Skip);
    };
    let payload = payload.trim_start();
    if payload == "[DONE]" {
        return Ok(Frame::Done);
    }
    let v: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
        ChatError::Parse(format!("malformed stream frame ({e}): {}", excerpt(payload)))
    })?;
    match v["choices"][0]["delta"]["content"].as_str() {
        Some("") | None => Ok(Frame::Skip),
        Some(s) => Ok(Frame::Delta(s.to_string())),
    }
}

/// Lazy, forward-only delta sequence over a byte source. The cancellation
/// token is checked before every read; already-yielded deltas stand, the
/// in-flight partial frame is discarded. A corrupt frame ends the stream
/// with `Parse` — mid-stream recovery is not attempted.
pub(crate) fn delta_stream<S>(
    source: S,
    cancel: CancellationToken,
    idle: Duration,
) -> ChatStream<'static>
where
    S: Stream<Item = Result<Bytes, ChatError>> + Send + 'static,
{
    let mut source = Box::pin(source);
    let mut dec = LineDecoder::default();
    Box::pin(async_stream::stream! {
        let mut last = Instant::now();
        'outer: loop {
            if cancel.is_cancelled() {
                yield Err(ChatError::Canceled(Some("canceled during stream".into())));
                break 'outer;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    yield Err(ChatError::Canceled(Some("canceled during stream".into())));
                    break 'outer;
                }
                chunk = source.next() => {
                    match chunk {
                        Some(Ok(b)) => {
                            dec.push(&b);
                            last = Instant::now();
                            loop {
                                match dec.next_line() {
                                    Some(Ok(line)) => match parse_line(&line) {
                                        Ok(Frame::Delta(d)) => { yield Ok(d); }
                                        Ok(Frame::Done) => break 'outer,
                                        Ok(Frame::Skip) => {}
                                        Err(e) => { yield Err(e); break 'outer; }
                                    },
                                    Some(Err(e)) => { yield Err(e); break 'outer; }
                                    None => break,
                                }
                            }
                        }
                        Some(Err(e)) => { yield Err(e); break 'outer; }
                        None => break 'outer,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if last.elapsed() > idle {
                        yield Err(ChatError::Network("stream idle timeout".into()));
                        break 'outer;
                    }
                }
            }
        }
    })
}
