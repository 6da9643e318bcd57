//! Streaming SSE parser for the upstream chat response body.
//!
//! Events are `data:`-only; the payload type rides inside the JSON. Bytes
//! accumulate in a buffer and complete events are split off on the `\n\n`
//! delimiter, so partial chunks from HTTP chunked transfer reassemble
//! correctly and the body is never buffered to EOF.

use bytes::Bytes;
use futures::stream::Stream;
use pin_project::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Parse `data:` payloads out of a block of complete SSE events.
pub fn parse_sse_data(input: &str) -> Vec<String> {
    let mut payloads = Vec::with_capacity(4);
    let mut current = String::new();

    for line in input.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                payloads.push(std::mem::take(&mut current));
            }
        } else if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(data.trim_start());
        }
        // other fields (id:, retry:, event:) are irrelevant here
    }
    if !current.is_empty() {
        payloads.push(current);
    }

    payloads
}

/// Adapter turning a byte stream into a stream of SSE data payloads.
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    buffer: String,
    queue: VecDeque<String>,
    ended: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: String::new(),
            queue: VecDeque::new(),
            ended: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<String, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if let Some(payload) = this.queue.pop_front() {
            return Poll::Ready(Some(Ok(payload)));
        }
        if *this.ended {
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    this.buffer.push_str(text);

                    if let Some(last_end) = this.buffer.rfind("\n\n") {
                        let complete = &this.buffer[..last_end + 2];
                        for payload in parse_sse_data(complete) {
                            this.queue.push_back(payload);
                        }
                        this.buffer.drain(..last_end + 2);

                        if let Some(payload) = this.queue.pop_front() {
                            return Poll::Ready(Some(Ok(payload)));
                        }
                    }
                }
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                *this.ended = true;
                if !this.buffer.is_empty() {
                    let leftover = std::mem::take(this.buffer);
                    for payload in parse_sse_data(&leftover) {
                        this.queue.push_back(payload);
                    }
                }
                match this.queue.pop_front() {
                    Some(payload) => Poll::Ready(Some(Ok(payload))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let payloads = parse_sse_data("data: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn multiple_events() {
        let payloads = parse_sse_data("data: one\n\ndata: two\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["one", "two", "[DONE]"]);
    }

    #[test]
    fn missing_trailing_delimiter_still_yields_event() {
        let payloads = parse_sse_data("data: tail");
        assert_eq!(payloads, vec!["tail"]);
    }

    #[test]
    fn non_data_fields_are_ignored() {
        let payloads = parse_sse_data("event: chat\nid: 7\ndata: body\n\n");
        assert_eq!(payloads, vec!["body"]);
    }

    #[tokio::test]
    async fn stream_reassembles_split_chunks() {
        use futures::StreamExt;

        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from("data: {\"part\":")),
            Ok(Bytes::from("1}\n\ndata: {\"part\":2}\n\n")),
        ];
        let inner = futures::stream::iter(chunks);
        let payloads: Vec<String> = SseStream::new(inner)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(payloads, vec!["{\"part\":1}", "{\"part\":2}"]);
    }
}
