use log::{debug, trace};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::failure::FailureKind;

/// Prefix carried by every server-sent-event data line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload of the data line that terminates an OpenAI-compatible stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A source of text lines from a streaming response body.
///
/// The HTTP transport implements this over the raw body; tests script it.
pub trait LineSource {
    /// Returns the next line without its terminator, or `None` once the body
    /// is closed.
    fn next_line(&mut self) -> impl Future<Output = Result<Option<String>, FailureKind>> + Send;
}

/// Timings extracted from one streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Arrival of the first complete JSON object, if there was one.
    pub first_object: Option<Duration>,
    /// From request start to the terminal event.
    pub latency: Duration,
    /// `usage.total_tokens` reported by the server, 0 if never reported.
    pub tokens: u64,
}

impl StreamTiming {
    /// Time to first token. A stream that never produced a parseable object
    /// is scored with its total latency.
    pub fn ttft(&self) -> Duration {
        self.first_object.unwrap_or(self.latency)
    }
}

/// Consumes a completion stream and measures it against `start`.
///
/// Data lines are accumulated until they form a complete JSON object, so a
/// server that splits one object over several lines is still measured at the
/// moment the object became whole. Reading stops at the `[DONE]` sentinel, at
/// the end of the body, or as soon as an object reports usage.
pub async fn read_stream<S: LineSource>(
    lines: &mut S,
    start: Instant,
) -> Result<StreamTiming, FailureKind> {
    let mut buffer = String::new();
    let mut first_object = None;
    let mut tokens = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };

        if data.trim() == DONE_SENTINEL {
            break;
        }

        buffer.push_str(data);
        let parsed: Value = match serde_json::from_str(&buffer) {
            Ok(value) => {
                buffer.clear();
                value
            }
            Err(_) => {
                trace!("incomplete stream object ({} bytes buffered)", buffer.len());
                continue;
            }
        };

        if first_object.is_none() {
            first_object = Some(start.elapsed());
        }

        if let Some(total) = parsed
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64)
        {
            tokens = total;
            break;
        }
    }

    if !buffer.is_empty() {
        debug!(
            "Stream ended with {} bytes that never formed a JSON object",
            buffer.len()
        );
    }

    Ok(StreamTiming {
        first_object,
        latency: start.elapsed(),
        tokens,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Yields each line after its delay has elapsed.
    pub(crate) struct ScriptedLines {
        script: VecDeque<(Duration, String)>,
        pub(crate) consumed: usize,
    }

    impl ScriptedLines {
        pub(crate) fn new(script: &[(u64, &str)]) -> Self {
            Self {
                script: script
                    .iter()
                    .map(|(ms, line)| (Duration::from_millis(*ms), line.to_string()))
                    .collect(),
                consumed: 0,
            }
        }
    }

    impl LineSource for ScriptedLines {
        async fn next_line(&mut self) -> Result<Option<String>, FailureKind> {
            match self.script.pop_front() {
                Some((delay, line)) => {
                    tokio::time::sleep(delay).await;
                    self.consumed += 1;
                    Ok(Some(line))
                }
                None => Ok(None),
            }
        }
    }

    struct BrokenLines;

    impl LineSource for BrokenLines {
        async fn next_line(&mut self) -> Result<Option<String>, FailureKind> {
            Err(FailureKind::Other("Request failed: connection reset".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttft_and_usage() {
        let mut lines = ScriptedLines::new(&[
            (100, r#"data: {"choices":[{"delta":{"content":"Hi"}}],"usage":null}"#),
            (30, r#"data: {"choices":[{"delta":{"content":"!"}}],"usage":null}"#),
            (20, r#"data: {"choices":[],"usage":{"prompt_tokens":4,"total_tokens":12}}"#),
            (10, "data: [DONE]"),
        ]);

        let timing = read_stream(&mut lines, Instant::now()).await.unwrap();
        assert_eq!(timing.first_object, Some(Duration::from_millis(100)));
        assert_eq!(timing.ttft(), Duration::from_millis(100));
        assert_eq!(timing.tokens, 12);
        // Usage stops the read, the sentinel is never pulled
        assert_eq!(timing.latency, Duration::from_millis(150));
        assert_eq!(lines.consumed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_object_split_across_lines() {
        let mut lines = ScriptedLines::new(&[
            (40, r#"data: {"choices":[{"delta":"#),
            (0, ": keep-alive"),
            (25, r#"data: {"content":"Hel"}}]}"#),
            (50, r#"data: {"usage":{"total_tokens":"#),
            (5, "data: 7}}"),
        ]);

        let timing = read_stream(&mut lines, Instant::now()).await.unwrap();
        assert_eq!(timing.first_object, Some(Duration::from_millis(65)));
        assert_eq!(timing.tokens, 7);
        assert_eq!(timing.latency, Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_parseable_object() {
        let mut lines = ScriptedLines::new(&[
            (10, ""),
            (10, "event: ping"),
            (30, "data: [DONE]"),
        ]);

        let timing = read_stream(&mut lines, Instant::now()).await.unwrap();
        assert_eq!(timing.first_object, None);
        assert_eq!(timing.tokens, 0);
        assert_eq!(timing.latency, Duration::from_millis(50));
        assert_eq!(timing.ttft(), timing.latency);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_keeps_tokens_seen_so_far() {
        let mut lines = ScriptedLines::new(&[
            (5, r#"data: {"choices":[{"text":"a"}]}"#),
            (5, "data:  [DONE] "),
            (5, r#"data: {"usage":{"total_tokens":99}}"#),
        ]);

        let timing = read_stream(&mut lines, Instant::now()).await.unwrap();
        assert_eq!(timing.first_object, Some(Duration::from_millis(5)));
        assert_eq!(timing.tokens, 0);
        assert_eq!(lines.consumed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_fragment_dropped() {
        let mut lines = ScriptedLines::new(&[(5, r#"data: {"usage":{"total_tok"#)]);

        let timing = read_stream(&mut lines, Instant::now()).await.unwrap();
        assert_eq!(timing.first_object, None);
        assert_eq!(timing.tokens, 0);
        assert_eq!(timing.ttft(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let result = read_stream(&mut BrokenLines, Instant::now()).await;
        assert!(matches!(result, Err(FailureKind::Other(_))));
    }
}
