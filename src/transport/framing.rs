//! Frame splitting for the HTTP body
//!
//! The body arrives in arbitrary chunks. Two framings are supported and the
//! choice is explicit configuration, never inferred from the response:
//!
//! - [`FrameFormat::EventStream`]: `event:`/`data:` lines, frames delimited by a
//!   blank line. Parsed with `eventsource-stream`, which handles UTF-8 and
//!   partial-line buffering across chunk boundaries.
//! - [`FrameFormat::JsonLines`]: one JSON document per newline-terminated line,
//!   split with a `tokio-util` delimiter codec. A leading `data:` prefix is
//!   tolerated.
//!
//! Transport failures surface as `Err` (fatal). Frames that cannot be read as
//! text surface as [`Frame::Unreadable`] with their raw bytes, and the caller
//! skips them.

use crate::error::InferenceError;
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::pin::Pin;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

/// Longest JSON line accepted before the stream is failed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Wire framing of the HTTP response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameFormat {
    #[default]
    EventStream,
    JsonLines,
}

impl FrameFormat {
    /// `Accept` header value for this framing.
    pub const fn accept(self) -> &'static str {
        match self {
            Self::EventStream => "text/event-stream",
            Self::JsonLines => "application/octet-stream",
        }
    }
}

impl std::str::FromStr for FrameFormat {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event-stream" | "sse" => Ok(Self::EventStream),
            "json-lines" | "raw" | "ndjson" => Ok(Self::JsonLines),
            other => Err(InferenceError::ConfigurationError(format!(
                "Unknown frame format: {other}"
            ))),
        }
    }
}

/// One frame split from the body.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Frame payload text.
    Payload(String),
    /// Bytes that do not form a readable frame.
    Unreadable {
        raw: Vec<u8>,
        error: InferenceError,
    },
}

/// Stream of frames. `Err` items are fatal.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, InferenceError>> + Send>>;

/// Split a byte stream into frames.
pub fn frames<S, B, E>(body: S, format: FrameFormat) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    match format {
        FrameFormat::EventStream => Box::pin(body.eventsource().filter_map(|item| async move {
            match item {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(Frame::Payload(event.data))),
                Err(EventStreamError::Transport(e)) => {
                    Some(Err(InferenceError::HttpError(format!("Stream error: {e}"))))
                }
                Err(EventStreamError::Utf8(e)) => Some(Ok(Frame::Unreadable {
                    error: InferenceError::DecodeError(format!("Invalid UTF-8 in frame: {e}")),
                    raw: e.into_bytes(),
                })),
                Err(EventStreamError::Parser(e)) => Some(Ok(Frame::Unreadable {
                    raw: Vec::new(),
                    error: InferenceError::DecodeError(format!("SSE parsing error: {e}")),
                })),
            }
        })),
        FrameFormat::JsonLines => json_lines(body, MAX_LINE_BYTES),
    }
}

fn json_lines<S, B, E>(body: S, max_line: usize) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = StreamReader::new(body.map(|chunk| match chunk {
        Ok(chunk) => Ok(Bytes::copy_from_slice(chunk.as_ref())),
        Err(e) => Err(std::io::Error::other(e.to_string())),
    }));
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line);

    // FramedRead ends after the first codec error, so an oversized line is fatal.
    Box::pin(FramedRead::new(reader, codec).filter_map(move |line| async move {
        match line {
            Ok(line) => line_payload(&line).map(Ok),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Some(Err(
                InferenceError::HttpError(format!("Frame exceeds {max_line} bytes")),
            )),
            Err(AnyDelimiterCodecError::Io(e)) => {
                Some(Err(InferenceError::HttpError(format!("Stream error: {e}"))))
            }
        }
    }))
}

fn line_payload(line: &[u8]) -> Option<Frame> {
    let line = line.trim_ascii();
    let line = line.strip_prefix(b"data:").unwrap_or(line).trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(match String::from_utf8(line.to_vec()) {
        Ok(text) => Frame::Payload(text),
        Err(e) => Frame::Unreadable {
            error: InferenceError::DecodeError(format!("Invalid UTF-8 in frame: {e}")),
            raw: e.into_bytes(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn body(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<&'static [u8], Infallible>> + Send + 'static {
        futures::stream::iter(chunks.into_iter().map(Ok))
    }

    fn payloads(out: Vec<Result<Frame, InferenceError>>) -> Vec<String> {
        out.into_iter()
            .map(|frame| match frame.unwrap() {
                Frame::Payload(text) => text,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn event_stream_reassembles_split_frames() {
        let out: Vec<_> = frames(
            body(vec![
                b"event: token\ndata: {\"a\"".as_slice(),
                b":1}\n\n: keep-alive\n\ndata: {\"b\":2}\n".as_slice(),
                b"\n".as_slice(),
            ]),
            FrameFormat::EventStream,
        )
        .collect()
        .await;
        assert_eq!(payloads(out), vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[tokio::test]
    async fn json_lines_buffers_partial_lines() {
        let out: Vec<_> = frames(
            body(vec![
                b"{\"a\":".as_slice(),
                b"1}\n\n{\"b\":2}\r\ndata: {\"c\":3}\n{\"d\"".as_slice(),
                b":4}".as_slice(),
            ]),
            FrameFormat::JsonLines,
        )
        .collect()
        .await;
        assert_eq!(
            payloads(out),
            vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#, r#"{"d":4}"#]
        );
    }

    #[tokio::test]
    async fn json_lines_keeps_invalid_utf8_as_skippable_frame() {
        let out: Vec<_> = frames(
            body(vec![b"{\"a\":1}\n\xff\xfe\n{\"b\":2}\n".as_slice()]),
            FrameFormat::JsonLines,
        )
        .collect()
        .await;
        assert_eq!(out.len(), 3);
        match &out[1] {
            Ok(Frame::Unreadable { raw, error }) => {
                assert_eq!(raw, &vec![0xff, 0xfe]);
                assert!(matches!(error, InferenceError::DecodeError(_)));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(out[2], Ok(Frame::Payload(r#"{"b":2}"#.to_string())));
    }

    #[tokio::test]
    async fn oversized_line_fails_the_stream() {
        let out: Vec<_> = json_lines(
            body(vec![
                b"{\"a\":1}\n".as_slice(),
                b"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx".as_slice(),
                b"xxxxxxxx".as_slice(),
            ]),
            16,
        )
        .collect()
        .await;
        assert_eq!(out[0], Ok(Frame::Payload(r#"{"a":1}"#.to_string())));
        assert!(matches!(out[1], Err(InferenceError::HttpError(_))));
        assert_eq!(out.iter().filter(|frame| frame.is_ok()).count(), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_fatal() {
        let body = futures::stream::iter(vec![Ok(b"{}\n".as_slice()), Err("reset")]);
        let out: Vec<_> = frames(body, FrameFormat::JsonLines).collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(InferenceError::HttpError(_))));
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("sse".parse::<FrameFormat>().unwrap(), FrameFormat::EventStream);
        assert_eq!("json-lines".parse::<FrameFormat>().unwrap(), FrameFormat::JsonLines);
        assert!("xml".parse::<FrameFormat>().is_err());
    }
}
