//! Fixture helpers: build response fragments, frame them for the HTTP body, and
//! drain transport streams

use futures_util::StreamExt;
use inference_stream::Result;
use inference_stream::transport::{FragmentStream, StreamSignal};
use serde_json::{Value, json};

/// One response fragment as the worker sends it.
pub fn fragment(content: &str, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "content": content },
            "finish_reason": finish_reason
        }]
    })
}

/// Event-stream body: each payload becomes one `data:` frame followed by a
/// blank line.
pub fn sse_body<I, S>(payloads: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    payloads
        .into_iter()
        .map(|p| format!("event: message\ndata: {}\n\n", p.as_ref()))
        .collect()
}

/// Newline-delimited JSON body.
pub fn json_lines_body<I, S>(payloads: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    payloads
        .into_iter()
        .map(|p| format!("{}\n", p.as_ref()))
        .collect()
}

/// The "Hel" / "lo" exchange.
pub fn hello_fragments() -> Vec<String> {
    vec![
        fragment("Hel", None).to_string(),
        fragment("lo", Some("stop")).to_string(),
    ]
}

/// Drain a transport stream.
pub async fn collect_signals(mut stream: FragmentStream) -> Vec<Result<StreamSignal>> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.push(item);
    }
    out
}

/// Drain a transport stream, failing the test on any error item.
pub async fn collect_ok(stream: FragmentStream) -> Vec<StreamSignal> {
    collect_signals(stream)
        .await
        .into_iter()
        .map(|item| item.expect("stream item"))
        .collect()
}
