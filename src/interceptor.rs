//! Stream interceptor interfaces
//!
//! Interceptors observe a request's lifecycle on either transport: the request
//! about to go out, every raw frame or message received, decode failures, and
//! the terminal outcome. The hooks are best-effort, must be cheap, and cannot
//! alter the stream.

use crate::error::InferenceError;
use crate::transport::StreamOutcome;
use crate::types::InferenceRequest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which transport produced an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Broker,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Broker => "broker",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context passed to interceptors describing the request.
#[derive(Clone, Debug)]
pub struct InterceptorContext {
    pub transport: TransportKind,
    pub correlation_id: Uuid,
    pub model: String,
}

impl InterceptorContext {
    pub fn new(transport: TransportKind, request: &InferenceRequest) -> Self {
        Self {
            transport,
            correlation_id: request.correlation_id(),
            model: request.model().to_string(),
        }
    }
}

/// Stream interceptor trait
pub trait StreamInterceptor: Send + Sync {
    /// Called once before the request is sent or published.
    fn on_request(&self, _ctx: &InterceptorContext, _request: &InferenceRequest) {}

    /// Called for every raw frame (HTTP) or message payload (broker).
    fn on_frame(&self, _ctx: &InterceptorContext, _raw: &[u8]) {}

    /// Called when a frame fails to decode and is skipped.
    fn on_decode_error(&self, _ctx: &InterceptorContext, _raw: &[u8], _error: &InferenceError) {}

    /// Called exactly once when the stream reaches a terminal condition.
    fn on_terminal(&self, _ctx: &InterceptorContext, _outcome: &StreamOutcome) {}
}

/// A simple logging interceptor backed by `tracing` (no payload content above
/// `trace`).
#[derive(Clone, Debug, Default)]
pub struct LoggingInterceptor;

impl StreamInterceptor for LoggingInterceptor {
    fn on_request(&self, ctx: &InterceptorContext, request: &InferenceRequest) {
        tracing::debug!(target: "inference_stream::interceptor", transport=%ctx.transport, correlation_id=%ctx.correlation_id, model=%ctx.model, messages=request.messages().len(), "request");
    }

    fn on_frame(&self, ctx: &InterceptorContext, raw: &[u8]) {
        tracing::trace!(target: "inference_stream::interceptor", transport=%ctx.transport, correlation_id=%ctx.correlation_id, bytes=raw.len(), "frame");
    }

    fn on_decode_error(&self, ctx: &InterceptorContext, _raw: &[u8], error: &InferenceError) {
        tracing::debug!(target: "inference_stream::interceptor", transport=%ctx.transport, correlation_id=%ctx.correlation_id, err=%error, "frame skipped");
    }

    fn on_terminal(&self, ctx: &InterceptorContext, outcome: &StreamOutcome) {
        tracing::debug!(target: "inference_stream::interceptor", transport=%ctx.transport, correlation_id=%ctx.correlation_id, outcome=?outcome, "stream terminal");
    }
}

/// Fan-out helper over a list of interceptors.
#[derive(Clone, Default)]
pub(crate) struct Interceptors {
    list: Vec<std::sync::Arc<dyn StreamInterceptor>>,
}

impl Interceptors {
    pub(crate) fn new(list: Vec<std::sync::Arc<dyn StreamInterceptor>>) -> Self {
        Self { list }
    }

    pub(crate) fn request(&self, ctx: &InterceptorContext, request: &InferenceRequest) {
        for it in &self.list {
            it.on_request(ctx, request);
        }
    }

    pub(crate) fn frame(&self, ctx: &InterceptorContext, raw: &[u8]) {
        for it in &self.list {
            it.on_frame(ctx, raw);
        }
    }

    pub(crate) fn decode_error(&self, ctx: &InterceptorContext, raw: &[u8], error: &InferenceError) {
        for it in &self.list {
            it.on_decode_error(ctx, raw, error);
        }
    }

    pub(crate) fn terminal(&self, ctx: &InterceptorContext, outcome: &StreamOutcome) {
        for it in &self.list {
            it.on_terminal(ctx, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LLAMA_3_2_1B_ENCRYPTED, ModelMap};
    use crate::request::RequestBuilder;
    use crate::tokenizer::EncodedPrompt;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn request() -> InferenceRequest {
        RequestBuilder::new(Arc::new(ModelMap::with_defaults()))
            .build(EncodedPrompt::TokenIds(vec![1]), LLAMA_3_2_1B_ENCRYPTED, None)
            .unwrap()
    }

    #[test]
    #[traced_test]
    fn logging_interceptor_reports_lifecycle() {
        let request = request();
        let ctx = InterceptorContext::new(TransportKind::Broker, &request);
        let interceptors = Interceptors::new(vec![Arc::new(LoggingInterceptor)]);

        interceptors.request(&ctx, &request);
        interceptors.decode_error(&ctx, b"{", &InferenceError::DecodeError("eof".into()));
        interceptors.terminal(&ctx, &StreamOutcome::Ended);

        assert!(logs_contain("frame skipped"));
        assert!(logs_contain("stream terminal"));
        assert!(logs_contain(&request.correlation_id().to_string()));
    }

    #[test]
    fn context_carries_request_identity() {
        let request = request();
        let ctx = InterceptorContext::new(TransportKind::Http, &request);
        assert_eq!(ctx.correlation_id, request.correlation_id());
        assert_eq!(ctx.model, "meta-llama/Llama-3.2-1B-Instruct-he");
        assert_eq!(ctx.transport.to_string(), "http");
    }
}
