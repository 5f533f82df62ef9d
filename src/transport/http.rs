//! Streaming-HTTP transport
//!
//! Posts the serialized request once and turns the response body into a
//! stream of content deltas. The first-token deadline runs from the moment the
//! request is sent until the first fragment decodes; after that the stream may
//! be arbitrarily slow.

use super::framing::{self, Frame, FrameFormat};
use super::{FragmentStream, StreamOutcome, StreamSignal, TerminalOnce, Transport};
use crate::codec::{decode_fragment, is_done_marker};
use crate::error::{InferenceError, Result};
use crate::interceptor::{InterceptorContext, Interceptors, StreamInterceptor, TransportKind};
use crate::types::InferenceRequest;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default first-token deadline.
pub const DEFAULT_FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for [`HttpStreamTransport`].
#[derive(Debug, Clone)]
pub struct HttpStreamConfig {
    /// Endpoint receiving the POST.
    pub url: String,
    /// Body framing.
    pub frame_format: FrameFormat,
    /// Deadline for the first decoded fragment.
    pub first_token_timeout: Duration,
    /// Optional bearer credential, passed through opaquely.
    pub api_key: Option<SecretString>,
    /// TCP connect timeout for the underlying client.
    pub connect_timeout: Option<Duration>,
}

impl HttpStreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            frame_format: FrameFormat::default(),
            first_token_timeout: DEFAULT_FIRST_TOKEN_TIMEOUT,
            api_key: None,
            connect_timeout: None,
        }
    }

    pub fn with_frame_format(mut self, format: FrameFormat) -> Self {
        self.frame_format = format;
        self
    }

    pub fn with_first_token_timeout(mut self, timeout: Duration) -> Self {
        self.first_token_timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(InferenceError::ConfigurationError(
                "Stream URL cannot be empty".to_string(),
            ));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(InferenceError::ConfigurationError(
                "Stream URL must start with http:// or https://".to_string(),
            ));
        }
        if self.first_token_timeout.is_zero() {
            return Err(InferenceError::ConfigurationError(
                "First-token timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a `reqwest` client honoring this configuration.
    ///
    /// No overall request timeout is set: long streams run until a terminal
    /// fragment or cancellation.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| InferenceError::ConfigurationError(format!("Failed to build HTTP client: {e}")))
    }
}

/// HTTP event-stream transport.
#[derive(Clone)]
pub struct HttpStreamTransport {
    config: HttpStreamConfig,
    client: reqwest::Client,
    interceptors: Interceptors,
}

impl HttpStreamTransport {
    pub fn new(config: HttpStreamConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            interceptors: Interceptors::default(),
        }
    }

    /// Create a transport with its own client.
    pub fn from_config(config: HttpStreamConfig) -> Result<Self> {
        config.validate()?;
        let client = config.build_client()?;
        Ok(Self::new(config, client))
    }

    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn StreamInterceptor>>) -> Self {
        self.interceptors = Interceptors::new(interceptors);
        self
    }

    pub fn config(&self) -> &HttpStreamConfig {
        &self.config
    }

    fn request_builder(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(&self.config.url)
            .header(ACCEPT, self.config.frame_format.accept())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

enum Step {
    Frame(Option<Result<Frame>>),
    TimedOut,
    Cancelled,
}

#[async_trait::async_trait]
impl Transport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let ctx = InterceptorContext::new(TransportKind::Http, &request);
        let interceptors = self.interceptors.clone();
        interceptors.request(&ctx, &request);
        let mut terminal = TerminalOnce::new(ctx.clone(), interceptors.clone());

        let body = request.to_json_bytes()?;
        let deadline = Instant::now() + self.config.first_token_timeout;
        tracing::debug!(target: "inference_stream::http", url=%self.config.url, correlation_id=%ctx.correlation_id, "sending request");

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminal.fire(StreamOutcome::Cancelled);
                let empty: FragmentStream = Box::pin(futures::stream::empty());
                return Ok(empty);
            }
            sent = tokio::time::timeout_at(deadline, self.request_builder(body).send()) => sent,
        };

        let response = match sent {
            Err(_) => {
                tracing::warn!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, "no response before first-token deadline");
                terminal.fire(StreamOutcome::NoData);
                let no_data: FragmentStream =
                    Box::pin(futures::stream::once(async { Ok(StreamSignal::NoData) }));
                return Ok(no_data);
            }
            Ok(Err(e)) => {
                let err = InferenceError::HttpError(format!("Failed to send request: {e}"));
                terminal.fire(StreamOutcome::Failed(err.to_string()));
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => format!("<failed to read error body: {e}>"),
            };
            let err = InferenceError::HttpStatus {
                status: status.as_u16(),
                body,
            };
            tracing::debug!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, status=status.as_u16(), "request rejected");
            terminal.fire(StreamOutcome::Failed(err.to_string()));
            return Err(err);
        }
        tracing::debug!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, status=status.as_u16(), "response received");

        let mut frames = framing::frames(response.bytes_stream(), self.config.frame_format);

        let stream = async_stream::stream! {
            let mut terminal = terminal;
            let mut first_seen = false;

            loop {
                let step = if first_seen {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Step::Cancelled,
                        frame = frames.next() => Step::Frame(frame),
                    }
                } else {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Step::Cancelled,
                        frame = tokio::time::timeout_at(deadline, frames.next()) => match frame {
                            Ok(frame) => Step::Frame(frame),
                            Err(_) => Step::TimedOut,
                        },
                    }
                };

                let payload = match step {
                    Step::Cancelled => {
                        terminal.fire(StreamOutcome::Cancelled);
                        return;
                    }
                    Step::TimedOut => {
                        tracing::warn!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, "no fragment before first-token deadline");
                        terminal.fire(StreamOutcome::NoData);
                        yield Ok(StreamSignal::NoData);
                        return;
                    }
                    Step::Frame(None) => {
                        terminal.fire(StreamOutcome::Ended);
                        return;
                    }
                    Step::Frame(Some(Err(e))) => {
                        terminal.fire(StreamOutcome::Failed(e.to_string()));
                        yield Err(e);
                        return;
                    }
                    Step::Frame(Some(Ok(Frame::Unreadable { raw, error }))) => {
                        tracing::warn!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, err=%error, "skipping unreadable frame");
                        interceptors.decode_error(&ctx, &raw, &error);
                        continue;
                    }
                    Step::Frame(Some(Ok(Frame::Payload(payload)))) => payload,
                };

                interceptors.frame(&ctx, payload.as_bytes());
                if is_done_marker(payload.as_bytes()) {
                    terminal.fire(StreamOutcome::Ended);
                    return;
                }

                let fragment = match decode_fragment(payload.as_bytes()) {
                    Ok(fragment) => fragment,
                    Err(e) => {
                        tracing::warn!(target: "inference_stream::http", correlation_id=%ctx.correlation_id, err=%e, "could not decode frame as response fragment");
                        tracing::debug!(target: "inference_stream::http", raw=%payload, "raw frame");
                        interceptors.decode_error(&ctx, payload.as_bytes(), &e);
                        continue;
                    }
                };

                first_seen = true;
                let signal = StreamSignal::from_fragment(&fragment);
                if let StreamSignal::Final { finish_reason, .. } = &signal {
                    terminal.fire(StreamOutcome::Finished {
                        reason: finish_reason.clone(),
                    });
                    yield Ok(signal);
                    return;
                }
                yield Ok(signal);
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(HttpStreamConfig::new("https://worker.example/stream").validate().is_ok());
        assert!(HttpStreamConfig::new("").validate().is_err());
        assert!(HttpStreamConfig::new("ftp://worker").validate().is_err());
        assert!(
            HttpStreamConfig::new("http://worker")
                .with_first_token_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn api_key_is_not_printed() {
        let cfg = HttpStreamConfig::new("http://worker").with_api_key("sk-secret");
        assert!(!format!("{cfg:?}").contains("sk-secret"));
    }
}
