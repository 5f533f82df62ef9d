//! Transports
//!
//! Two independent ways of getting a request to a remote worker and its
//! fragments back:
//!
//! - [`http::HttpStreamTransport`]: one POST, server-push frames on the body.
//! - [`broker::BrokerTransport`]: publish to a work stream, pull per-request
//!   results through an ephemeral consumer.
//!
//! Both produce a [`FragmentStream`] of [`StreamSignal`]s. Exactly one transport
//! is active per request, and the stream reaches its terminal condition once.

pub mod broker;
pub mod framing;
pub mod http;
pub mod subject;

use crate::error::Result;
use crate::interceptor::{InterceptorContext, Interceptors, TransportKind};
use crate::types::{InferenceRequest, ResponseFragment};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub use broker::{BrokerConfig, BrokerTransport, ConsumerSettings};
pub use framing::FrameFormat;
pub use http::{HttpStreamConfig, HttpStreamTransport};

/// One item produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// An incremental content delta.
    Delta(String),
    /// The terminal fragment: its own delta plus the finish reason.
    Final {
        content: String,
        finish_reason: String,
    },
    /// Nothing arrived before the first-token deadline.
    NoData,
}

impl StreamSignal {
    pub(crate) fn from_fragment(fragment: &ResponseFragment) -> Self {
        let content = fragment.content().to_string();
        match fragment.finish_reason() {
            Some(reason) => Self::Final {
                content,
                finish_reason: reason.to_string(),
            },
            None => Self::Delta(content),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A fragment carried a finish reason.
    Finished { reason: String },
    /// The transport closed without a finish reason (or sent `[DONE]`).
    Ended,
    /// First-token deadline expired.
    NoData,
    /// A transport error ended the stream.
    Failed(String),
    /// The caller stopped early.
    Cancelled,
}

/// Boxed fragment stream returned by [`Transport::open`].
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamSignal>> + Send>>;

/// A way of delivering one request and streaming its fragments back.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver `request` and return its fragment stream.
    ///
    /// The stream watches `cancel`; once cancelled it releases its resources
    /// and ends. Drive it to completion after cancelling so teardown runs.
    async fn open(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;
}

/// Closed set of transport configurations, picked once at startup.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Http(HttpStreamConfig),
    Broker(BrokerConfig),
}

impl TransportConfig {
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Http(_) => TransportKind::Http,
            Self::Broker(_) => TransportKind::Broker,
        }
    }
}

/// Reports the terminal outcome to interceptors exactly once.
///
/// If the owning stream is dropped before a terminal condition, `Drop`
/// reports [`StreamOutcome::Cancelled`].
pub(crate) struct TerminalOnce {
    ctx: InterceptorContext,
    interceptors: Interceptors,
    fired: bool,
}

impl TerminalOnce {
    pub(crate) fn new(ctx: InterceptorContext, interceptors: Interceptors) -> Self {
        Self {
            ctx,
            interceptors,
            fired: false,
        }
    }

    pub(crate) fn fire(&mut self, outcome: StreamOutcome) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.interceptors.terminal(&self.ctx, &outcome);
    }
}

impl Drop for TerminalOnce {
    fn drop(&mut self) {
        self.fire(StreamOutcome::Cancelled);
    }
}
