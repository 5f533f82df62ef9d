//! Broker pub/sub transport
//!
//! Delivers a request through a durable work stream and pulls the results
//! back through an ephemeral, per-request consumer:
//!
//! 1. connect (the connection is released on every exit path)
//! 2. publish the request under `...request.<model>.<correlation-id>`
//! 3. create a pull consumer filtered to `...result.<model>.<correlation-id>`
//! 4. pull, decode, yield, then ack; undecodable messages are left unacked so
//!    the broker redelivers them until `max_deliver`
//! 5. delete the consumer and close the connection
//!
//! The protocol sits behind [`BrokerConnector`], [`BrokerSession`] and
//! [`PullConsumer`]; [`NatsConnector`] implements them on JetStream.

use super::subject::{request_subject, result_subject};
use super::{FragmentStream, StreamOutcome, StreamSignal, TerminalOnce, Transport};
use crate::codec::decode_fragment;
use crate::error::{InferenceError, Result};
use crate::interceptor::{InterceptorContext, Interceptors, StreamInterceptor, TransportKind};
use crate::types::InferenceRequest;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default stream holding published requests.
pub const DEFAULT_REQUEST_STREAM: &str = "inference-requests";
/// Default stream holding worker results.
pub const DEFAULT_RESULT_STREAM: &str = "inference-results";

/// Tuning for the per-request pull consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Outstanding unacknowledged messages allowed.
    pub max_ack_pending: i64,
    /// Redelivery deadline for an unacknowledged message.
    pub ack_wait: Duration,
    /// Delivery attempts before a message is dropped.
    pub max_deliver: i64,
    /// Idle time after which the broker removes an abandoned consumer.
    pub inactive_threshold: Duration,
    /// How long one pull waits for messages.
    pub pull_wait: Duration,
    /// Messages requested per pull.
    pub pull_batch: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_ack_pending: 10_000,
            ack_wait: Duration::from_secs(300),
            max_deliver: 3,
            inactive_threshold: Duration::from_secs(360),
            pull_wait: Duration::from_secs(1),
            pull_batch: 1,
        }
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_ack_pending <= 0 || self.max_deliver <= 0 || self.pull_batch == 0 {
            return Err(InferenceError::ConfigurationError(
                "Consumer windows must be positive".to_string(),
            ));
        }
        if self.ack_wait.is_zero() || self.inactive_threshold.is_zero() || self.pull_wait.is_zero()
        {
            return Err(InferenceError::ConfigurationError(
                "Consumer timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`BrokerTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker server URLs.
    pub servers: Vec<String>,
    /// Optional credentials file, passed to the broker client unread.
    pub credentials_path: Option<PathBuf>,
    /// Worker/agent identifier used in subjects.
    pub agent_id: String,
    /// Stream receiving requests.
    pub request_stream: String,
    /// Stream holding results.
    pub result_stream: String,
    /// Consumer tuning.
    pub consumer: ConsumerSettings,
}

impl BrokerConfig {
    pub fn new(servers: Vec<String>, agent_id: impl Into<String>) -> Self {
        Self {
            servers,
            credentials_path: None,
            agent_id: agent_id.into(),
            request_stream: DEFAULT_REQUEST_STREAM.to_string(),
            result_stream: DEFAULT_RESULT_STREAM.to_string(),
            consumer: ConsumerSettings::default(),
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_streams(mut self, request: impl Into<String>, result: impl Into<String>) -> Self {
        self.request_stream = request.into();
        self.result_stream = result.into();
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerSettings) -> Self {
        self.consumer = consumer;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() || self.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(InferenceError::ConfigurationError(
                "Broker server list cannot be empty".to_string(),
            ));
        }
        if self.agent_id.is_empty() {
            return Err(InferenceError::ConfigurationError(
                "Agent id cannot be empty".to_string(),
            ));
        }
        if self.request_stream.is_empty() || self.result_stream.is_empty() {
            return Err(InferenceError::ConfigurationError(
                "Stream names cannot be empty".to_string(),
            ));
        }
        self.consumer.validate()
    }
}

/// Acknowledgement policy of the per-request consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every message is acknowledged individually.
    Explicit,
}

/// What the broker needs to provision a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub stream_name: String,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    pub settings: ConsumerSettings,
}

/// Client-side view of a live consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub consumer_name: String,
    pub stream_name: String,
    pub filter_subject: String,
    pub delivered_count: u64,
    pub ack_policy: AckPolicy,
}

impl From<&ConsumerSpec> for ConsumerHandle {
    fn from(spec: &ConsumerSpec) -> Self {
        Self {
            consumer_name: spec.name.clone(),
            stream_name: spec.stream_name.clone(),
            filter_subject: spec.filter_subject.clone(),
            delivered_count: 0,
            ack_policy: spec.ack_policy,
        }
    }
}

/// Acknowledges one delivered message.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A message pulled from a consumer.
pub struct Delivery {
    pub payload: Bytes,
    /// Delivery attempt, starting at 1.
    pub delivered: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Bytes, delivered: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            delivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>>;
}

/// One broker connection.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish `payload` under `subject`, expecting it to land in `stream`.
    async fn publish(&self, stream: &str, subject: String, payload: Bytes) -> Result<()>;

    /// Provision a pull consumer.
    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn PullConsumer>>;

    /// Close the connection. Called at most once.
    async fn close(&mut self) -> Result<()>;
}

/// A pull-style consumer.
#[async_trait]
pub trait PullConsumer: Send {
    /// Fetch up to `batch` messages, waiting at most `wait`. An empty result is
    /// a pull timeout, not an error.
    async fn pull(&mut self, batch: usize, wait: Duration) -> Result<Vec<Delivery>>;

    /// Delete the consumer on the broker. Called at most once.
    async fn delete(&mut self) -> Result<()>;
}

/// Owns one request's consumer and connection.
///
/// [`release`](Self::release) is idempotent. If the lease is dropped without
/// being released, `Drop` schedules the release on the current tokio runtime.
pub(crate) struct ConsumerLease {
    handle: ConsumerHandle,
    consumer: Option<Box<dyn PullConsumer>>,
    session: Option<Box<dyn BrokerSession>>,
}

impl ConsumerLease {
    fn new(handle: ConsumerHandle, consumer: Box<dyn PullConsumer>, session: Box<dyn BrokerSession>) -> Self {
        Self {
            handle,
            consumer: Some(consumer),
            session: Some(session),
        }
    }

    async fn pull(&mut self, batch: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let consumer = self.consumer.as_mut().ok_or_else(|| {
            InferenceError::BrokerError("consumer already released".to_string())
        })?;
        let deliveries = consumer.pull(batch, wait).await?;
        self.handle.delivered_count += deliveries.len() as u64;
        Ok(deliveries)
    }

    async fn release(&mut self) {
        release_parts(
            &self.handle.consumer_name,
            self.consumer.take(),
            self.session.take(),
        )
        .await;
    }
}

async fn release_parts(
    name: &str,
    consumer: Option<Box<dyn PullConsumer>>,
    session: Option<Box<dyn BrokerSession>>,
) {
    if let Some(mut consumer) = consumer {
        match consumer.delete().await {
            Ok(()) => tracing::debug!(target: "inference_stream::broker", consumer=%name, "consumer deleted"),
            Err(e) => tracing::warn!(target: "inference_stream::broker", consumer=%name, err=%e, "failed to delete consumer"),
        }
    }
    if let Some(mut session) = session {
        match session.close().await {
            Ok(()) => tracing::debug!(target: "inference_stream::broker", consumer=%name, "connection closed"),
            Err(e) => tracing::warn!(target: "inference_stream::broker", consumer=%name, err=%e, "failed to close connection"),
        }
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        if self.consumer.is_none() && self.session.is_none() {
            return;
        }
        let name = self.handle.consumer_name.clone();
        let consumer = self.consumer.take();
        let session = self.session.take();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { release_parts(&name, consumer, session).await });
            }
            Err(_) => {
                tracing::warn!(target: "inference_stream::broker", consumer=%name, "consumer dropped outside a runtime; relying on inactivity threshold");
            }
        }
    }
}

/// Broker pub/sub transport.
#[derive(Clone)]
pub struct BrokerTransport {
    config: BrokerConfig,
    connector: Arc<dyn BrokerConnector>,
    interceptors: Interceptors,
}

impl BrokerTransport {
    pub fn new(config: BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            config,
            connector,
            interceptors: Interceptors::default(),
        }
    }

    /// Create a transport backed by JetStream.
    pub fn from_config(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(NatsConnector::from_config(&config));
        Ok(Self::new(config, connector))
    }

    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn StreamInterceptor>>) -> Self {
        self.interceptors = Interceptors::new(interceptors);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connect, publish and provision the consumer. Any failure closes what
    /// was already opened.
    async fn provision(&self, request: &InferenceRequest) -> Result<ConsumerLease> {
        let session = self.connector.connect().await?;
        let correlation_id = request.correlation_id();

        let subject = request_subject(&self.config.agent_id, request.model(), correlation_id);
        let payload = Bytes::from(request.to_json_bytes()?);
        if let Err(e) = session
            .publish(&self.config.request_stream, subject.clone(), payload)
            .await
        {
            release_parts(&correlation_id.to_string(), None, Some(session)).await;
            return Err(e);
        }
        tracing::debug!(target: "inference_stream::broker", %subject, %correlation_id, "request published");

        let spec = ConsumerSpec {
            name: Uuid::new_v4().to_string(),
            stream_name: self.config.result_stream.clone(),
            filter_subject: result_subject(&self.config.agent_id, request.model(), correlation_id),
            ack_policy: AckPolicy::Explicit,
            settings: self.config.consumer,
        };
        let consumer = match session.create_consumer(&spec).await {
            Ok(consumer) => consumer,
            Err(e) => {
                release_parts(&spec.name, None, Some(session)).await;
                return Err(e);
            }
        };
        tracing::debug!(target: "inference_stream::broker", consumer=%spec.name, filter=%spec.filter_subject, "consumer created");

        Ok(ConsumerLease::new(ConsumerHandle::from(&spec), consumer, session))
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broker
    }

    async fn open(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let ctx = InterceptorContext::new(TransportKind::Broker, &request);
        let interceptors = self.interceptors.clone();
        interceptors.request(&ctx, &request);
        let mut terminal = TerminalOnce::new(ctx.clone(), interceptors.clone());

        let mut lease = match self.provision(&request).await {
            Ok(lease) => lease,
            Err(e) => {
                terminal.fire(StreamOutcome::Failed(e.to_string()));
                return Err(e);
            }
        };

        let batch = self.config.consumer.pull_batch;
        let wait = self.config.consumer.pull_wait;

        let stream = async_stream::stream! {
            let mut terminal = terminal;
            loop {
                let pulled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    pulled = lease.pull(batch, wait) => Some(pulled),
                };

                let deliveries = match pulled {
                    None => {
                        lease.release().await;
                        terminal.fire(StreamOutcome::Cancelled);
                        return;
                    }
                    Some(Err(e)) => {
                        lease.release().await;
                        terminal.fire(StreamOutcome::Failed(e.to_string()));
                        yield Err(e);
                        return;
                    }
                    Some(Ok(deliveries)) => deliveries,
                };
                if deliveries.is_empty() {
                    tracing::trace!(target: "inference_stream::broker", correlation_id=%ctx.correlation_id, "pull timed out, retrying");
                    continue;
                }

                for delivery in deliveries {
                    interceptors.frame(&ctx, &delivery.payload);
                    if delivery.delivered > 1 {
                        tracing::debug!(target: "inference_stream::broker", correlation_id=%ctx.correlation_id, attempt=delivery.delivered, "redelivered message");
                    }

                    let fragment = match decode_fragment(&delivery.payload) {
                        Ok(fragment) => fragment,
                        Err(e) => {
                            tracing::warn!(target: "inference_stream::broker", correlation_id=%ctx.correlation_id, err=%e, "could not decode message; leaving it unacknowledged");
                            tracing::debug!(target: "inference_stream::broker", raw=%String::from_utf8_lossy(&delivery.payload), "raw message");
                            interceptors.decode_error(&ctx, &delivery.payload, &e);
                            continue;
                        }
                    };

                    let signal = StreamSignal::from_fragment(&fragment);
                    let finish_reason = fragment.finish_reason().map(str::to_string);
                    yield Ok(signal);

                    if let Err(e) = delivery.ack().await {
                        lease.release().await;
                        terminal.fire(StreamOutcome::Failed(e.to_string()));
                        yield Err(e);
                        return;
                    }

                    if let Some(reason) = finish_reason {
                        lease.release().await;
                        terminal.fire(StreamOutcome::Finished { reason });
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// JetStream-backed [`BrokerConnector`].
#[derive(Debug, Clone)]
pub struct NatsConnector {
    servers: Vec<String>,
    credentials_path: Option<PathBuf>,
    connection_name: String,
}

impl NatsConnector {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            credentials_path: config.credentials_path.clone(),
            connection_name: format!("inference-stream-agent-{}", config.agent_id),
        }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let mut options = async_nats::ConnectOptions::new().name(&self.connection_name);
        if let Some(path) = &self.credentials_path {
            options = options
                .credentials_file(path)
                .await
                .map_err(|e| InferenceError::broker("credentials", e))?;
        }

        let addrs = self
            .servers
            .iter()
            .map(|server| {
                server.parse::<async_nats::ServerAddr>().map_err(|e| {
                    InferenceError::ConfigurationError(format!(
                        "Invalid broker address {server}: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let client = options
            .connect(addrs)
            .await
            .map_err(|e| InferenceError::broker("connect", e))?;
        tracing::debug!(target: "inference_stream::broker", servers=?self.servers, "connected");

        let context = jetstream::new(client.clone());
        Ok(Box::new(NatsSession {
            client: Some(client),
            context: Some(context),
        }))
    }
}

struct NatsSession {
    client: Option<async_nats::Client>,
    context: Option<jetstream::Context>,
}

impl NatsSession {
    fn context(&self) -> Result<&jetstream::Context> {
        self.context
            .as_ref()
            .ok_or_else(|| InferenceError::BrokerError("connection closed".to_string()))
    }
}

#[async_trait]
impl BrokerSession for NatsSession {
    async fn publish(&self, stream: &str, subject: String, payload: Bytes) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_EXPECTED_STREAM, stream);
        let ack = self
            .context()?
            .publish_with_headers(subject, headers, payload)
            .await
            .map_err(|e| InferenceError::broker("publish", e))?;
        ack.await
            .map_err(|e| InferenceError::broker("publish ack", e))?;
        Ok(())
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn PullConsumer>> {
        let stream = self
            .context()?
            .get_stream(&spec.stream_name)
            .await
            .map_err(|e| InferenceError::broker("get stream", e))?;

        let settings = spec.settings;
        let config = jetstream::consumer::pull::Config {
            name: Some(spec.name.clone()),
            filter_subject: spec.filter_subject.clone(),
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ack_policy: match spec.ack_policy {
                AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
            },
            ack_wait: settings.ack_wait,
            max_deliver: settings.max_deliver,
            max_ack_pending: settings.max_ack_pending,
            inactive_threshold: settings.inactive_threshold,
            ..Default::default()
        };
        let consumer = stream
            .create_consumer(config)
            .await
            .map_err(|e| InferenceError::broker("create consumer", e))?;

        Ok(Box::new(NatsPullConsumer {
            name: spec.name.clone(),
            stream,
            consumer,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.context.take();
        if let Some(client) = self.client.take() {
            client
                .flush()
                .await
                .map_err(|e| InferenceError::broker("flush", e))?;
            // Dropping the last client handle closes the connection.
            drop(client);
        }
        Ok(())
    }
}

struct NatsPullConsumer {
    name: String,
    stream: jetstream::stream::Stream,
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn pull(&mut self, batch: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| InferenceError::broker("fetch", e))?;

        let mut out = Vec::with_capacity(batch);
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| InferenceError::broker("fetch", e))?;
            let delivered = message
                .info()
                .map(|info| info.delivered.max(1) as u64)
                .unwrap_or(1);
            let payload = message.payload.clone();
            out.push(Delivery::new(payload, delivered, Box::new(NatsAck(message))));
        }
        Ok(out)
    }

    async fn delete(&mut self) -> Result<()> {
        self.stream
            .delete_consumer(&self.name)
            .await
            .map_err(|e| InferenceError::broker("delete consumer", e))?;
        Ok(())
    }
}

struct NatsAck(jetstream::Message);

#[async_trait]
impl Acknowledger for NatsAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| InferenceError::broker("ack", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults_match_deployment() {
        let s = ConsumerSettings::default();
        assert_eq!(s.max_ack_pending, 10_000);
        assert_eq!(s.ack_wait, Duration::from_secs(300));
        assert_eq!(s.max_deliver, 3);
        assert_eq!(s.inactive_threshold, Duration::from_secs(360));
        assert_eq!(s.pull_batch, 1);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn config_validation() {
        let cfg = BrokerConfig::new(vec!["nats://localhost:4222".into()], "1");
        assert!(cfg.validate().is_ok());
        assert!(BrokerConfig::new(vec![], "1").validate().is_err());
        assert!(
            BrokerConfig::new(vec!["nats://localhost:4222".into()], "")
                .validate()
                .is_err()
        );
        let zero_window = ConsumerSettings {
            max_deliver: 0,
            ..ConsumerSettings::default()
        };
        assert!(cfg.with_consumer(zero_window).validate().is_err());
    }

    #[test]
    fn handle_mirrors_spec() {
        let spec = ConsumerSpec {
            name: "c1".into(),
            stream_name: DEFAULT_RESULT_STREAM.into(),
            filter_subject: "inference.agent-1.private.base.result.m.x".into(),
            ack_policy: AckPolicy::Explicit,
            settings: ConsumerSettings::default(),
        };
        let handle = ConsumerHandle::from(&spec);
        assert_eq!(handle.consumer_name, "c1");
        assert_eq!(handle.delivered_count, 0);
        assert_eq!(handle.ack_policy, AckPolicy::Explicit);
    }
}
