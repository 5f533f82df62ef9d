//! In-memory broker with JetStream-like pull consumer semantics
//!
//! Publishing a request runs a scripted worker that appends result messages
//! under the matching result subject. Consumers honour `ack_wait` and
//! `max_deliver`: an unacknowledged message becomes eligible again once its
//! ack-wait expires and is dropped after `max_deliver` deliveries.

use async_trait::async_trait;
use bytes::Bytes;
use inference_stream::transport::broker::{
    Acknowledger, BrokerConnector, BrokerSession, ConsumerSpec, Delivery, PullConsumer,
};
use inference_stream::{InferenceError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A scripted result message: visible `after` the request is published.
#[derive(Clone, Debug)]
pub struct Scripted {
    pub after: Duration,
    pub payload: Bytes,
}

impl Scripted {
    pub fn now(payload: impl Into<String>) -> Self {
        Self::after(Duration::ZERO, payload)
    }

    pub fn after(after: Duration, payload: impl Into<String>) -> Self {
        Self {
            after,
            payload: Bytes::from(payload.into()),
        }
    }
}

type Worker = dyn Fn(&serde_json::Value) -> Vec<Scripted> + Send + Sync;

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
    visible_at: Instant,
    deliveries: u64,
    last_delivery: Option<Instant>,
    acked: bool,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub stream: String,
    pub subject: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct State {
    published: Vec<Published>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, (ConsumerSpec, bool)>,
    sessions_opened: usize,
    sessions_closed: usize,
    acks: usize,
    fail_publish: bool,
    fail_pull: bool,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    worker: Arc<Worker>,
}

impl MemoryBroker {
    pub fn new<F>(worker: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Vec<Scripted> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            worker: Arc::new(worker),
        }
    }

    /// Worker replying with the same messages to every request.
    pub fn replying(messages: Vec<Scripted>) -> Self {
        Self::new(move |_| messages.clone())
    }

    pub fn fail_publish(self) -> Self {
        self.state.lock().unwrap().fail_publish = true;
        self
    }

    pub fn fail_pull(self) -> Self {
        self.state.lock().unwrap().fail_pull = true;
        self
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn consumer_specs(&self) -> Vec<ConsumerSpec> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .values()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// Consumers created and not yet deleted.
    pub fn live_consumers(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .consumers
            .values()
            .filter(|(_, deleted)| !deleted)
            .count()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().unwrap().sessions_closed
    }

    pub fn acks(&self) -> usize {
        self.state.lock().unwrap().acks
    }

    /// Delivery count of the `index`-th result message.
    pub fn deliveries(&self, index: usize) -> u64 {
        self.state.lock().unwrap().messages[index].deliveries
    }

    pub fn acked(&self, index: usize) -> bool {
        self.state.lock().unwrap().messages[index].acked
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        self.state.lock().unwrap().sessions_opened += 1;
        Ok(Box::new(MemorySession {
            broker: self.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    closed: bool,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, stream: &str, subject: String, payload: Bytes) -> Result<()> {
        let request: serde_json::Value = serde_json::from_slice(&payload)?;
        let mut state = self.broker.state.lock().unwrap();
        if state.fail_publish {
            return Err(InferenceError::BrokerError("publish: no responders".to_string()));
        }

        let result_subject = subject.replacen(".private.base.request.", ".private.base.result.", 1);
        let now = Instant::now();
        for scripted in (self.broker.worker)(&request) {
            state.messages.push(StoredMessage {
                subject: result_subject.clone(),
                payload: scripted.payload,
                visible_at: now + scripted.after,
                deliveries: 0,
                last_delivery: None,
                acked: false,
            });
        }
        state.published.push(Published {
            stream: stream.to_string(),
            subject,
            payload: request,
        });
        Ok(())
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn PullConsumer>> {
        self.broker
            .state
            .lock()
            .unwrap()
            .consumers
            .insert(spec.name.clone(), (spec.clone(), false));
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            spec: spec.clone(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        assert!(!self.closed, "session closed twice");
        self.closed = true;
        self.broker.state.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    spec: ConsumerSpec,
}

impl MemoryConsumer {
    fn take_eligible(&self, batch: usize) -> Result<Vec<Delivery>> {
        let mut state = self.broker.state.lock().unwrap();
        if state.fail_pull {
            return Err(InferenceError::BrokerError("fetch: connection reset".to_string()));
        }
        let settings = self.spec.settings;
        let now = Instant::now();
        let mut out = Vec::new();
        for (index, message) in state.messages.iter_mut().enumerate() {
            if out.len() == batch {
                break;
            }
            let eligible = message.subject == self.spec.filter_subject
                && !message.acked
                && message.visible_at <= now
                && (message.deliveries as i64) < settings.max_deliver
                && message
                    .last_delivery
                    .is_none_or(|at| now.duration_since(at) >= settings.ack_wait);
            if !eligible {
                continue;
            }
            message.deliveries += 1;
            message.last_delivery = Some(now);
            out.push(Delivery::new(
                message.payload.clone(),
                message.deliveries,
                Box::new(MemoryAck {
                    broker: self.broker.clone(),
                    index,
                }),
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    async fn pull(&mut self, batch: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let deliveries = self.take_eligible(batch)?;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn delete(&mut self) -> Result<()> {
        let mut state = self.broker.state.lock().unwrap();
        let entry = state
            .consumers
            .get_mut(&self.spec.name)
            .expect("consumer exists");
        assert!(!entry.1, "consumer deleted twice");
        entry.1 = true;
        Ok(())
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    index: usize,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut state = self.broker.state.lock().unwrap();
        state.messages[self.index].acked = true;
        state.acks += 1;
        Ok(())
    }
}
