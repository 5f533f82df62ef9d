//! Blocking token iterator over an async transport
//!
//! Each call gets a dedicated worker thread that owns a fresh current-thread
//! tokio runtime. The worker drives the transport's fragment stream, turns every
//! delta into display text through the [`Tokenizer`], and hands it over a bounded
//! queue. [`TokenStream`] blocks on that queue.
//!
//! Stopping early (dropping the iterator or calling [`TokenStream::cancel`])
//! cancels the transport, closes the queue and joins the worker, so the
//! connection and any broker consumer are released before control returns.
//!
//! Like `reqwest::blocking`, a `TokenStream` must not be iterated from inside an
//! async runtime.

use crate::error::{InferenceError, Result};
use crate::tokenizer::Tokenizer;
use crate::transport::{StreamOutcome, StreamSignal, Transport};
use crate::types::InferenceRequest;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default capacity of the worker-to-caller queue.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 32;

type SharedOutcome = Arc<Mutex<Option<StreamOutcome>>>;

/// Finite, single-pass sequence of display-text tokens.
pub struct TokenStream {
    correlation_id: Uuid,
    rx: mpsc::Receiver<Result<String>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    outcome: SharedOutcome,
}

impl TokenStream {
    /// Start streaming `request` over `transport` on a dedicated worker.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        tokenizer: Arc<dyn Tokenizer>,
        request: InferenceRequest,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(InferenceError::ConfigurationError(
                "Handoff capacity must be positive".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| InferenceError::RuntimeError(format!("Failed to build runtime: {e}")))?;

        let correlation_id = request.correlation_id();
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let outcome: SharedOutcome = Arc::new(Mutex::new(None));

        let pump = Pump {
            transport,
            tokenizer,
            tx,
            cancel: cancel.clone(),
            outcome: outcome.clone(),
        };
        let worker = std::thread::Builder::new()
            .name(format!("inference-{correlation_id}"))
            .spawn(move || runtime.block_on(pump.run(request)))
            .map_err(|e| InferenceError::RuntimeError(format!("Failed to spawn worker: {e}")))?;

        tracing::debug!(target: "inference_stream::bridge", %correlation_id, capacity, "worker started");
        Ok(Self {
            correlation_id,
            rx,
            cancel,
            worker: Some(worker),
            outcome,
        })
    }

    pub const fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// How the stream ended, once it has.
    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the stream and wait for the transport to release its resources.
    pub fn cancel(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.cancel.cancel();
        self.rx.close();
        if worker.join().is_err() {
            tracing::error!(target: "inference_stream::bridge", correlation_id=%self.correlation_id, "worker panicked");
            record(&self.outcome, StreamOutcome::Failed("worker panicked".to_string()));
        }
        // Anything still queued belongs to a stream the caller abandoned.
        while self.rx.try_recv().is_ok() {}
        record(&self.outcome, StreamOutcome::Cancelled);
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(target: "inference_stream::bridge", correlation_id=%self.correlation_id, "worker panicked");
                record(&self.outcome, StreamOutcome::Failed("worker panicked".to_string()));
            }
        }
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.blocking_recv() {
            Some(item) => Some(item),
            None => {
                self.join();
                None
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("correlation_id", &self.correlation_id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Records the first outcome only.
fn record(slot: &SharedOutcome, outcome: StreamOutcome) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(outcome);
    }
}

struct Pump {
    transport: Arc<dyn Transport>,
    tokenizer: Arc<dyn Tokenizer>,
    tx: mpsc::Sender<Result<String>>,
    cancel: CancellationToken,
    outcome: SharedOutcome,
}

impl Pump {
    async fn run(self, request: InferenceRequest) {
        let correlation_id = request.correlation_id();
        let mut stream = match self.transport.open(request, self.cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                record(&self.outcome, StreamOutcome::Failed(e.to_string()));
                let _ = self.tx.send(Err(e)).await;
                return;
            }
        };

        let mut outcome = StreamOutcome::Ended;
        // Keep polling after the caller leaves so transport teardown runs.
        while let Some(item) = stream.next().await {
            let delta = match item {
                Ok(StreamSignal::Delta(content)) => content,
                Ok(StreamSignal::Final {
                    content,
                    finish_reason,
                }) => {
                    outcome = StreamOutcome::Finished {
                        reason: finish_reason,
                    };
                    content
                }
                Ok(StreamSignal::NoData) => {
                    outcome = StreamOutcome::NoData;
                    continue;
                }
                Err(e) => {
                    outcome = StreamOutcome::Failed(e.to_string());
                    self.forward(Err(e)).await;
                    continue;
                }
            };

            if delta.is_empty() {
                continue;
            }
            match self.tokenizer.decode(&delta) {
                Ok(text) => self.forward(Ok(text)).await,
                Err(e) => {
                    tracing::warn!(target: "inference_stream::bridge", %correlation_id, err=%e, "tokenizer failed to decode delta");
                    outcome = StreamOutcome::Failed(e.to_string());
                    self.forward(Err(e)).await;
                    self.cancel.cancel();
                }
            }
        }

        if self.cancel.is_cancelled() && outcome == StreamOutcome::Ended {
            outcome = StreamOutcome::Cancelled;
        }
        tracing::debug!(target: "inference_stream::bridge", %correlation_id, outcome=?outcome, "worker finished");
        record(&self.outcome, outcome);
    }

    async fn forward(&self, item: Result<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.tx.send(item).await.is_err() {
            // Receiver closed: the caller stopped early.
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::TransportKind;
    use crate::model::{LLAMA_3_2_1B_ENCRYPTED, ModelMap};
    use crate::request::RequestBuilder;
    use crate::tokenizer::{EncodedPrompt, PassthroughTokenizer};
    use crate::transport::FragmentStream;
    use crate::types::Message;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Scripted {
        signals: Vec<Result<StreamSignal>>,
        released: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Transport for Scripted {
        fn kind(&self) -> TransportKind {
            TransportKind::Http
        }

        async fn open(
            &self,
            _request: InferenceRequest,
            cancel: CancellationToken,
        ) -> Result<FragmentStream> {
            let signals = self.signals.clone();
            let released = self.released.clone();
            Ok(Box::pin(async_stream::stream! {
                for signal in signals {
                    if cancel.is_cancelled() {
                        break;
                    }
                    yield signal;
                }
                cancel.cancelled().await;
                released.store(true, Ordering::SeqCst);
            }))
        }
    }

    fn request() -> InferenceRequest {
        RequestBuilder::new(Arc::new(ModelMap::with_defaults()))
            .build(
                EncodedPrompt::Messages(vec![Message::user("hi")]),
                LLAMA_3_2_1B_ENCRYPTED,
                None,
            )
            .unwrap()
    }

    fn spawn(signals: Vec<Result<StreamSignal>>) -> (TokenStream, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(Scripted {
            signals,
            released: released.clone(),
        });
        let stream =
            TokenStream::spawn(transport, Arc::new(PassthroughTokenizer), request(), 4).unwrap();
        (stream, released)
    }

    #[test]
    fn early_drop_cancels_and_joins() {
        let (mut stream, released) = spawn(vec![
            Ok(StreamSignal::Delta("a".into())),
            Ok(StreamSignal::Delta("b".into())),
        ]);
        assert_eq!(stream.next().unwrap().unwrap(), "a");
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn explicit_cancel_reports_cancelled() {
        let (mut stream, released) = spawn(vec![Ok(StreamSignal::Delta("a".into()))]);
        stream.cancel();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(stream.outcome(), Some(StreamOutcome::Cancelled));
        assert!(stream.next().is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = TokenStream::spawn(
            Arc::new(Scripted {
                signals: vec![],
                released: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(PassthroughTokenizer),
            request(),
            0,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }
}
