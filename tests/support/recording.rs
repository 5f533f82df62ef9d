//! Interceptor that records what it sees

use inference_stream::InferenceError;
use inference_stream::interceptor::{InterceptorContext, StreamInterceptor};
use inference_stream::transport::StreamOutcome;
use inference_stream::types::InferenceRequest;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct RecordingInterceptor {
    requests: AtomicUsize,
    frames: AtomicUsize,
    decode_errors: AtomicUsize,
    skipped: Mutex<Vec<Vec<u8>>>,
    outcomes: Mutex<Vec<StreamOutcome>>,
}

impl RecordingInterceptor {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn decode_errors(&self) -> usize {
        self.decode_errors.load(Ordering::SeqCst)
    }

    /// Raw bytes of every frame reported as undecodable.
    pub fn skipped(&self) -> Vec<Vec<u8>> {
        self.skipped.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<StreamOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl StreamInterceptor for RecordingInterceptor {
    fn on_request(&self, _ctx: &InterceptorContext, _request: &InferenceRequest) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame(&self, _ctx: &InterceptorContext, _raw: &[u8]) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn on_decode_error(&self, _ctx: &InterceptorContext, raw: &[u8], _error: &InferenceError) {
        self.decode_errors.fetch_add(1, Ordering::SeqCst);
        self.skipped.lock().unwrap().push(raw.to_vec());
    }

    fn on_terminal(&self, _ctx: &InterceptorContext, outcome: &StreamOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }
}
