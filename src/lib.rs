//! # inference-stream
//!
//! A streaming client for remote LLM workers. A chat turn is assembled into
//! role-tagged messages, wrapped into a request with a fresh correlation id,
//! and delivered over one of two transports:
//!
//! - **HTTP**: a single POST whose body is a server-push event stream (or
//!   newline-delimited JSON).
//! - **Broker**: a request published to a JetStream work stream, results pulled
//!   back through an ephemeral per-request consumer.
//!
//! Either way the caller gets a plain blocking iterator of display-text tokens.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inference_stream::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_json_str(
//!         r#"{"stream_url": "https://worker.example/v1/stream"}"#,
//!     )?;
//!     let client = InferenceClient::from_settings(&settings)?;
//!
//!     let history = vec![("hi".to_string(), "hi!".to_string())];
//!     let tokens = client.stream_inference(
//!         "hello",
//!         LLAMA_3_2_1B_ENCRYPTED,
//!         &history,
//!         Some("You are helpful"),
//!     )?;
//!     for token in tokens {
//!         print!("{}", token?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Unknown models and invalid settings fail before anything is sent. Transport
//! failures arrive on the stream. A single malformed frame is skipped. A stalled
//! first token ends the stream without items and reports
//! [`StreamOutcome::NoData`](transport::StreamOutcome::NoData).

#![deny(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod model;
pub mod prompt;
pub mod request;
pub mod sanitize;
pub mod tokenizer;
pub mod transport;
pub mod types;

pub use bridge::TokenStream;
pub use client::{InferenceClient, InferenceClientBuilder};
pub use config::Settings;
pub use error::{ErrorCategory, InferenceError, Result};

/// Commonly used items.
pub mod prelude {
    pub use crate::bridge::TokenStream;
    pub use crate::client::{InferenceClient, InferenceClientBuilder};
    pub use crate::config::Settings;
    pub use crate::error::InferenceError;
    pub use crate::interceptor::{LoggingInterceptor, StreamInterceptor};
    pub use crate::model::{LLAMA_3_2_1B_ENCRYPTED, ModelMap};
    pub use crate::prompt::{HistoryTurn, PromptOptions};
    pub use crate::tokenizer::{EncodedPrompt, PassthroughTokenizer, Tokenizer};
    pub use crate::transport::{StreamOutcome, TransportConfig};
    pub use crate::types::Message;
}
