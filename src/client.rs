//! Streaming inference client
//!
//! The synchronous entry point: assemble the prompt, encode it, build the
//! request, then hand it to the configured transport through the sync bridge.
//!
//! ```rust,ignore
//! let client = InferenceClient::from_settings(&Settings::from_env()?)?;
//! for token in client.stream_inference("hello", LLAMA_3_2_1B_ENCRYPTED, &history, Some("You are helpful"))? {
//!     print!("{}", token?);
//! }
//! ```

use crate::bridge::{DEFAULT_HANDOFF_CAPACITY, TokenStream};
use crate::config::Settings;
use crate::error::{InferenceError, Result};
use crate::interceptor::StreamInterceptor;
use crate::model::ModelMap;
use crate::prompt::{HistoryTurn, PromptOptions, assemble_prompt};
use crate::request::RequestBuilder;
use crate::tokenizer::{PassthroughTokenizer, Tokenizer};
use crate::transport::{BrokerTransport, HttpStreamTransport, Transport, TransportConfig};
use crate::types::{ModelParams, SessionId};
use std::sync::Arc;

/// Client bound to one transport, one tokenizer and one model mapping.
#[derive(Clone)]
pub struct InferenceClient {
    transport: Arc<dyn Transport>,
    tokenizer: Arc<dyn Tokenizer>,
    requests: RequestBuilder,
    prompt: PromptOptions,
    handoff_capacity: usize,
}

impl InferenceClient {
    pub fn builder() -> InferenceClientBuilder {
        InferenceClientBuilder::default()
    }

    /// Build a client from validated settings with the passthrough tokenizer.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::builder().settings(settings)?.build()
    }

    /// Stream display-text tokens for one user turn.
    ///
    /// Configuration errors (an unknown model) are returned before anything is
    /// sent. Transport failures arrive as `Err` items on the stream. A stalled
    /// first token ends the stream with no items; check
    /// [`TokenStream::outcome`] to tell it apart from an empty reply.
    pub fn stream_inference(
        &self,
        current_message: &str,
        model_name: &str,
        history: &[HistoryTurn],
        system_prompt: Option<&str>,
    ) -> Result<TokenStream> {
        self.stream_inference_with_params(current_message, model_name, history, system_prompt, None)
    }

    /// [`stream_inference`](Self::stream_inference) with per-call generation
    /// parameters.
    pub fn stream_inference_with_params(
        &self,
        current_message: &str,
        model_name: &str,
        history: &[HistoryTurn],
        system_prompt: Option<&str>,
        params: Option<ModelParams>,
    ) -> Result<TokenStream> {
        let messages = assemble_prompt(current_message, system_prompt, history, self.prompt);
        let prompt = self.tokenizer.encode(&messages)?;
        let request = self.requests.build(prompt, model_name, params)?;

        tracing::debug!(
            target: "inference_stream::client",
            transport=%self.transport.kind(),
            correlation_id=%request.correlation_id(),
            model=%request.model(),
            "starting stream"
        );
        TokenStream::spawn(
            self.transport.clone(),
            self.tokenizer.clone(),
            request,
            self.handoff_capacity,
        )
    }

    pub fn models(&self) -> &ModelMap {
        self.requests.models()
    }

    pub fn prompt_options(&self) -> PromptOptions {
        self.prompt
    }
}

impl std::fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceClient")
            .field("transport", &self.transport.kind())
            .field("prompt", &self.prompt)
            .field("handoff_capacity", &self.handoff_capacity)
            .finish()
    }
}

/// Builder for [`InferenceClient`].
#[derive(Default)]
pub struct InferenceClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    transport_config: Option<TransportConfig>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    models: Option<ModelMap>,
    prompt: PromptOptions,
    session: SessionId,
    default_params: ModelParams,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
    handoff_capacity: Option<usize>,
}

impl InferenceClientBuilder {
    /// Use a ready-made transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the transport from configuration at [`build`](Self::build) time.
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    /// Take transport, model mapping, prompt and queue settings from `settings`.
    pub fn settings(mut self, settings: &Settings) -> Result<Self> {
        settings.validate()?;
        self.transport_config = Some(settings.transport_config()?);
        self.models = Some(settings.model_map());
        self.prompt = settings.prompt;
        self.handoff_capacity = Some(settings.handoff_capacity);
        Ok(self)
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn models(mut self, models: ModelMap) -> Self {
        self.models = Some(models);
        self
    }

    pub fn prompt_options(mut self, options: PromptOptions) -> Self {
        self.prompt = options;
        self
    }

    pub fn session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    pub fn default_params(mut self, params: ModelParams) -> Self {
        self.default_params = params;
        self
    }

    /// Interceptor attached to a transport built from configuration.
    pub fn interceptor(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn handoff_capacity(mut self, capacity: usize) -> Self {
        self.handoff_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<InferenceClient> {
        let transport: Arc<dyn Transport> = match (self.transport, self.transport_config) {
            (Some(transport), _) => transport,
            (None, Some(TransportConfig::Http(config))) => Arc::new(
                HttpStreamTransport::from_config(config)?.with_interceptors(self.interceptors),
            ),
            (None, Some(TransportConfig::Broker(config))) => Arc::new(
                BrokerTransport::from_config(config)?.with_interceptors(self.interceptors),
            ),
            (None, None) => {
                return Err(InferenceError::ConfigurationError(
                    "A transport or transport configuration is required".to_string(),
                ));
            }
        };

        let handoff_capacity = self.handoff_capacity.unwrap_or(DEFAULT_HANDOFF_CAPACITY);
        if handoff_capacity == 0 {
            return Err(InferenceError::ConfigurationError(
                "Handoff capacity must be positive".to_string(),
            ));
        }

        let models = Arc::new(self.models.unwrap_or_else(ModelMap::with_defaults));
        let requests = RequestBuilder::new(models)
            .with_session(self.session)
            .with_default_params(self.default_params);

        Ok(InferenceClient {
            transport,
            tokenizer: self
                .tokenizer
                .unwrap_or_else(|| Arc::new(PassthroughTokenizer)),
            requests,
            prompt: self.prompt,
            handoff_capacity,
        })
    }
}
