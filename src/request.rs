//! Request construction
//!
//! Wraps an encoded prompt into the canonical request envelope. No network I/O
//! happens here; the only failure is an unmapped model name.

use crate::error::Result;
use crate::model::ModelMap;
use crate::tokenizer::EncodedPrompt;
use crate::types::{InferenceRequest, Message, ModelParams, SessionId};
use std::sync::Arc;
use uuid::Uuid;

/// Builds [`InferenceRequest`]s against a shared model mapping.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    models: Arc<ModelMap>,
    session: SessionId,
    default_params: ModelParams,
}

impl RequestBuilder {
    pub fn new(models: Arc<ModelMap>) -> Self {
        Self {
            models,
            session: SessionId::default(),
            default_params: ModelParams::new(),
        }
    }

    /// Override the session flags sent with every request.
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    /// Parameters merged under any per-call parameters.
    pub fn with_default_params(mut self, params: ModelParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn models(&self) -> &ModelMap {
        &self.models
    }

    /// Build a streaming request for `model`.
    ///
    /// Per-call `params` win over defaults on key collisions. Every call gets a
    /// fresh v4 correlation id.
    pub fn build(
        &self,
        prompt: EncodedPrompt,
        model: &str,
        params: Option<ModelParams>,
    ) -> Result<InferenceRequest> {
        let transport_model = self.models.resolve(model)?.to_string();

        let mut model_params = self.default_params.clone();
        if let Some(params) = params {
            model_params.extend(params);
        }

        let messages = match prompt {
            EncodedPrompt::Messages(messages) => messages,
            EncodedPrompt::TokenIds(ids) => vec![Message::assistant(render_token_ids(&ids))],
        };

        Ok(InferenceRequest::new(
            Uuid::new_v4(),
            transport_model,
            messages,
            self.session,
            model_params,
        ))
    }
}

/// Render token ids as a bracketed, comma-separated list: `[1, 2, 3]`.
fn render_token_ids(ids: &[u32]) -> String {
    let joined = ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}
