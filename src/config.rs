//! Client settings
//!
//! Loaded once at startup (JSON file, JSON string, or `INFERENCE_*` environment
//! variables), validated, then turned into a [`TransportConfig`] and a
//! [`ModelMap`] that are injected into the client. Nothing here is global.
//!
//! ```json
//! {
//!   "transport": "broker",
//!   "broker": { "servers": ["nats://localhost:4222"], "agent_id": "7" },
//!   "model_mappings": { "my-model": "org/my-model-he" }
//! }
//! ```

use crate::bridge::DEFAULT_HANDOFF_CAPACITY;
use crate::error::{InferenceError, Result};
use crate::interceptor::TransportKind;
use crate::model::ModelMap;
use crate::prompt::PromptOptions;
use crate::transport::broker::{DEFAULT_REQUEST_STREAM, DEFAULT_RESULT_STREAM};
use crate::transport::{
    BrokerConfig, ConsumerSettings, FrameFormat, HttpStreamConfig, TransportConfig,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by [`Settings::from_env`].
pub const ENV_PREFIX: &str = "INFERENCE_";

/// Top-level client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Which transport carries requests.
    pub transport: TransportKind,
    /// HTTP endpoint, required for the HTTP transport.
    pub stream_url: Option<String>,
    pub frame_format: FrameFormat,
    pub first_token_timeout_secs: u64,
    /// Optional bearer credential for the HTTP transport.
    pub api_key: Option<SecretString>,
    pub broker: BrokerSettings,
    /// Extra logical -> transport model names, layered over the built-ins.
    pub model_mappings: HashMap<String, String>,
    pub prompt: PromptOptions,
    pub handoff_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            stream_url: None,
            frame_format: FrameFormat::default(),
            first_token_timeout_secs: 60,
            api_key: None,
            broker: BrokerSettings::default(),
            model_mappings: HashMap::new(),
            prompt: PromptOptions::default(),
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
        }
    }
}

/// Broker connection and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub servers: Vec<String>,
    pub credentials_path: Option<PathBuf>,
    pub agent_id: String,
    pub request_stream: String,
    pub result_stream: String,
    pub max_ack_pending: i64,
    pub ack_wait_secs: u64,
    pub max_deliver: i64,
    pub inactive_threshold_secs: u64,
    pub pull_wait_millis: u64,
    pub pull_batch: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let consumer = ConsumerSettings::default();
        Self {
            servers: Vec::new(),
            credentials_path: None,
            agent_id: "1".to_string(),
            request_stream: DEFAULT_REQUEST_STREAM.to_string(),
            result_stream: DEFAULT_RESULT_STREAM.to_string(),
            max_ack_pending: consumer.max_ack_pending,
            ack_wait_secs: consumer.ack_wait.as_secs(),
            max_deliver: consumer.max_deliver,
            inactive_threshold_secs: consumer.inactive_threshold.as_secs(),
            pull_wait_millis: consumer.pull_wait.as_millis() as u64,
            pull_batch: consumer.pull_batch,
        }
    }
}

impl BrokerSettings {
    pub fn consumer(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_ack_pending: self.max_ack_pending,
            ack_wait: Duration::from_secs(self.ack_wait_secs),
            max_deliver: self.max_deliver,
            inactive_threshold: Duration::from_secs(self.inactive_threshold_secs),
            pull_wait: Duration::from_millis(self.pull_wait_millis),
            pull_batch: self.pull_batch,
        }
    }

    pub fn to_config(&self) -> BrokerConfig {
        let config = BrokerConfig::new(self.servers.clone(), self.agent_id.clone())
            .with_streams(self.request_stream.clone(), self.result_stream.clone())
            .with_consumer(self.consumer());
        match &self.credentials_path {
            Some(path) => config.with_credentials_path(path.clone()),
            None => config,
        }
    }
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| InferenceError::ConfigurationError(format!("Invalid settings: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::ConfigurationError(format!(
                "Failed to read settings from {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Read settings from `INFERENCE_*` environment variables over the
    /// defaults. `INFERENCE_BROKER_SERVERS` is comma-separated and
    /// `INFERENCE_MODEL_MAPPINGS` is `logical=transport` pairs separated by
    /// commas.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };
        let mut settings = Self::default();

        if let Some(v) = var("TRANSPORT") {
            settings.transport = match v.trim().to_ascii_lowercase().as_str() {
                "http" => TransportKind::Http,
                "broker" => TransportKind::Broker,
                other => {
                    return Err(InferenceError::ConfigurationError(format!(
                        "Unknown transport: {other}"
                    )));
                }
            };
        }
        if let Some(v) = var("STREAM_URL") {
            settings.stream_url = Some(v);
        }
        if let Some(v) = var("FRAME_FORMAT") {
            settings.frame_format = v.parse()?;
        }
        if let Some(v) = var("FIRST_TOKEN_TIMEOUT_SECS") {
            settings.first_token_timeout_secs = parse_var("FIRST_TOKEN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("API_KEY") {
            settings.api_key = Some(SecretString::from(v));
        }
        if let Some(v) = var("HANDOFF_CAPACITY") {
            settings.handoff_capacity = parse_var("HANDOFF_CAPACITY", &v)?;
        }
        if let Some(v) = var("PROMPT_LOOKBACK") {
            settings.prompt.lookback = parse_var("PROMPT_LOOKBACK", &v)?;
        }
        if let Some(v) = var("PROMPT_USE_MEMORY") {
            settings.prompt.use_memory = parse_var("PROMPT_USE_MEMORY", &v)?;
        }
        if let Some(v) = var("MODEL_MAPPINGS") {
            for pair in v.split(',').filter(|p| !p.trim().is_empty()) {
                let (logical, transport) = pair.split_once('=').ok_or_else(|| {
                    InferenceError::ConfigurationError(format!(
                        "Invalid model mapping '{pair}', expected logical=transport"
                    ))
                })?;
                settings
                    .model_mappings
                    .insert(logical.trim().to_string(), transport.trim().to_string());
            }
        }

        let broker = &mut settings.broker;
        if let Some(v) = var("BROKER_SERVERS") {
            broker.servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("BROKER_CREDENTIALS_PATH") {
            broker.credentials_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("BROKER_AGENT_ID") {
            broker.agent_id = v;
        }
        if let Some(v) = var("BROKER_REQUEST_STREAM") {
            broker.request_stream = v;
        }
        if let Some(v) = var("BROKER_RESULT_STREAM") {
            broker.result_stream = v;
        }
        if let Some(v) = var("BROKER_MAX_ACK_PENDING") {
            broker.max_ack_pending = parse_var("BROKER_MAX_ACK_PENDING", &v)?;
        }
        if let Some(v) = var("BROKER_ACK_WAIT_SECS") {
            broker.ack_wait_secs = parse_var("BROKER_ACK_WAIT_SECS", &v)?;
        }
        if let Some(v) = var("BROKER_MAX_DELIVER") {
            broker.max_deliver = parse_var("BROKER_MAX_DELIVER", &v)?;
        }
        if let Some(v) = var("BROKER_INACTIVE_THRESHOLD_SECS") {
            broker.inactive_threshold_secs = parse_var("BROKER_INACTIVE_THRESHOLD_SECS", &v)?;
        }
        if let Some(v) = var("BROKER_PULL_WAIT_MILLIS") {
            broker.pull_wait_millis = parse_var("BROKER_PULL_WAIT_MILLIS", &v)?;
        }
        if let Some(v) = var("BROKER_PULL_BATCH") {
            broker.pull_batch = parse_var("BROKER_PULL_BATCH", &v)?;
        }

        Ok(settings)
    }

    /// Validate the settings for the selected transport.
    pub fn validate(&self) -> Result<()> {
        if self.handoff_capacity == 0 {
            return Err(InferenceError::ConfigurationError(
                "Handoff capacity must be positive".to_string(),
            ));
        }
        if let Some(key) = &self.api_key {
            if key.expose_secret().trim().is_empty() {
                return Err(InferenceError::ConfigurationError(
                    "API key cannot be blank".to_string(),
                ));
            }
        }
        match self.transport_config()? {
            TransportConfig::Http(config) => config.validate(),
            TransportConfig::Broker(config) => config.validate(),
        }
    }

    /// The transport configuration selected by `transport`.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        match self.transport {
            TransportKind::Http => {
                let url = self.stream_url.clone().ok_or_else(|| {
                    InferenceError::ConfigurationError(
                        "stream_url is required for the http transport".to_string(),
                    )
                })?;
                let mut config = HttpStreamConfig::new(url)
                    .with_frame_format(self.frame_format)
                    .with_first_token_timeout(Duration::from_secs(self.first_token_timeout_secs));
                config.api_key = self.api_key.clone();
                Ok(TransportConfig::Http(config))
            }
            TransportKind::Broker => Ok(TransportConfig::Broker(self.broker.to_config())),
        }
    }

    /// Built-in mappings overlaid with `model_mappings`.
    pub fn model_map(&self) -> ModelMap {
        self.model_mappings
            .iter()
            .fold(ModelMap::with_defaults(), |map, (logical, transport)| {
                map.with_model(logical.clone(), transport.clone())
            })
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        InferenceError::ConfigurationError(format!("Invalid {ENV_PREFIX}{name} '{value}': {e}"))
    })
}
