//! Logical model name resolution
//!
//! A closed, read-only mapping from the names callers use to the identifiers
//! the remote workers expect. Built once at startup and shared; unknown names
//! fail fast instead of falling through to a default.

use crate::error::{InferenceError, Result};
use std::collections::HashMap;

/// Logical name of the encrypted Llama 3.2 1B deployment.
pub const LLAMA_3_2_1B_ENCRYPTED: &str = "nesaorg_Llama-3.2-1B-Instruct-Encrypted";

/// Static logical -> transport model mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMap {
    entries: HashMap<String, String>,
}

impl ModelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping with the built-in deployments.
    pub fn with_defaults() -> Self {
        Self::new().with_model(LLAMA_3_2_1B_ENCRYPTED, "meta-llama/Llama-3.2-1B-Instruct-he")
    }

    /// Add or replace a mapping.
    pub fn with_model(mut self, logical: impl Into<String>, transport: impl Into<String>) -> Self {
        self.entries.insert(logical.into(), transport.into());
        self
    }

    /// Resolve a logical model name.
    pub fn resolve(&self, logical: &str) -> Result<&str> {
        self.entries
            .get(logical)
            .map(String::as_str)
            .ok_or_else(|| InferenceError::UnknownModel {
                model: logical.to_string(),
            })
    }

    pub fn contains(&self, logical: &str) -> bool {
        self.entries.contains_key(logical)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModelMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
