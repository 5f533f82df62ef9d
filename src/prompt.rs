//! Prompt assembly
//!
//! Turns the current user text, an optional system prompt, and a bounded
//! suffix of the conversation history into an ordered list of role-tagged
//! messages. The ordering is fixed and transports forward it verbatim:
//!
//! `[system] + (user, assistant)* + [user]`

use crate::sanitize::sanitize;
use crate::types::Message;
use serde::{Deserialize, Serialize};

/// Default number of history pairs included as context.
pub const DEFAULT_LOOKBACK: usize = 3;

/// One completed exchange in the conversation history.
pub type HistoryTurn = (String, String);

/// Options controlling how much history is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOptions {
    /// Number of most recent pairs to include. `0` includes none.
    pub lookback: usize,
    /// When false, history is omitted entirely.
    pub use_memory: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            lookback: DEFAULT_LOOKBACK,
            use_memory: true,
        }
    }
}

impl PromptOptions {
    pub const fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    pub const fn with_memory(mut self, use_memory: bool) -> Self {
        self.use_memory = use_memory;
        self
    }
}

/// Assemble the message list for one user turn.
///
/// Only reads `history`; the caller keeps ownership. The system message is
/// always first; a missing system prompt sends it empty.
pub fn assemble_prompt(
    current_message: &str,
    system_prompt: Option<&str>,
    history: &[HistoryTurn],
    options: PromptOptions,
) -> Vec<Message> {
    let window: &[HistoryTurn] = if options.use_memory {
        let start = history.len().saturating_sub(options.lookback);
        &history[start..]
    } else {
        &[]
    };

    let mut messages = Vec::with_capacity(window.len() * 2 + 2);
    messages.push(Message::system(sanitize(system_prompt.unwrap_or_default())));
    for (user, assistant) in window {
        messages.push(Message::user(sanitize(user)));
        messages.push(Message::assistant(sanitize(assistant)));
    }
    messages.push(Message::user(sanitize(current_message)));
    messages
}
