//! Tokenizer boundary
//!
//! Tokenization lives outside this crate. The client only needs two calls:
//! turning assembled messages into a model-ready prompt, and turning a streamed
//! delta back into display text.

use crate::error::Result;
use crate::types::Message;

/// Model-ready form of an assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedPrompt {
    /// Role-tagged messages forwarded verbatim.
    Messages(Vec<Message>),
    /// Token ids produced by a chat template.
    TokenIds(Vec<u32>),
}

/// External tokenizer service.
pub trait Tokenizer: Send + Sync {
    /// Encode assembled messages into a model-ready prompt.
    fn encode(&self, messages: &[Message]) -> Result<EncodedPrompt>;

    /// Convert one streamed delta into display text.
    fn decode(&self, delta: &str) -> Result<String>;
}

/// Tokenizer for backends that apply their own chat template.
///
/// Forwards messages untouched and displays deltas as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTokenizer;

impl Tokenizer for PassthroughTokenizer {
    fn encode(&self, messages: &[Message]) -> Result<EncodedPrompt> {
        Ok(EncodedPrompt::Messages(messages.to_vec()))
    }

    fn decode(&self, delta: &str) -> Result<String> {
        Ok(delta.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_messages_and_text() {
        let msgs = vec![Message::system("s"), Message::user("u")];
        assert_eq!(
            PassthroughTokenizer.encode(&msgs).unwrap(),
            EncodedPrompt::Messages(msgs)
        );
        assert_eq!(PassthroughTokenizer.decode("tok").unwrap(), "tok");
    }
}
