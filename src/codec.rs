//! Response decoding
//!
//! Raw payload -> [`ResponseFragment`]. Unknown fields are ignored; a missing
//! `choices` array, an empty one, or a choice without `delta` fails the decode.
//! Callers treat decode failures as non-fatal and skip the frame.

use crate::error::{InferenceError, Result};
use crate::types::ResponseFragment;

/// Payload some servers send to close an event stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Decode one frame or message payload.
pub fn decode_fragment(raw: &[u8]) -> Result<ResponseFragment> {
    let fragment: ResponseFragment = serde_json::from_slice(raw)
        .map_err(|e| InferenceError::DecodeError(format!("invalid response fragment: {e}")))?;
    if fragment.choices.is_empty() {
        return Err(InferenceError::DecodeError(
            "response fragment has no choices".to_string(),
        ));
    }
    Ok(fragment)
}

/// Whether a payload is the end-of-stream marker.
pub fn is_done_marker(raw: &[u8]) -> bool {
    raw.trim_ascii() == DONE_MARKER.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_delta_and_finish_reason() {
        let f = decode_fragment(
            br#"{"id":"x","choices":[{"index":0,"delta":{"content":"lo","role":"assistant"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(f.content(), "lo");
        assert_eq!(f.finish_reason(), Some("stop"));
    }

    #[test]
    fn null_finish_reason_is_not_terminal() {
        let f = decode_fragment(br#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
            .unwrap();
        assert!(!f.is_terminal());
    }

    #[test]
    fn missing_required_fields_fail() {
        assert!(decode_fragment(br#"{"object":"chunk"}"#).is_err());
        assert!(decode_fragment(br#"{"choices":[{"finish_reason":"stop"}]}"#).is_err());
        assert!(decode_fragment(br#"{"choices":[]}"#).is_err());
        assert!(decode_fragment(b"not json").is_err());
    }

    #[test]
    fn delta_without_content_decodes_empty() {
        let f = decode_fragment(br#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#).unwrap();
        assert_eq!(f.content(), "");
        assert!(f.is_terminal());
    }

    #[test]
    fn recognizes_done_marker() {
        assert!(is_done_marker(b" [DONE] "));
        assert!(!is_done_marker(b"{}"));
    }
}
