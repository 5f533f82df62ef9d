//! Broker subject naming
//!
//! Subjects follow
//! `inference.agent-<agent-id>.private.base.{request|result}.<model>.<qualifier>`.
//!
//! Model names routinely contain `.` (`Llama-3.2`), which is the subject token
//! delimiter, so every variable token is escaped first. Reserved bytes become
//! `%XX`; [`desanitize_token`] is the exact inverse of [`sanitize_token`].

use crate::error::{InferenceError, Result};
use std::fmt::Write;
use uuid::Uuid;

const SUBJECT_ROOT: &str = "inference";

/// Direction of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Request,
    Result,
}

impl SubjectKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Result => "result",
        }
    }
}

fn is_reserved(c: char) -> bool {
    matches!(c, '.' | '*' | '>' | '%') || c.is_whitespace() || c.is_control()
}

/// Escape a string so it is safe as a single subject token.
pub fn sanitize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut buf = [0u8; 4];
    for c in raw.chars() {
        if is_reserved(c) {
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{byte:02X}");
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`sanitize_token`].
pub fn desanitize_token(token: &str) -> Result<String> {
    urlencoding::decode(token)
        .map(|s| s.into_owned())
        .map_err(|e| InferenceError::ConfigurationError(format!("Invalid subject token: {e}")))
}

/// Build a subject for `agent_id`, `model`, and a per-request qualifier.
pub fn subject(kind: SubjectKind, agent_id: &str, model: &str, qualifier: &str) -> String {
    format!(
        "{SUBJECT_ROOT}.agent-{}.private.base.{}.{}.{}",
        sanitize_token(agent_id),
        kind.as_str(),
        sanitize_token(model),
        sanitize_token(qualifier),
    )
}

/// Subject a request is published under.
pub fn request_subject(agent_id: &str, model: &str, correlation_id: Uuid) -> String {
    subject(SubjectKind::Request, agent_id, model, &correlation_id.to_string())
}

/// Subject the worker publishes this request's results under.
pub fn result_subject(agent_id: &str, model: &str, correlation_id: Uuid) -> String {
    subject(SubjectKind::Result, agent_id, model, &correlation_id.to_string())
}
