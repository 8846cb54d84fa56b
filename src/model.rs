//! Records shared by the signing workflow, the stores and the HTTP surface.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Upper bound on the byte length of an identity string.
pub const MAX_IDENTITY_LEN: usize = 100;

/// Stable caller identity (a validated email address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Validates `raw` and wraps it as an identity.
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        if is_valid_email(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(InputError::InvalidIdentity)
        }
    }

    /// Borrowed view of the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submitted `{question_id, text}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    /// Identifier of the question being answered.
    pub question_id: i64,
    /// Free-form answer text.
    pub text: String,
}

impl AnswerSubmission {
    /// Convenience constructor used by callers and tests.
    pub fn new(question_id: i64, text: impl Into<String>) -> Self {
        Self {
            question_id,
            text: text.into(),
        }
    }
}

/// A stored answer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    /// Storage-assigned row identifier.
    pub id: i64,
    /// Identifier of the question being answered.
    pub question_id: i64,
    /// Owner of the answer.
    #[serde(skip_serializing)]
    pub identity: Identity,
    /// Answer text.
    pub text: String,
}

/// The registry row pinning an identity's current signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureRecord {
    /// Identity the signature belongs to.
    pub identity: Identity,
    /// Lowercase hex digest.
    pub signature: String,
    /// Unix seconds folded into the digest.
    pub timestamp: i64,
}

/// Client input rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// The identity is not a well-formed email address.
    #[error("invalid identity format")]
    InvalidIdentity,
    /// The signature string was empty.
    #[error("signature must not be empty")]
    EmptySignature,
    /// The request body could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Matches `^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$` with a length cap.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_IDENTITY_LEN {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    local_ok && host_ok && tld_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_addresses() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("a.b+tag@mail.example.co"));
        assert!(Identity::parse("bob_99@sub-domain.example.org").is_ok());
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "alice",
            "@example.com",
            "alice@",
            "alice@example",
            "alice@example.c",
            "alice@example.c0m",
            "al ice@example.com",
            "alice@exa_mple.com",
            "alice@@example.com",
        ] {
            assert!(!is_valid_email(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn rejects_overlong_identity() {
        let long = format!("{}@example.com", "a".repeat(MAX_IDENTITY_LEN));
        assert_eq!(Identity::parse(&long), Err(InputError::InvalidIdentity));
    }

    #[test]
    fn stored_answer_hides_owner_in_json() {
        let answer = Answer {
            id: 7,
            question_id: 2,
            identity: Identity::parse("carol@example.com").unwrap(),
            text: "b".into(),
        };
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json, serde_json::json!({"id": 7, "question_id": 2, "text": "b"}));
    }
}
