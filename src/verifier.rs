//! Read-only signature lookup.
//!
//! A signature is an opaque token: it is valid for an identity exactly when it
//! equals the one pinned in the registry.  Nothing is recomputed, so answer
//! rows changed outside a signing operation are returned as they are now.

use crate::model::{Answer, Identity, InputError};
use crate::store::{AnswerStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Whether the presented signature is the one pinned for the identity.
    pub valid: bool,
    /// Stored answers, in storage order; empty when `valid` is false.
    pub answers: Vec<Answer>,
    /// Signing time in Unix seconds, when valid.
    pub timestamp: Option<i64>,
}

impl Verification {
    fn unknown() -> Self {
        Self {
            valid: false,
            answers: Vec::new(),
            timestamp: None,
        }
    }
}

/// Failures of [`Verifier::verify`]; an unknown signature is not one of them.
#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    /// Malformed identity or signature.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The store could not answer.
    #[error("error verifying the signature: {0}")]
    Store(#[from] StoreError),
    /// The lookup exceeded its deadline.
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
}

/// Resolves presented signatures against the registry.
#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn AnswerStore>,
    timeout: Duration,
}

impl Verifier {
    /// Builds a verifier whose lookups are bounded by `timeout`.
    pub fn new(store: Arc<dyn AnswerStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Validates raw inputs, then looks the signature up.
    pub async fn verify_raw(
        &self,
        identity: &str,
        signature: &str,
    ) -> Result<Verification, VerifyError> {
        let identity = Identity::parse(identity)?;
        self.verify(&identity, signature).await
    }

    /// Looks `signature` up for `identity` and, if pinned, returns the stored answers.
    pub async fn verify(
        &self,
        identity: &Identity,
        signature: &str,
    ) -> Result<Verification, VerifyError> {
        if signature.is_empty() {
            return Err(InputError::EmptySignature.into());
        }
        let deadline = Instant::now() + self.timeout;
        match time::timeout_at(deadline, self.lookup(identity, signature)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(module = "verify", evt = "TIMEOUT", identity = %identity);
                Err(VerifyError::Timeout(self.timeout))
            }
        }
    }

    async fn lookup(
        &self,
        identity: &Identity,
        signature: &str,
    ) -> Result<Verification, VerifyError> {
        let Some(record) = self
            .store
            .find_signature(identity, signature)
            .await
            .map_err(|err| {
                warn!(module = "verify", evt = "LOOKUP_FAILED", identity = %identity, error = %err);
                err
            })?
        else {
            debug!(module = "verify", evt = "UNKNOWN", identity = %identity);
            return Ok(Verification::unknown());
        };

        let answers = self.store.answers_for(identity).await.map_err(|err| {
            warn!(module = "verify", evt = "SCAN_FAILED", identity = %identity, error = %err);
            err
        })?;
        debug!(
            module = "verify",
            evt = "VALID",
            identity = %identity,
            answers = answers.len()
        );
        Ok(Verification {
            valid: true,
            answers,
            timestamp: Some(record.timestamp),
        })
    }
}
