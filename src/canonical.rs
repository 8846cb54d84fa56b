//! Deterministic canonical form and timestamped digest for answer sets.
//!
//! Answers are ordered by `question_id` (stable, so equal keys keep their
//! submission order), rendered as `"{question_id}:{text}"` and joined with
//! `|`.  The signing timestamp is appended as `":{unix_seconds}"` and the
//! composed string is hashed with SHA-256.  Because the timestamp is part of
//! the hashed input, the same answers signed at two different seconds yield
//! two different signatures; issued signatures are resolved by lookup only.

use crate::model::AnswerSubmission;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the wall-clock seconds folded into a signature.
pub trait Clock: Send + Sync {
    /// Current Unix time in seconds.
    fn unix_now(&self) -> i64;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn unix_now(&self) -> i64 {
        self.0
    }
}

/// A digest together with the timestamp it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedDigest {
    /// Lowercase hex SHA-256 digest.
    pub signature: String,
    /// Unix seconds appended to the canonical string before hashing.
    pub timestamp: i64,
}

/// Returns the answers in canonical order without copying their text.
pub fn ordered(answers: &[AnswerSubmission]) -> Vec<&AnswerSubmission> {
    let mut sorted = answers.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|answer| answer.question_id);
    sorted
}

/// Renders the canonical `"{id}:{text}|..."` form of an answer collection.
pub fn canonicalize(answers: &[AnswerSubmission]) -> String {
    ordered(answers)
        .iter()
        .map(|answer| format!("{}:{}", answer.question_id, answer.text))
        .collect::<Vec<_>>()
        .join("|")
}

/// Builds the exact string that is hashed for `timestamp`.
pub fn compose(answers: &[AnswerSubmission], timestamp: i64) -> String {
    format!("{}:{timestamp}", canonicalize(answers))
}

/// Hashes the composed string for a known timestamp.
pub fn digest_at(answers: &[AnswerSubmission], timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(compose(answers, timestamp).as_bytes());
    hex::encode(hasher.finalize())
}

/// Reads the clock once and seals the answers at that instant.
pub fn generate_signature(answers: &[AnswerSubmission], clock: &dyn Clock) -> SealedDigest {
    let timestamp = clock.unix_now();
    SealedDigest {
        signature: digest_at(answers, timestamp),
        timestamp,
    }
}
