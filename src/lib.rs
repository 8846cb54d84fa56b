#![deny(missing_docs)]

//! # answer_signer
//!
//! **answer_signer** stores a caller's answers to a questionnaire, seals them
//! with a timestamped SHA-256 digest, and later resolves that digest back to
//! the stored answers.
//!
//! ## Workflow
//!
//! * **Signing**: [`SigningCoordinator::sign`] wipes every prior answer of the
//!   identity, upserts the new set concurrently through a single transaction
//!   owner, pins the new signature and commits.  Either all of it becomes
//!   visible or none of it does; a failed or uncertain commit is reported as
//!   [`SignError::Indeterminate`], never as a clean rollback.
//! * **Canonical form**: the [`canonical`] module orders answers by question
//!   id and renders `"{id}:{text}"` joined by `|`, then appends
//!   `":{unix_seconds}"` before hashing.
//! * **Verification**: [`Verifier::verify`] is a registry lookup.  The signature
//!   is valid only if it is the one currently pinned for that identity.
//! * **Identity**: bearer tokens minted by [`TokenAuthority`] map requests to an
//!   email identity; [`AccountService`] handles registration and login.
//! * **Storage**: SQLite through `tokio-rusqlite`, or volatile in-memory tables.
//!
//! ## Usage
//!
//! ```rust
//! use answer_signer::{compose, digest_at, AnswerSubmission};
//!
//! let answers = vec![AnswerSubmission::new(2, "b"), AnswerSubmission::new(1, "a")];
//! assert_eq!(compose(&answers, 1000), "1:a|2:b:1000");
//! assert_eq!(
//!     digest_at(&answers, 1000),
//!     "8c839ead475b1f143fd4b6adfacfc7b6a0b59666bc0c93849d8f879bfaa53d01"
//! );
//! ```

pub mod accounts;
pub mod canonical;
pub mod config;
pub mod coordinator;
pub mod identity;
pub mod model;
pub mod server;
pub mod store;
pub mod verifier;

pub use accounts::{is_valid_password, AccountError, AccountService};
pub use canonical::{
    canonicalize, compose, digest_at, generate_signature, Clock, FixedClock, SealedDigest,
    SystemClock,
};
pub use config::{ConfigError, ServiceConfig};
pub use coordinator::{CoordinatorConfig, SignError, SignedAnswers, SigningCoordinator};
pub use identity::{AuthError, IdentityResolver, TokenAuthority, TokenClaims};
pub use model::{is_valid_email, Answer, AnswerSubmission, Identity, InputError, SignatureRecord};
pub use server::{routes, run_server, serve, AppState};
pub use store::{
    open_stores, AnswerStore, MemoryStore, SqliteStore, SqliteStoreOptions, StoreError,
    StoreKind, StoreOptions, StoreTransaction, Stores, UserDirectory, UserRecord,
};
pub use verifier::{Verification, Verifier, VerifyError};
