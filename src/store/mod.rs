//! Durable storage seams for answers, signatures and accounts.
//!
//! [`AnswerStore`] is what the signing coordinator and the verifier consume.
//! A signing operation runs inside one [`StoreTransaction`], which is an
//! exclusively owned handle: every method takes `&mut self`, so concurrent
//! writers have to go through a single owner (see `coordinator`).  Dropping a
//! transaction without calling [`StoreTransaction::commit`] discards it.

use crate::model::{Answer, Identity, SignatureRecord};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// In-process backend with transactional staging.
pub mod memory;
/// SQLite backend driven through `tokio-rusqlite`.
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreOptions};

/// Errors raised by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Engine-level failure (I/O, SQL, constraint).
    #[error("database error: {0}")]
    Db(String),
    /// A uniqueness constraint rejected the write.
    #[error("duplicate key: {0}")]
    Conflict(String),
    /// The transaction owner went away before answering.
    #[error("transaction handle closed")]
    Closed,
}

/// Account row used by registration and login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Account email, doubling as the signing identity.
    pub email: Identity,
    /// Argon2 PHC string.
    pub password_hash: String,
    /// Unix seconds at registration.
    pub created_at: i64,
}

/// An open write transaction over answers and signatures.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Removes every answer owned by `identity`, returning the row count.
    async fn delete_answers(&mut self, identity: &Identity) -> Result<u64, StoreError>;

    /// Inserts or overwrites the answer keyed by `(question_id, identity)`.
    async fn upsert_answer(
        &mut self,
        identity: &Identity,
        question_id: i64,
        text: &str,
    ) -> Result<(), StoreError>;

    /// Inserts or overwrites the signature row for `record.identity`.
    async fn upsert_signature(&mut self, record: &SignatureRecord) -> Result<(), StoreError>;

    /// Makes every staged write durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards every staged write.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Answer storage plus the signature registry.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    /// Opens a write transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Point lookup on `(identity, signature)`.
    async fn find_signature(
        &self,
        identity: &Identity,
        signature: &str,
    ) -> Result<Option<SignatureRecord>, StoreError>;

    /// Every committed answer for `identity`, in storage order.
    async fn answers_for(&self, identity: &Identity) -> Result<Vec<Answer>, StoreError>;
}

/// Account directory consumed by registration and login.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Inserts a new account; [`StoreError::Conflict`] if the email exists.
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Looks an account up by email.
    async fn find_user(&self, email: &Identity) -> Result<Option<UserRecord>, StoreError>;
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// SQLite database file.
    Sqlite,
    /// Volatile in-process tables.
    Memory,
}

/// Options for [`open_stores`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backend selection.
    pub kind: StoreKind,
    /// Database file for [`StoreKind::Sqlite`].
    pub path: PathBuf,
    /// Lock wait bound applied to each SQLite connection.
    pub busy_timeout: Duration,
}

/// Both store roles backed by the same engine.
#[derive(Clone)]
pub struct Stores {
    /// Answers and signature registry.
    pub answers: Arc<dyn AnswerStore>,
    /// Accounts.
    pub users: Arc<dyn UserDirectory>,
}

/// Opens the configured backend and hands out its two roles.
pub async fn open_stores(opts: StoreOptions) -> Result<Stores, StoreError> {
    match opts.kind {
        StoreKind::Sqlite => {
            let store = Arc::new(
                SqliteStore::open(SqliteStoreOptions {
                    path: opts.path,
                    busy_timeout: opts.busy_timeout,
                })
                .await?,
            );
            Ok(Stores {
                answers: store.clone(),
                users: store,
            })
        }
        StoreKind::Memory => {
            let store = Arc::new(MemoryStore::default());
            Ok(Stores {
                answers: store.clone(),
                users: store,
            })
        }
    }
}
