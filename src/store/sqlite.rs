//! SQLite backend.
//!
//! Reads go through one shared connection that never writes, so under WAL a
//! lookup is not queued behind a writer waiting on the database lock.  Account
//! inserts use a second long-lived connection.  Every signing transaction
//! opens its own connection and issues `BEGIN IMMEDIATE`, so the engine
//! serializes signing operations and the busy timeout bounds how long one
//! waits for another.  A transaction connection dropped without `COMMIT` is
//! closed and SQLite rolls the transaction back.

use super::{AnswerStore, StoreError, StoreTransaction, UserDirectory, UserRecord};
use crate::model::{Answer, Identity, SignatureRecord};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  email          TEXT PRIMARY KEY,
  password_hash  TEXT NOT NULL,
  created_at     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS answers (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  question_id  INTEGER NOT NULL,
  user_email   TEXT NOT NULL,
  text         TEXT NOT NULL,
  UNIQUE (question_id, user_email)
);

CREATE INDEX IF NOT EXISTS answers_user_idx ON answers(user_email);

CREATE TABLE IF NOT EXISTS signatures (
  user_email  TEXT PRIMARY KEY,
  sign        TEXT NOT NULL,
  signed_at   INTEGER NOT NULL
);
"#;

/// Options for [`SqliteStore::open`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// Database file; parent directories are created on open.
    pub path: PathBuf,
    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
}

/// SQLite-backed answer store, signature registry and account directory.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    reader: Connection,
    accounts: Connection,
}

fn db_err(err: tokio_rusqlite::Error) -> StoreError {
    StoreError::Db(err.to_string())
}

async fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).await.map_err(db_err)?;
    conn.call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    })
    .await
    .map_err(db_err)?;
    Ok(conn)
}

impl SqliteStore {
    /// Opens (creating if needed) the database and applies the schema.
    pub async fn open(opts: SqliteStoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = opts.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Db(format!("create store dir {}: {err}", parent.display()))
                })?;
            }
        }
        let reader = open_connection(&opts.path, opts.busy_timeout).await?;
        reader
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(db_err)?;
        let accounts = open_connection(&opts.path, opts.busy_timeout).await?;
        Ok(Self {
            path: opts.path,
            busy_timeout: opts.busy_timeout,
            reader,
            accounts,
        })
    }

    /// Database file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A `BEGIN IMMEDIATE` transaction on a dedicated connection.
pub struct SqliteTransaction {
    conn: Connection,
}

impl SqliteTransaction {
    async fn finish(&self, statement: &'static str) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(statement)?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn delete_answers(&mut self, identity: &Identity) -> Result<u64, StoreError> {
        let email = identity.as_str().to_string();
        self.conn
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM answers WHERE user_email = ?1", params![email])?;
                Ok(removed as u64)
            })
            .await
            .map_err(db_err)
    }

    async fn upsert_answer(
        &mut self,
        identity: &Identity,
        question_id: i64,
        text: &str,
    ) -> Result<(), StoreError> {
        let email = identity.as_str().to_string();
        let text = text.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO answers (question_id, user_email, text)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (question_id, user_email)
                     DO UPDATE SET text = excluded.text",
                    params![question_id, email, text],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn upsert_signature(&mut self, record: &SignatureRecord) -> Result<(), StoreError> {
        let email = record.identity.as_str().to_string();
        let signature = record.signature.clone();
        let timestamp = record.timestamp;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO signatures (user_email, sign, signed_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_email)
                     DO UPDATE SET sign = excluded.sign, signed_at = excluded.signed_at",
                    params![email, signature, timestamp],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl AnswerStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let conn = open_connection(&self.path, self.busy_timeout).await?;
        conn.call(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        })
        .await
        .map_err(db_err)?;
        Ok(Box::new(SqliteTransaction { conn }))
    }

    async fn find_signature(
        &self,
        identity: &Identity,
        signature: &str,
    ) -> Result<Option<SignatureRecord>, StoreError> {
        let email = identity.as_str().to_string();
        let presented = signature.to_string();
        let signed_at = self
            .reader
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT signed_at FROM signatures WHERE user_email = ?1 AND sign = ?2",
                        params![email, presented],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?;
                Ok(found)
            })
            .await
            .map_err(db_err)?;
        Ok(signed_at.map(|timestamp| SignatureRecord {
            identity: identity.clone(),
            signature: signature.to_string(),
            timestamp,
        }))
    }

    async fn answers_for(&self, identity: &Identity) -> Result<Vec<Answer>, StoreError> {
        let email = identity.as_str().to_string();
        let rows = self
            .reader
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, question_id, text FROM answers WHERE user_email = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![email], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, question_id, text)| Answer {
                id,
                question_id,
                identity: identity.clone(),
                text,
            })
            .collect())
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let email = user.email.as_str().to_string();
        let password_hash = user.password_hash.clone();
        let created_at = user.created_at;
        let inserted = self
            .accounts
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO users (email, password_hash, created_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (email) DO NOTHING",
                    params![email, password_hash, created_at],
                )?;
                Ok(inserted)
            })
            .await
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(StoreError::Conflict(user.email.to_string()));
        }
        Ok(())
    }

    async fn find_user(&self, email: &Identity) -> Result<Option<UserRecord>, StoreError> {
        let key = email.as_str().to_string();
        let row = self
            .reader
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT password_hash, created_at FROM users WHERE email = ?1",
                        params![key],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(db_err)?;
        Ok(row.map(|(password_hash, created_at)| UserRecord {
            email: email.clone(),
            password_hash,
            created_at,
        }))
    }
}
