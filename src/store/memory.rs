//! Volatile store keyed by identity.
//!
//! A transaction holds the store-wide writer lock for its whole life and
//! stages its writes on a private copy of the tables; commit swaps the copy
//! in.  Readers only ever see committed tables.

use super::{AnswerStore, StoreError, StoreTransaction, UserDirectory, UserRecord};
use crate::model::{Answer, Identity, SignatureRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    answers: HashMap<String, Vec<Answer>>,
    signatures: HashMap<String, SignatureRecord>,
    next_answer_id: i64,
}

impl Tables {
    fn upsert_answer(&mut self, identity: &Identity, question_id: i64, text: &str) {
        let rows = self.answers.entry(identity.as_str().to_string()).or_default();
        if let Some(existing) = rows.iter_mut().find(|row| row.question_id == question_id) {
            existing.text = text.to_string();
            return;
        }
        self.next_answer_id = self.next_answer_id.saturating_add(1);
        rows.push(Answer {
            id: self.next_answer_id,
            question_id,
            identity: identity.clone(),
            text: text.to_string(),
        });
    }
}

/// In-process answer store, signature registry and account directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    users: Arc<Mutex<HashMap<String, UserRecord>>>,
    writer: Arc<Mutex<()>>,
}

/// Staged writes plus the writer lock that serializes transactions.
pub struct MemoryTransaction {
    _writer: OwnedMutexGuard<()>,
    staged: Tables,
    target: Arc<Mutex<Tables>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn delete_answers(&mut self, identity: &Identity) -> Result<u64, StoreError> {
        let removed = self
            .staged
            .answers
            .remove(identity.as_str())
            .map(|rows| rows.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }

    async fn upsert_answer(
        &mut self,
        identity: &Identity,
        question_id: i64,
        text: &str,
    ) -> Result<(), StoreError> {
        self.staged.upsert_answer(identity, question_id, text);
        Ok(())
    }

    async fn upsert_signature(&mut self, record: &SignatureRecord) -> Result<(), StoreError> {
        self.staged
            .signatures
            .insert(record.identity.as_str().to_string(), record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            _writer,
            staged,
            target,
        } = *self;
        *target.lock().await = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl AnswerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let writer = self.writer.clone().lock_owned().await;
        let staged = self.tables.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            _writer: writer,
            staged,
            target: self.tables.clone(),
        }))
    }

    async fn find_signature(
        &self,
        identity: &Identity,
        signature: &str,
    ) -> Result<Option<SignatureRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .signatures
            .get(identity.as_str())
            .filter(|record| record.signature == signature)
            .cloned())
    }

    async fn answers_for(&self, identity: &Identity) -> Result<Vec<Answer>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .answers
            .get(identity.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        if users.contains_key(user.email.as_str()) {
            return Err(StoreError::Conflict(user.email.to_string()));
        }
        users.insert(user.email.as_str().to_string(), user.clone());
        Ok(())
    }

    async fn find_user(&self, email: &Identity) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().await.get(email.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn readers_see_only_committed_writes() {
        let store = MemoryStore::default();
        let alice = identity("alice@example.com");
        let mut tx = store.begin().await.unwrap();
        tx.upsert_answer(&alice, 1, "a").await.unwrap();
        assert!(store.answers_for(&alice).await.unwrap().is_empty());
        tx.commit().await.unwrap();
        let rows = store.answers_for(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "a");
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_staged_rows() {
        let store = MemoryStore::default();
        let alice = identity("alice@example.com");

        let mut tx = store.begin().await.unwrap();
        tx.upsert_answer(&alice, 1, "a").await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.upsert_answer(&alice, 2, "b").await.unwrap();
        drop(tx);

        assert!(store.answers_for(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_question() {
        let store = MemoryStore::default();
        let alice = identity("alice@example.com");
        let mut tx = store.begin().await.unwrap();
        tx.upsert_answer(&alice, 1, "first").await.unwrap();
        tx.upsert_answer(&alice, 1, "second").await.unwrap();
        tx.commit().await.unwrap();
        let rows = store.answers_for(&alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "second");
    }

    #[tokio::test]
    async fn signature_lookup_requires_exact_match() {
        let store = MemoryStore::default();
        let alice = identity("alice@example.com");
        let mut tx = store.begin().await.unwrap();
        tx.upsert_signature(&SignatureRecord {
            identity: alice.clone(),
            signature: "abc".into(),
            timestamp: 5,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert!(store.find_signature(&alice, "abc").await.unwrap().is_some());
        assert!(store.find_signature(&alice, "abd").await.unwrap().is_none());
        let bob = identity("bob@example.com");
        assert!(store.find_signature(&bob, "abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_user_is_a_conflict() {
        let store = MemoryStore::default();
        let user = UserRecord {
            email: identity("alice@example.com"),
            password_hash: "hash".into(),
            created_at: 1,
        };
        store.insert_user(&user).await.unwrap();
        assert!(matches!(
            store.insert_user(&user).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.find_user(&user.email).await.unwrap(), Some(user));
    }
}
