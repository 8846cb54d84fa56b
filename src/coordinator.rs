//! Signing workflow: wipe, fan out, join, seal, commit.
//!
//! One signing operation runs inside a single store transaction.  The
//! transaction handle is moved into a writer task that drains a bounded queue
//! of upsert requests, so it only ever has one user.  Each submitted answer
//! becomes a write unit that enqueues its upsert and waits on its own one-shot
//! reply; the coordinator gathers every unit's result behind a join barrier
//! before deciding to seal or roll back.

use crate::canonical::{generate_signature, Clock, SealedDigest};
use crate::model::{AnswerSubmission, Identity, SignatureRecord};
use crate::store::{AnswerStore, StoreError, StoreTransaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

/// Default bound on a signing transaction.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(5);
/// Default capacity of the writer queue.
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 64;

/// Tunables for [`SigningCoordinator`].
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Deadline for everything before commit, and separately for commit.
    pub tx_timeout: Duration,
    /// Capacity of the queue feeding the transaction owner.
    pub write_queue_depth: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tx_timeout: DEFAULT_TX_TIMEOUT,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

/// Outcome of a committed signing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAnswers {
    /// Lowercase hex digest now pinned in the registry.
    pub signature: String,
    /// Unix seconds folded into the digest and stored with it.
    pub timestamp: i64,
}

/// Failures of [`SigningCoordinator::sign`].
#[derive(Debug, Clone, Error)]
pub enum SignError {
    /// The store refused to open a transaction; nothing changed.
    #[error("error starting the transaction: {0}")]
    Begin(StoreError),
    /// The delete, an upsert or the signature write failed; rolled back.
    #[error("error writing the answers")]
    WriteFailed,
    /// The deadline expired before commit; rolled back.
    #[error("signing timed out after {0:?}")]
    Timeout(Duration),
    /// Commit failed or timed out; durability is unknown.
    #[error("error finalizing the transaction, outcome unknown: {0}")]
    Indeterminate(String),
}

struct UpsertRequest {
    question_id: i64,
    text: String,
    reply: oneshot::Sender<Result<(), StoreError>>,
}

/// Drives [`AnswerStore`] transactions for signing requests.
#[derive(Clone)]
pub struct SigningCoordinator {
    store: Arc<dyn AnswerStore>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl SigningCoordinator {
    /// Builds a coordinator over `store`, sealing with `clock`.
    pub fn new(
        store: Arc<dyn AnswerStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Replaces every answer of `identity` with `answers` and pins a new signature.
    ///
    /// The digest covers `answers` exactly as submitted.  Storage keeps one row
    /// per question; when a question repeats, its last occurrence wins.
    pub async fn sign(
        &self,
        identity: &Identity,
        answers: &[AnswerSubmission],
    ) -> Result<SignedAnswers, SignError> {
        let deadline = Instant::now() + self.config.tx_timeout;
        let (tx, sealed) = match time::timeout_at(deadline, self.stage(identity, answers)).await {
            Ok(staged) => staged?,
            Err(_) => {
                warn!(
                    module = "sign",
                    evt = "TIMEOUT",
                    identity = %identity,
                    timeout_ms = self.config.tx_timeout.as_millis() as u64,
                    "signing deadline expired before commit"
                );
                return Err(SignError::Timeout(self.config.tx_timeout));
            }
        };

        match time::timeout(self.config.tx_timeout, tx.commit()).await {
            Ok(Ok(())) => {
                info!(
                    module = "sign",
                    evt = "COMMIT",
                    identity = %identity,
                    answers = answers.len(),
                    timestamp = sealed.timestamp,
                    "answers signed"
                );
                Ok(SignedAnswers {
                    signature: sealed.signature,
                    timestamp: sealed.timestamp,
                })
            }
            Ok(Err(err)) => {
                error!(module = "sign", evt = "COMMIT_FAILED", identity = %identity, error = %err);
                Err(SignError::Indeterminate(err.to_string()))
            }
            Err(_) => {
                error!(module = "sign", evt = "COMMIT_TIMEOUT", identity = %identity);
                Err(SignError::Indeterminate("commit timed out".to_string()))
            }
        }
    }

    async fn stage(
        &self,
        identity: &Identity,
        answers: &[AnswerSubmission],
    ) -> Result<(Box<dyn StoreTransaction>, SealedDigest), SignError> {
        let mut tx = self.store.begin().await.map_err(|err| {
            error!(module = "sign", evt = "BEGIN_FAILED", identity = %identity, error = %err);
            SignError::Begin(err)
        })?;

        if let Err(err) = tx.delete_answers(identity).await {
            warn!(module = "sign", evt = "DELETE_FAILED", identity = %identity, error = %err);
            abandon(tx, identity).await;
            return Err(SignError::WriteFailed);
        }

        let mut tx = self.fan_out(tx, identity, answers).await?;

        let sealed = generate_signature(answers, self.clock.as_ref());
        let record = SignatureRecord {
            identity: identity.clone(),
            signature: sealed.signature.clone(),
            timestamp: sealed.timestamp,
        };
        if let Err(err) = tx.upsert_signature(&record).await {
            warn!(
                module = "sign",
                evt = "SIGNATURE_WRITE_FAILED",
                identity = %identity,
                error = %err
            );
            abandon(tx, identity).await;
            return Err(SignError::WriteFailed);
        }
        Ok((tx, sealed))
    }

    /// Runs one write unit per distinct question against the single transaction owner.
    async fn fan_out(
        &self,
        tx: Box<dyn StoreTransaction>,
        identity: &Identity,
        answers: &[AnswerSubmission],
    ) -> Result<Box<dyn StoreTransaction>, SignError> {
        let (queue, pending) = mpsc::channel(self.config.write_queue_depth.max(1));
        let writer = tokio::spawn(drain_queue(tx, identity.clone(), pending));

        let mut units = JoinSet::new();
        for answer in last_write_wins(answers) {
            let queue = queue.clone();
            units.spawn(async move {
                let (reply, outcome) = oneshot::channel();
                queue
                    .send(UpsertRequest {
                        question_id: answer.question_id,
                        text: answer.text,
                        reply,
                    })
                    .await
                    .map_err(|_| StoreError::Closed)?;
                outcome.await.map_err(|_| StoreError::Closed)?
            });
        }
        drop(queue);

        let mut failed = 0usize;
        while let Some(joined) = units.join_next().await {
            let outcome = joined
                .unwrap_or_else(|err| Err(StoreError::Db(format!("write unit aborted: {err}"))));
            if let Err(err) = outcome {
                warn!(module = "sign", evt = "UNIT_FAILED", identity = %identity, error = %err);
                failed += 1;
            }
        }

        let tx = match writer.await {
            Ok(tx) => tx,
            Err(err) => {
                // The handle died with the task; dropping it discards the transaction.
                error!(module = "sign", evt = "WRITER_LOST", identity = %identity, error = %err);
                return Err(SignError::WriteFailed);
            }
        };
        if failed > 0 {
            warn!(module = "sign", evt = "ROLLBACK", identity = %identity, failed);
            abandon(tx, identity).await;
            return Err(SignError::WriteFailed);
        }
        Ok(tx)
    }
}

async fn drain_queue(
    mut tx: Box<dyn StoreTransaction>,
    identity: Identity,
    mut pending: mpsc::Receiver<UpsertRequest>,
) -> Box<dyn StoreTransaction> {
    while let Some(request) = pending.recv().await {
        let outcome = tx
            .upsert_answer(&identity, request.question_id, &request.text)
            .await;
        let _ = request.reply.send(outcome);
    }
    tx
}

async fn abandon(tx: Box<dyn StoreTransaction>, identity: &Identity) {
    if let Err(err) = tx.rollback().await {
        warn!(module = "sign", evt = "ROLLBACK_FAILED", identity = %identity, error = %err);
    }
}

/// Keeps only the last occurrence of each question, in submission order.
fn last_write_wins(answers: &[AnswerSubmission]) -> Vec<AnswerSubmission> {
    let mut last = HashMap::with_capacity(answers.len());
    for (idx, answer) in answers.iter().enumerate() {
        last.insert(answer.question_id, idx);
    }
    answers
        .iter()
        .enumerate()
        .filter(|(idx, answer)| last.get(&answer.question_id) == Some(idx))
        .map(|(_, answer)| answer.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{digest_at, FixedClock, SystemClock};
    use crate::model::{Answer, SignatureRecord};
    use crate::store::{MemoryStore, SqliteStore, SqliteStoreOptions};
    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum Fault {
        Delete,
        UpsertQuestion(i64),
        Signature,
        Commit,
        SlowUpsert(Duration),
    }

    struct FaultyStore {
        inner: Arc<dyn AnswerStore>,
        fault: Fault,
    }

    impl FaultyStore {
        fn wrap(inner: Arc<dyn AnswerStore>, fault: Fault) -> Arc<Self> {
            Arc::new(Self { inner, fault })
        }
    }

    struct FaultyTransaction {
        inner: Box<dyn StoreTransaction>,
        fault: Fault,
    }

    #[async_trait]
    impl StoreTransaction for FaultyTransaction {
        async fn delete_answers(&mut self, identity: &Identity) -> Result<u64, StoreError> {
            if let Fault::Delete = self.fault {
                return Err(StoreError::Db("injected delete failure".into()));
            }
            self.inner.delete_answers(identity).await
        }

        async fn upsert_answer(
            &mut self,
            identity: &Identity,
            question_id: i64,
            text: &str,
        ) -> Result<(), StoreError> {
            match self.fault {
                Fault::UpsertQuestion(bad) if bad == question_id => {
                    return Err(StoreError::Db("injected upsert failure".into()))
                }
                Fault::SlowUpsert(delay) => time::sleep(delay).await,
                _ => {}
            }
            self.inner.upsert_answer(identity, question_id, text).await
        }

        async fn upsert_signature(&mut self, record: &SignatureRecord) -> Result<(), StoreError> {
            if let Fault::Signature = self.fault {
                return Err(StoreError::Db("injected signature failure".into()));
            }
            self.inner.upsert_signature(record).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            if let Fault::Commit = self.fault {
                return Err(StoreError::Db("injected commit failure".into()));
            }
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl AnswerStore for FaultyStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
            Ok(Box::new(FaultyTransaction {
                inner: self.inner.begin().await?,
                fault: self.fault,
            }))
        }

        async fn find_signature(
            &self,
            identity: &Identity,
            signature: &str,
        ) -> Result<Option<SignatureRecord>, StoreError> {
            self.inner.find_signature(identity, signature).await
        }

        async fn answers_for(&self, identity: &Identity) -> Result<Vec<Answer>, StoreError> {
            self.inner.answers_for(identity).await
        }
    }

    async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
        Arc::new(
            SqliteStore::open(SqliteStoreOptions {
                path: dir.path().join("signer.sqlite"),
                busy_timeout: Duration::from_secs(5),
            })
            .await
            .unwrap(),
        )
    }

    /// Signs a baseline set, runs `fault` over a second set and checks the
    /// baseline answers and signature are still the committed state.
    async fn assert_fault_preserves_state(
        store: Arc<dyn AnswerStore>,
        fault: Fault,
        tx_timeout: Duration,
    ) -> SignError {
        let before = coordinator(store.clone(), 10)
            .sign(&alice(), &answers(&[(1, "a"), (2, "b")]))
            .await
            .unwrap();

        let config = CoordinatorConfig {
            tx_timeout,
            ..CoordinatorConfig::default()
        };
        let faulty = SigningCoordinator::new(
            FaultyStore::wrap(store.clone(), fault),
            Arc::new(FixedClock(20)),
            config,
        );
        let next = answers(&[(11, "w"), (12, "x"), (13, "y"), (14, "z")]);
        let err = faulty.sign(&alice(), &next).await.unwrap_err();

        let rows = store.answers_for(&alice()).await.unwrap();
        assert_eq!(
            stored_pairs(&rows),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        assert!(store
            .find_signature(&alice(), &before.signature)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_signature(&alice(), &digest_at(&next, 20))
            .await
            .unwrap()
            .is_none());
        err
    }

    fn alice() -> Identity {
        Identity::parse("alice@example.com").unwrap()
    }

    fn answers(pairs: &[(i64, &str)]) -> Vec<AnswerSubmission> {
        pairs
            .iter()
            .map(|(id, text)| AnswerSubmission::new(*id, *text))
            .collect()
    }

    fn coordinator(store: Arc<dyn AnswerStore>, at: i64) -> SigningCoordinator {
        SigningCoordinator::new(store, Arc::new(FixedClock(at)), CoordinatorConfig::default())
    }

    fn stored_pairs(rows: &[Answer]) -> Vec<(i64, String)> {
        let mut pairs = rows
            .iter()
            .map(|row| (row.question_id, row.text.clone()))
            .collect::<Vec<_>>();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn sign_stores_answers_and_reference_signature() {
        let store = Arc::new(MemoryStore::default());
        let signed = coordinator(store.clone(), 1000)
            .sign(&alice(), &answers(&[(2, "b"), (1, "a")]))
            .await
            .unwrap();
        assert_eq!(
            signed.signature,
            "8c839ead475b1f143fd4b6adfacfc7b6a0b59666bc0c93849d8f879bfaa53d01"
        );
        assert_eq!(signed.timestamp, 1000);
        let rows = store.answers_for(&alice()).await.unwrap();
        assert_eq!(
            stored_pairs(&rows),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        let record = store
            .find_signature(&alice(), &signed.signature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.timestamp, 1000);
    }

    #[tokio::test]
    async fn resigning_replaces_previous_answer_set() {
        let store = Arc::new(MemoryStore::default());
        coordinator(store.clone(), 10)
            .sign(&alice(), &answers(&[(1, "a"), (2, "b")]))
            .await
            .unwrap();
        coordinator(store.clone(), 20)
            .sign(&alice(), &answers(&[(3, "c"), (4, "d")]))
            .await
            .unwrap();
        let rows = store.answers_for(&alice()).await.unwrap();
        assert_eq!(
            stored_pairs(&rows),
            vec![(3, "c".to_string()), (4, "d".to_string())]
        );
    }

    #[tokio::test]
    async fn failing_unit_leaves_prior_state_untouched() {
        let err = assert_fault_preserves_state(
            Arc::new(MemoryStore::default()),
            Fault::UpsertQuestion(13),
            DEFAULT_TX_TIMEOUT,
        )
        .await;
        assert!(matches!(err, SignError::WriteFailed));
    }

    #[tokio::test]
    async fn failing_delete_rolls_back() {
        let err = assert_fault_preserves_state(
            Arc::new(MemoryStore::default()),
            Fault::Delete,
            DEFAULT_TX_TIMEOUT,
        )
        .await;
        assert!(matches!(err, SignError::WriteFailed));
    }

    #[tokio::test]
    async fn failing_signature_write_rolls_back() {
        let err = assert_fault_preserves_state(
            Arc::new(MemoryStore::default()),
            Fault::Signature,
            DEFAULT_TX_TIMEOUT,
        )
        .await;
        assert!(matches!(err, SignError::WriteFailed));
    }

    #[tokio::test]
    async fn sqlite_failing_unit_leaves_prior_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let err = assert_fault_preserves_state(
            sqlite_store(&dir).await,
            Fault::UpsertQuestion(12),
            DEFAULT_TX_TIMEOUT,
        )
        .await;
        assert!(matches!(err, SignError::WriteFailed));
    }

    #[tokio::test]
    async fn sqlite_failing_delete_and_signature_roll_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        for fault in [Fault::Delete, Fault::Signature] {
            let err = assert_fault_preserves_state(store.clone(), fault, DEFAULT_TX_TIMEOUT).await;
            assert!(matches!(err, SignError::WriteFailed));
        }
    }

    #[tokio::test]
    async fn sqlite_timeout_leaves_prior_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let err = assert_fault_preserves_state(
            sqlite_store(&dir).await,
            Fault::SlowUpsert(Duration::from_millis(300)),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(err, SignError::Timeout(_)));
    }

    #[tokio::test]
    async fn empty_submission_wipes_and_still_signs() {
        let store = Arc::new(MemoryStore::default());
        coordinator(store.clone(), 10)
            .sign(&alice(), &answers(&[(1, "a")]))
            .await
            .unwrap();
        let signed = coordinator(store.clone(), 1000)
            .sign(&alice(), &[])
            .await
            .unwrap();
        assert_eq!(signed.signature, digest_at(&[], 1000));
        assert!(store.answers_for(&alice()).await.unwrap().is_empty());
        assert!(store
            .find_signature(&alice(), &signed.signature)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn repeated_question_keeps_last_text_but_digest_covers_submission() {
        let store = Arc::new(MemoryStore::default());
        let submitted = answers(&[(1, "first"), (2, "b"), (1, "last")]);
        let signed = coordinator(store.clone(), 5)
            .sign(&alice(), &submitted)
            .await
            .unwrap();
        let rows = store.answers_for(&alice()).await.unwrap();
        assert_eq!(
            stored_pairs(&rows),
            vec![(1, "last".to_string()), (2, "b".to_string())]
        );
        assert_eq!(signed.signature, digest_at(&submitted, 5));
    }

    #[tokio::test]
    async fn commit_failure_is_indeterminate() {
        let faulty = FaultyStore::wrap(Arc::new(MemoryStore::default()), Fault::Commit);
        let err = coordinator(faulty, 1)
            .sign(&alice(), &answers(&[(1, "a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SignError::Indeterminate(_)));
    }

    #[tokio::test]
    async fn slow_writes_time_out_and_roll_back() {
        let memory = MemoryStore::default();
        let faulty = FaultyStore::wrap(
            Arc::new(memory.clone()),
            Fault::SlowUpsert(Duration::from_millis(500)),
        );
        let config = CoordinatorConfig {
            tx_timeout: Duration::from_millis(50),
            ..CoordinatorConfig::default()
        };
        let coordinator = SigningCoordinator::new(faulty, Arc::new(FixedClock(1)), config);
        let err = coordinator
            .sign(&alice(), &answers(&[(1, "a"), (2, "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SignError::Timeout(_)));
        // Waits for the detached writer to release the transaction.
        let tx = memory.begin().await.unwrap();
        tx.rollback().await.unwrap();
        assert!(memory.answers_for(&alice()).await.unwrap().is_empty());
    }

    #[test]
    fn last_write_wins_keeps_final_occurrence() {
        let collapsed = last_write_wins(&answers(&[(1, "a"), (2, "b"), (1, "c"), (3, "d")]));
        assert_eq!(collapsed, answers(&[(2, "b"), (1, "c"), (3, "d")]));
    }

    #[tokio::test]
    async fn sqlite_fan_out_writes_every_answer() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let submitted = (0..40)
            .map(|id| AnswerSubmission::new(id, format!("answer {id}")))
            .collect::<Vec<_>>();
        let coordinator = SigningCoordinator::new(
            store.clone(),
            Arc::new(SystemClock),
            CoordinatorConfig::default(),
        );
        let signed = coordinator.sign(&alice(), &submitted).await.unwrap();
        assert_eq!(store.answers_for(&alice()).await.unwrap().len(), 40);
        assert_eq!(signed.signature, digest_at(&submitted, signed.timestamp));
    }

    #[tokio::test]
    async fn sqlite_signers_for_different_identities_both_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let coordinator = coordinator(store.clone(), 77);
        let (first, bob) = (alice(), Identity::parse("bob@example.com").unwrap());
        let (first_set, bob_set) = (answers(&[(1, "a")]), answers(&[(1, "b"), (2, "c")]));
        let (left, right) = tokio::join!(
            coordinator.sign(&first, &first_set),
            coordinator.sign(&bob, &bob_set),
        );
        left.unwrap();
        right.unwrap();
        assert_eq!(store.answers_for(&alice()).await.unwrap().len(), 1);
        assert_eq!(store.answers_for(&bob).await.unwrap().len(), 2);
    }
}
