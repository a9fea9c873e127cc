//! Optimistic multi-document transactions.
//!
//! A [`Transaction`] records the version of every document it reads and
//! buffers every write. Commit hands the buffered [`WriteBatch`] to the
//! store, which applies it only if none of the read documents changed in the
//! meantime. [`run_transaction`] reruns the whole body on conflict, so bodies
//! must only touch the transaction itself: notifications and analytics go
//! through the outbox and are delivered after commit.

use crate::domain::model::{Member, OutboxPayload, OutboxTask, PromotionAuditEntry, ReferralCodeRecord};
use crate::domain::ports::{DocKey, DocumentStore, WriteBatch};
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub struct Transaction<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    read_versions: HashMap<DocKey, u64>,
    members: HashMap<String, Option<Member>>,
    codes: HashMap<String, Option<ReferralCodeRecord>>,
    member_writes: Vec<String>,
    code_writes: Vec<String>,
    audits: Vec<PromotionAuditEntry>,
    outbox: Vec<OutboxTask>,
}

impl<S: DocumentStore + ?Sized> Transaction<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            read_versions: HashMap::new(),
            members: HashMap::new(),
            codes: HashMap::new(),
            member_writes: Vec::new(),
            code_writes: Vec::new(),
            audits: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Read a member; later reads in the same transaction see buffered writes.
    pub async fn member(&mut self, id: &str) -> Result<Option<Member>> {
        if let Some(cached) = self.members.get(id) {
            return Ok(cached.clone());
        }

        let doc = self.store.member(id).await?;
        let version = doc.as_ref().map(|d| d.version).unwrap_or(0);
        self.read_versions
            .entry(DocKey::Member(id.to_string()))
            .or_insert(version);
        let value = doc.map(|d| d.value);
        self.members.insert(id.to_string(), value.clone());
        Ok(value)
    }

    pub async fn require_member(&mut self, id: &str) -> Result<Member> {
        self.member(id)
            .await?
            .ok_or_else(|| EngineError::MemberNotFound {
                member_id: id.to_string(),
            })
    }

    pub async fn code(&mut self, code: &str) -> Result<Option<ReferralCodeRecord>> {
        if let Some(cached) = self.codes.get(code) {
            return Ok(cached.clone());
        }

        let doc = self.store.code(code).await?;
        let version = doc.as_ref().map(|d| d.version).unwrap_or(0);
        self.read_versions
            .entry(DocKey::Code(code.to_string()))
            .or_insert(version);
        let value = doc.map(|d| d.value);
        self.codes.insert(code.to_string(), value.clone());
        Ok(value)
    }

    /// Buffer a member write. The document must have been read first so the
    /// commit can detect concurrent modification (or concurrent creation).
    pub async fn put_member(&mut self, member: Member) -> Result<()> {
        if !self.members.contains_key(&member.id) {
            self.member(&member.id).await?;
        }
        if !self.member_writes.contains(&member.id) {
            self.member_writes.push(member.id.clone());
        }
        self.members.insert(member.id.clone(), Some(member));
        Ok(())
    }

    pub async fn put_code(&mut self, record: ReferralCodeRecord) -> Result<()> {
        if !self.codes.contains_key(&record.code) {
            self.code(&record.code).await?;
        }
        if !self.code_writes.contains(&record.code) {
            self.code_writes.push(record.code.clone());
        }
        self.codes.insert(record.code.clone(), Some(record));
        Ok(())
    }

    /// Create a code index entry, failing with `CodeCollision` if it exists.
    /// A concurrent creation between this read and commit surfaces as a conflict.
    pub async fn create_code(&mut self, record: ReferralCodeRecord) -> Result<()> {
        if self.code(&record.code).await?.is_some() {
            return Err(EngineError::CodeCollision {
                code: record.code.clone(),
            });
        }
        self.put_code(record).await
    }

    pub fn append_audit(&mut self, entry: PromotionAuditEntry) {
        self.audits.push(entry);
    }

    pub fn enqueue(&mut self, payload: OutboxPayload) {
        self.outbox.push(OutboxTask::new(payload));
    }

    pub fn into_batch(self) -> WriteBatch {
        let Transaction {
            read_versions,
            mut members,
            mut codes,
            member_writes,
            code_writes,
            audits,
            outbox,
            ..
        } = self;

        let mut preconditions: Vec<(DocKey, u64)> = read_versions.into_iter().collect();
        preconditions.sort();

        WriteBatch {
            preconditions,
            members: member_writes
                .iter()
                .filter_map(|id| members.remove(id).flatten())
                .collect(),
            codes: code_writes
                .iter()
                .filter_map(|code| codes.remove(code).flatten())
                .collect(),
            audits,
            outbox,
        }
    }

    pub async fn commit(self) -> Result<()> {
        let store = self.store.clone();
        let batch = self.into_batch();
        if !batch.has_writes() {
            return Ok(());
        }
        store.commit(batch).await
    }
}

/// Run `body` in a fresh transaction, committing its buffered writes and
/// retrying the whole body on conflict with capped exponential backoff.
///
/// The body receives the transaction by value and hands it back with its
/// result, which keeps borrowed captures usable across attempts.
pub async fn run_transaction<S, T, F, Fut>(
    store: &Arc<S>,
    retry: &RetryConfig,
    operation: &str,
    mut body: F,
) -> Result<T>
where
    S: DocumentStore + ?Sized,
    F: FnMut(Transaction<S>) -> Fut,
    Fut: Future<Output = Result<(Transaction<S>, T)>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let tx = Transaction::new(store.clone());
        let outcome = match body(tx).await {
            Ok((tx, value)) => tx.commit().await.map(|_| value),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::warn!("⚠️ Transaction '{}' gave up after {} conflicts", operation, attempt);
                    return Err(EngineError::TransactionConflict {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                let backoff = retry.backoff_for_attempt(attempt - 1);
                tracing::debug!(
                    "🔁 Transaction '{}' conflicted ({}), retry {}/{} in {:?}",
                    operation,
                    e,
                    attempt,
                    max_attempts - 1,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reads_see_buffered_writes() {
        let store = Arc::new(MemoryStore::new());
        store.insert_member(Member::new("a", "member")).await;

        let mut tx = Transaction::new(store.clone());
        let mut member = tx.require_member("a").await.unwrap();
        member.team_size = 7;
        tx.put_member(member).await.unwrap();

        assert_eq!(tx.require_member("a").await.unwrap().team_size, 7);
        // 尚未提交，儲存區不應改變
        assert_eq!(store.member("a").await.unwrap().unwrap().value.team_size, 0);

        tx.commit().await.unwrap();
        assert_eq!(store.member("a").await.unwrap().unwrap().value.team_size, 7);
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_modification() {
        let store = Arc::new(MemoryStore::new());
        store.insert_member(Member::new("a", "member")).await;

        let mut first = Transaction::new(store.clone());
        let mut second = Transaction::new(store.clone());

        let mut a1 = first.require_member("a").await.unwrap();
        let mut a2 = second.require_member("a").await.unwrap();
        a1.team_size += 1;
        a2.team_size += 1;
        first.put_member(a1).await.unwrap();
        second.put_member(a2).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.member("a").await.unwrap().unwrap().value.team_size, 1);
    }

    #[tokio::test]
    async fn test_create_code_reports_collision() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_code_if_absent(ReferralCodeRecord::new("RFAAAAAA", "x"))
            .await
            .unwrap();

        let mut tx = Transaction::new(store.clone());
        let err = tx
            .create_code(ReferralCodeRecord::new("RFAAAAAA", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CodeCollision { .. }));
    }

    #[tokio::test]
    async fn test_run_transaction_retries_injected_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store.insert_member(Member::new("a", "member")).await;
        store.fail_next_commits(2);

        let result = run_transaction(&store, &fast_retry(5), "increment", |mut tx| async move {
            let mut member = tx.require_member("a").await?;
            member.direct_referral_count += 1;
            tx.put_member(member).await?;
            Ok((tx, ()))
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(
            store.member("a").await.unwrap().unwrap().value.direct_referral_count,
            1
        );
    }

    #[tokio::test]
    async fn test_run_transaction_gives_up() {
        let store = Arc::new(MemoryStore::new());
        store.insert_member(Member::new("a", "member")).await;
        store.fail_next_commits(10);

        let err = run_transaction(&store, &fast_retry(3), "increment", |mut tx| async move {
            let mut member = tx.require_member("a").await?;
            member.team_size += 1;
            tx.put_member(member).await?;
            Ok((tx, ()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::TransactionConflict { attempts: 3, .. }));
        assert_eq!(store.member("a").await.unwrap().unwrap().value.team_size, 0);
    }
}
