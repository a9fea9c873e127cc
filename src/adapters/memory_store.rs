//! In-process [`DocumentStore`] with optimistic version checks.
//!
//! Used by the CLI (persisted as a JSON snapshot) and by the test-suite. Every
//! document carries a version bumped on each write; `commit` validates all
//! preconditions of a batch under one write lock before applying any write.

use crate::domain::model::{
    AnalyticsEvent, Member, OutboxStatus, OutboxTask, PromotionAuditEntry, ReferralCodeRecord,
    SuspiciousActivity,
};
use crate::domain::ports::{
    DocKey, DocumentStore, MemberFilter, ReferralPaymentCounts, Versioned, WriteBatch,
};
use crate::utils::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

/// Full store contents; also the on-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub members: BTreeMap<String, Versioned<Member>>,
    pub referral_codes: BTreeMap<String, Versioned<ReferralCodeRecord>>,
    pub promotion_audit: Vec<PromotionAuditEntry>,
    pub analytics_events: Vec<AnalyticsEvent>,
    pub outbox: BTreeMap<String, OutboxTask>,
    pub suspicious_activity: Vec<SuspiciousActivity>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreSnapshot>,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    /// Write a member outside any transaction, bumping its version.
    /// Stands in for imports and external repairs of the member collection.
    pub async fn insert_member(&self, member: Member) {
        let mut state = self.state.write().await;
        let version = state
            .members
            .get(&member.id)
            .map(|d| d.version + 1)
            .unwrap_or(1);
        state.members.insert(
            member.id.clone(),
            Versioned {
                version,
                value: member,
            },
        );
    }

    /// Make the next `n` commits fail with a conflict.
    pub fn fail_next_commits(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn all_members(&self) -> Vec<Member> {
        let state = self.state.read().await;
        state.members.values().map(|d| d.value.clone()).collect()
    }

    pub async fn analytics_events(&self) -> Vec<AnalyticsEvent> {
        self.state.read().await.analytics_events.clone()
    }

    pub async fn suspicious_activity(&self) -> Vec<SuspiciousActivity> {
        self.state.read().await.suspicious_activity.clone()
    }

    pub async fn outbox_tasks(&self) -> Vec<OutboxTask> {
        self.state.read().await.outbox.values().cloned().collect()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn current_version(state: &StoreSnapshot, key: &DocKey) -> u64 {
    match key {
        DocKey::Member(id) => state.members.get(id).map(|d| d.version).unwrap_or(0),
        DocKey::Code(code) => state.referral_codes.get(code).map(|d| d.version).unwrap_or(0),
    }
}

fn points_at(member: &Member, code: &str) -> bool {
    member.referred_by.as_deref() == Some(code) || member.provisional_ref.as_deref() == Some(code)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn member(&self, id: &str) -> Result<Option<Versioned<Member>>> {
        Ok(self.state.read().await.members.get(id).cloned())
    }

    async fn code(&self, code: &str) -> Result<Option<Versioned<ReferralCodeRecord>>> {
        Ok(self.state.read().await.referral_codes.get(code).cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.write().await;

        if self.take_injected_conflict() {
            let document = batch
                .preconditions
                .first()
                .map(|(key, _)| key.to_string())
                .unwrap_or_else(|| "batch".to_string());
            return Err(EngineError::Conflict { document });
        }

        for (key, expected) in &batch.preconditions {
            if current_version(&state, key) != *expected {
                return Err(EngineError::Conflict {
                    document: key.to_string(),
                });
            }
        }

        for member in batch.members {
            let version = state
                .members
                .get(&member.id)
                .map(|d| d.version + 1)
                .unwrap_or(1);
            state.members.insert(
                member.id.clone(),
                Versioned {
                    version,
                    value: member,
                },
            );
        }

        for record in batch.codes {
            let version = state
                .referral_codes
                .get(&record.code)
                .map(|d| d.version + 1)
                .unwrap_or(1);
            state.referral_codes.insert(
                record.code.clone(),
                Versioned {
                    version,
                    value: record,
                },
            );
        }

        state.promotion_audit.extend(batch.audits);
        for task in batch.outbox {
            state.outbox.insert(task.id.clone(), task);
        }

        Ok(())
    }

    async fn create_code_if_absent(&self, record: ReferralCodeRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.referral_codes.contains_key(&record.code) {
            return Ok(false);
        }
        state.referral_codes.insert(
            record.code.clone(),
            Versioned {
                version: 1,
                value: record,
            },
        );
        Ok(true)
    }

    async fn count_direct_referrals(&self, code: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|d| d.value.referred_by.as_deref() == Some(code))
            .count() as u64)
    }

    async fn count_team_members(&self, code: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|d| d.value.referral_chain.iter().any(|c| c == code))
            .count() as u64)
    }

    async fn direct_referral_codes(&self, code: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|d| d.value.referred_by.as_deref() == Some(code))
            .filter_map(|d| d.value.referral_code.clone())
            .collect())
    }

    async fn scan_members(
        &self,
        filter: MemberFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Member>> {
        let state = self.state.read().await;
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(state
            .members
            .range((lower, Bound::Unbounded))
            .map(|(_, d)| &d.value)
            .filter(|m| filter.matches(m))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_members_with_fingerprint(&self, fingerprint: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|d| d.value.device_fingerprint.as_deref() == Some(fingerprint))
            .count() as u64)
    }

    async fn count_referrals_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|d| points_at(&d.value, code) && d.value.created_at >= since)
            .count() as u64)
    }

    async fn referral_payment_counts(&self, code: &str) -> Result<ReferralPaymentCounts> {
        let state = self.state.read().await;
        let mut counts = ReferralPaymentCounts::default();
        for doc in state.members.values().filter(|d| points_at(&d.value, code)) {
            counts.total += 1;
            if !doc.value.membership_paid {
                counts.unpaid += 1;
            }
        }
        Ok(counts)
    }

    async fn promotion_audit(&self, member_id: &str) -> Result<Vec<PromotionAuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .promotion_audit
            .iter()
            .filter(|e| e.member_id == member_id)
            .cloned()
            .collect())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxTask>> {
        let state = self.state.read().await;
        let mut pending: Vec<OutboxTask> = state
            .outbox
            .values()
            .filter(|t| t.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_outbox(&self, task: OutboxTask) -> Result<()> {
        let mut state = self.state.write().await;
        state.outbox.insert(task.id.clone(), task);
        Ok(())
    }

    async fn append_analytics_event(&self, event: AnalyticsEvent) -> Result<()> {
        self.state.write().await.analytics_events.push(event);
        Ok(())
    }

    async fn append_suspicious_activity(&self, record: SuspiciousActivity) -> Result<()> {
        self.state.write().await.suspicious_activity.push(record);
        Ok(())
    }
}
