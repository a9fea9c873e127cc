//! Two-phase chain binding: `UNASSIGNED → PROVISIONAL → BOUND`, with a
//! direct shortcut when registration already carries a usable code.
//!
//! Binding is one transaction covering the member, its referrer, every
//! ancestor in the referrer's chain and the code record. Promotion
//! re-evaluation and other effects happen after commit, driven by the
//! `touched` list in [`BindOutcome::Bound`].

use crate::config::toml_config::EngineConfig;
use crate::core::code_registry::CodeRegistry;
use crate::core::transaction::{run_transaction, Transaction};
use crate::domain::model::{AnalyticsEvent, Member, MemberId, OutboxPayload};
use crate::domain::ports::{ConfigProvider, DocumentStore, MemberFilter};
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionalOutcome {
    /// Already bound, already provisional, or the root itself.
    AlreadyAssigned,
    /// No usable code was supplied; parked under the fallback root.
    Fallback { code: String },
    /// Valid user-supplied code whose owner is not bound yet.
    Pending { code: String },
    /// Valid code with a bound owner; bind immediately with `bind_direct`.
    Direct { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BindOutcome {
    Bound {
        referrer_code: String,
        chain: Vec<String>,
        /// Referrer first, then the remaining ancestors; all had counters bumped.
        touched: Vec<MemberId>,
    },
    AlreadyBound,
    /// A direct code was supplied but the member already waits on another reference.
    AlreadyAssigned { provisional_ref: String },
    AwaitingPayment,
    NothingToBind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub scanned: usize,
    pub migrated: usize,
    pub errors: usize,
}

pub struct ChainBinder<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    codes: Arc<CodeRegistry<S>>,
    config: Arc<dyn ConfigProvider>,
    max_depth: usize,
    page_size: usize,
    tx_retry: RetryConfig,
}

impl<S: DocumentStore + ?Sized> ChainBinder<S> {
    pub fn new(
        store: Arc<S>,
        codes: Arc<CodeRegistry<S>>,
        provider: Arc<dyn ConfigProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            codes,
            config: provider,
            max_depth: config.referral.max_chain_depth,
            page_size: config.referral.page_size,
            tx_retry: config.transactions.retry_config(),
        }
    }

    /// Phase 1. Never overwrites an existing parent or provisional reference.
    pub async fn assign_provisional(
        &self,
        member_id: &str,
        supplied_code: Option<&str>,
    ) -> Result<ProvisionalOutcome> {
        let supplied = match supplied_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) if self.codes.is_resolvable(code) => Some(code),
            Some(code) => {
                tracing::info!("Malformed referral code '{}' supplied by {}, using fallback", code, member_id);
                None
            }
            None => None,
        };

        let outcome = run_transaction(&self.store, &self.tx_retry, "assign_provisional", move |mut tx| async move {
            let mut member = tx.require_member(member_id).await?;
            if member.is_bound() || member.provisional_ref.is_some() || member.is_root() {
                return Ok((tx, ProvisionalOutcome::AlreadyAssigned));
            }

            if let Some(code) = supplied {
                match self.supplied_owner(&mut tx, &member, code).await? {
                    Some(owner) if owner.can_refer() => {
                        return Ok((tx, ProvisionalOutcome::Direct { code: code.to_string() }));
                    }
                    Some(_) => {
                        member.provisional_ref = Some(code.to_string());
                        member.assigned_by_system = false;
                        tx.put_member(member).await?;
                        return Ok((tx, ProvisionalOutcome::Pending { code: code.to_string() }));
                    }
                    None => {}
                }
            }

            let root_code = self.verified_root_code(&mut tx).await?;
            member.provisional_ref = Some(root_code.clone());
            member.assigned_by_system = true;
            tx.put_member(member).await?;
            Ok((tx, ProvisionalOutcome::Fallback { code: root_code }))
        })
        .await?;

        match &outcome {
            ProvisionalOutcome::Fallback { code } => {
                tracing::info!("🧭 {} parked under fallback root {}", member_id, code)
            }
            ProvisionalOutcome::Pending { code } => {
                tracing::info!("⏳ {} waiting on referrer {} to be bound", member_id, code)
            }
            _ => tracing::debug!("assign_provisional({}) -> {:?}", member_id, outcome),
        }

        Ok(outcome)
    }

    /// Owner of a supplied code, or `None` when the code cannot be used
    /// (unknown, inactive, orphaned index entry, or the member's own code).
    async fn supplied_owner(
        &self,
        tx: &mut Transaction<S>,
        member: &Member,
        code: &str,
    ) -> Result<Option<Member>> {
        let record = match tx.code(code).await? {
            Some(record) if record.active => record,
            _ => {
                tracing::info!("Referral code {} is unknown or inactive, using fallback", code);
                return Ok(None);
            }
        };
        if record.owner_id == member.id {
            return Ok(None);
        }
        tx.member(&record.owner_id).await
    }

    /// The fallback root must resolve to an active code owned by the root member.
    async fn verified_root_code(&self, tx: &mut Transaction<S>) -> Result<String> {
        let root_code = self.config.fallback_root_code().to_string();
        let record = tx
            .code(&root_code)
            .await?
            .filter(|r| r.active)
            .ok_or_else(|| EngineError::ConfigError {
                message: format!("Fallback root code {} is missing or inactive", root_code),
            })?;
        match tx.member(&record.owner_id).await? {
            Some(root) if root.is_root() => Ok(root_code),
            _ => Err(EngineError::ConfigError {
                message: format!("Fallback root code {} is not owned by the admin root", root_code),
            }),
        }
    }

    /// Phase 2 for a provisional reference; requires the membership to be paid.
    pub async fn bind(&self, member_id: &str) -> Result<BindOutcome> {
        self.bind_with(member_id, None).await
    }

    /// Phase 2 straight from a supplied code (the `DIRECT` shortcut).
    pub async fn bind_direct(&self, member_id: &str, code: &str) -> Result<BindOutcome> {
        self.bind_with(member_id, Some(code)).await
    }

    async fn bind_with(&self, member_id: &str, direct_code: Option<&str>) -> Result<BindOutcome> {
        let outcome = run_transaction(&self.store, &self.tx_retry, "bind", move |mut tx| async move {
            let outcome = self.bind_in(&mut tx, member_id, direct_code).await?;
            Ok((tx, outcome))
        })
        .await?;

        match &outcome {
            BindOutcome::Bound {
                referrer_code,
                chain,
                ..
            } => tracing::info!(
                "🔗 {} bound under {} (depth {})",
                member_id,
                referrer_code,
                chain.len()
            ),
            other => tracing::debug!("bind({}) -> {:?}", member_id, other),
        }

        Ok(outcome)
    }

    async fn bind_in(
        &self,
        tx: &mut Transaction<S>,
        member_id: &str,
        direct_code: Option<&str>,
    ) -> Result<BindOutcome> {
        let mut member = tx.require_member(member_id).await?;
        if member.is_bound() {
            return Ok(BindOutcome::AlreadyBound);
        }
        if member.is_root() {
            return Ok(BindOutcome::NothingToBind);
        }

        // DIRECT 只適用於尚未有暫定上線的會員
        let (code, via_provisional) = match (direct_code, member.provisional_ref.clone()) {
            (Some(code), Some(existing)) if existing != code => {
                return Ok(BindOutcome::AlreadyAssigned {
                    provisional_ref: existing,
                })
            }
            (Some(code), None) => (code.to_string(), false),
            (_, Some(code)) => {
                if !member.membership_paid {
                    return Ok(BindOutcome::AwaitingPayment);
                }
                (code, true)
            }
            (None, None) => return Ok(BindOutcome::NothingToBind),
        };

        if !self.codes.is_resolvable(&code) {
            return Err(EngineError::InvalidCodeFormat { code });
        }

        let mut record = match tx.code(&code).await? {
            Some(record) if record.active => record,
            Some(_) => {
                return Err(EngineError::InvalidReferrerCode {
                    code,
                    reason: "code is inactive".to_string(),
                })
            }
            None => {
                return Err(EngineError::InvalidReferrerCode {
                    code,
                    reason: "code does not exist".to_string(),
                })
            }
        };

        let mut referrer = tx
            .member(&record.owner_id)
            .await?
            .ok_or_else(|| EngineError::ReferrerNotFound {
                code: code.clone(),
                owner_id: record.owner_id.clone(),
            })?;

        // 禁止自我推薦，也禁止綁定到自己的下線
        let own_code_in_chain = member
            .referral_code
            .as_ref()
            .map(|own| *own == code || referrer.referral_chain.contains(own))
            .unwrap_or(false);
        if referrer.id == member.id || own_code_in_chain {
            return Err(EngineError::CycleDetected {
                member_id: member.id.clone(),
                code,
            });
        }

        if !referrer.can_refer() {
            return Err(EngineError::ReferrerNotBound { code });
        }

        let mut chain = referrer.referral_chain.clone();
        chain.push(code.clone());
        if chain.len() > self.max_depth {
            return Err(EngineError::ChainTooDeep {
                depth: chain.len(),
                max_depth: self.max_depth,
            });
        }

        if !via_provisional {
            member.assigned_by_system = false;
        }
        member.referred_by = Some(code.clone());
        member.referral_chain = chain.clone();
        member.provisional_ref = None;
        member.bound_at = Some(Utc::now());
        let assigned_by_system = member.assigned_by_system;
        tx.put_member(member).await?;

        let ancestors = referrer.referral_chain.clone();
        referrer.direct_referral_count += 1;
        referrer.team_size += 1;
        let mut touched = vec![referrer.id.clone()];
        tx.put_member(referrer).await?;

        for ancestor_code in &ancestors {
            let owner_id = match tx.code(ancestor_code).await? {
                Some(r) => r.owner_id,
                None => {
                    tracing::warn!(
                        "⚠️ Ancestor code {} has no index entry; team size left for reconciliation",
                        ancestor_code
                    );
                    continue;
                }
            };
            match tx.member(&owner_id).await? {
                Some(mut ancestor) => {
                    ancestor.team_size += 1;
                    touched.push(ancestor.id.clone());
                    tx.put_member(ancestor).await?;
                }
                None => tracing::warn!("⚠️ Ancestor {} missing; team size left for reconciliation", owner_id),
            }
        }

        record.conversions += 1;
        tx.put_code(record).await?;

        let mut properties = serde_json::Map::new();
        properties.insert("referrerCode".to_string(), code.clone().into());
        properties.insert("depth".to_string(), (chain.len() as u64).into());
        properties.insert(
            "via".to_string(),
            if via_provisional { "provisional" } else { "direct" }.into(),
        );
        properties.insert("assignedBySystem".to_string(), assigned_by_system.into());
        tx.enqueue(OutboxPayload::Analytics(AnalyticsEvent {
            name: "referral_bound".to_string(),
            member_id: member_id.to_string(),
            properties,
            occurred_at: Utc::now(),
        }));

        Ok(BindOutcome::Bound {
            referrer_code: code,
            chain,
            touched,
        })
    }

    /// Sweep active members with no parent and no provisional reference.
    ///
    /// Each one gets Phase 1 (fallback root) then Phase 2. Individual failures
    /// are logged and counted; the sweep keeps going and can be rerun.
    pub async fn migrate_orphans(&self) -> Result<(MigrationReport, Vec<(MemberId, BindOutcome)>)> {
        let mut report = MigrationReport::default();
        let mut outcomes = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .scan_members(MemberFilter::ActiveOrphans, cursor.as_deref(), self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|m| m.id.clone());

            for member in &page {
                report.scanned += 1;
                match self.migrate_one(&member.id).await {
                    Ok(outcome @ BindOutcome::Bound { .. }) => {
                        report.migrated += 1;
                        outcomes.push((member.id.clone(), outcome));
                    }
                    Ok(other) => {
                        tracing::debug!("Orphan {} not migrated: {:?}", member.id, other);
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!("❌ Failed to migrate orphan {}: {}", member.id, e);
                    }
                }
            }
        }

        tracing::info!(
            "🧹 Orphan sweep finished: scanned={}, migrated={}, errors={}",
            report.scanned,
            report.migrated,
            report.errors
        );
        Ok((report, outcomes))
    }

    async fn migrate_one(&self, member_id: &str) -> Result<BindOutcome> {
        match self.assign_provisional(member_id, None).await? {
            ProvisionalOutcome::Direct { code } => self.bind_direct(member_id, &code).await,
            _ => self.bind(member_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::domain::model::{MemberStatus, ReferralCodeRecord, ADMIN_ROLE};

    struct Fixture {
        store: Arc<MemoryStore>,
        binder: ChainBinder<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryStore::new());

        let mut root = Member::new("admin", ADMIN_ROLE);
        root.referral_code = Some("ROOT1".to_string());
        root.status = MemberStatus::Active;
        store.insert_member(root).await;
        store
            .create_code_if_absent(ReferralCodeRecord::new("ROOT1", "admin"))
            .await
            .unwrap();

        let codes = Arc::new(CodeRegistry::new(store.clone(), &config));
        let binder = ChainBinder::new(store.clone(), codes, Arc::new(config.clone()), &config);
        Fixture { store, binder }
    }

    async fn add_member(store: &MemoryStore, id: &str, code: &str, paid: bool) {
        let mut member = Member::new(id, "member");
        member.referral_code = Some(code.to_string());
        member.membership_paid = paid;
        if paid {
            member.status = MemberStatus::Active;
        }
        store.insert_member(member).await;
        store
            .create_code_if_absent(ReferralCodeRecord::new(code, id))
            .await
            .unwrap();
    }

    async fn member(store: &MemoryStore, id: &str) -> Member {
        store.member(id).await.unwrap().unwrap().value
    }

    #[tokio::test]
    async fn test_orphan_is_parked_under_root_until_paid() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", false).await;

        let outcome = f.binder.assign_provisional("a", None).await.unwrap();
        assert_eq!(outcome, ProvisionalOutcome::Fallback { code: "ROOT1".to_string() });

        let a = member(&f.store, "a").await;
        assert_eq!(a.provisional_ref.as_deref(), Some("ROOT1"));
        assert!(a.assigned_by_system);
        assert_eq!(a.status, MemberStatus::PendingPayment);

        assert_eq!(f.binder.bind("a").await.unwrap(), BindOutcome::AwaitingPayment);
        assert!(member(&f.store, "a").await.referred_by.is_none());
    }

    #[tokio::test]
    async fn test_assign_provisional_is_idempotent() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", false).await;

        f.binder.assign_provisional("a", None).await.unwrap();
        let again = f.binder.assign_provisional("a", Some("RFBBBBB2")).await.unwrap();
        assert_eq!(again, ProvisionalOutcome::AlreadyAssigned);
        assert_eq!(member(&f.store, "a").await.provisional_ref.as_deref(), Some("ROOT1"));
    }

    #[tokio::test]
    async fn test_unknown_or_malformed_code_falls_back() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", false).await;
        add_member(&f.store, "b", "RFBBBBB2", false).await;

        let a = f.binder.assign_provisional("a", Some("RFZZZZZ9")).await.unwrap();
        assert!(matches!(a, ProvisionalOutcome::Fallback { .. }));
        let b = f.binder.assign_provisional("b", Some("not a code")).await.unwrap();
        assert!(matches!(b, ProvisionalOutcome::Fallback { .. }));
    }

    #[tokio::test]
    async fn test_code_of_unbound_owner_stays_user_supplied() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", false).await;
        add_member(&f.store, "b", "RFBBBBB2", false).await;

        let outcome = f.binder.assign_provisional("b", Some("RFAAAAA2")).await.unwrap();
        assert_eq!(outcome, ProvisionalOutcome::Pending { code: "RFAAAAA2".to_string() });
        assert!(!member(&f.store, "b").await.assigned_by_system);
    }

    #[tokio::test]
    async fn test_bind_cascades_counters_up_the_chain() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        add_member(&f.store, "b", "RFBBBBB2", true).await;

        f.binder.bind_direct("a", "ROOT1").await.unwrap();
        let outcome = f.binder.bind_direct("b", "RFAAAAA2").await.unwrap();

        match outcome {
            BindOutcome::Bound { chain, touched, .. } => {
                assert_eq!(chain, vec!["ROOT1".to_string(), "RFAAAAA2".to_string()]);
                assert_eq!(touched, vec!["a".to_string(), "admin".to_string()]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let root = member(&f.store, "admin").await;
        assert_eq!(root.direct_referral_count, 1);
        assert_eq!(root.team_size, 2);
        let a = member(&f.store, "a").await;
        assert_eq!(a.direct_referral_count, 1);
        assert_eq!(a.team_size, 1);
        assert_eq!(f.store.code("RFAAAAA2").await.unwrap().unwrap().value.conversions, 1);
    }

    #[tokio::test]
    async fn test_bind_twice_does_not_double_count() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        f.binder.assign_provisional("a", None).await.unwrap();

        assert!(matches!(f.binder.bind("a").await.unwrap(), BindOutcome::Bound { .. }));
        let after_first = f.store.snapshot().await;
        assert_eq!(f.binder.bind("a").await.unwrap(), BindOutcome::AlreadyBound);
        let after_second = f.store.snapshot().await;

        assert_eq!(after_first.members, after_second.members);
        assert_eq!(member(&f.store, "admin").await.team_size, 1);
    }

    #[tokio::test]
    async fn test_bind_rejects_inactive_code_and_cycles() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        add_member(&f.store, "b", "RFBBBBB2", true).await;
        f.binder.bind_direct("a", "ROOT1").await.unwrap();
        f.binder.bind_direct("b", "RFAAAAA2").await.unwrap();

        // a 已經綁定，不會再被綁到自己的下線
        let mut a = member(&f.store, "a").await;
        a.referred_by = None;
        a.referral_chain.clear();
        f.store.insert_member(a).await;
        let err = f.binder.bind_direct("a", "RFBBBBB2").await.unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        add_member(&f.store, "c", "RFCCCCC2", true).await;
        let mut record = f.store.code("RFBBBBB2").await.unwrap().unwrap().value;
        record.active = false;
        f.store
            .commit(crate::domain::ports::WriteBatch {
                codes: vec![record],
                ..Default::default()
            })
            .await
            .unwrap();
        let err = f.binder.bind_direct("c", "RFBBBBB2").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidReferrerCode { .. }));
        assert!(member(&f.store, "c").await.referred_by.is_none());
    }

    #[tokio::test]
    async fn test_direct_code_cannot_override_provisional_reference() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        add_member(&f.store, "b", "RFBBBBB2", false).await;
        f.binder.bind_direct("a", "ROOT1").await.unwrap();
        f.binder.assign_provisional("b", None).await.unwrap();

        let outcome = f.binder.bind_direct("b", "RFAAAAA2").await.unwrap();
        assert_eq!(
            outcome,
            BindOutcome::AlreadyAssigned {
                provisional_ref: "ROOT1".to_string()
            }
        );
        // 同一個代碼仍然要等付款
        assert_eq!(f.binder.bind_direct("b", "ROOT1").await.unwrap(), BindOutcome::AwaitingPayment);

        let b = member(&f.store, "b").await;
        assert!(b.referred_by.is_none());
        assert_eq!(b.provisional_ref.as_deref(), Some("ROOT1"));
        assert!(b.assigned_by_system);
        assert_eq!(member(&f.store, "a").await.team_size, 0);
    }

    #[tokio::test]
    async fn test_direct_bind_is_user_chosen() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        let mut b = Member::new("b", "member");
        b.assigned_by_system = true;
        f.store.insert_member(b).await;

        f.binder.bind_direct("a", "ROOT1").await.unwrap();
        f.binder.bind_direct("b", "RFAAAAA2").await.unwrap();
        assert!(!member(&f.store, "b").await.assigned_by_system);
    }

    #[tokio::test]
    async fn test_missing_owner_is_referrer_not_found() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        f.store
            .create_code_if_absent(ReferralCodeRecord::new("RFGHXST2", "ghost"))
            .await
            .unwrap();

        let err = f.binder.bind_direct("a", "RFGHXST2").await.unwrap_err();
        assert!(matches!(err, EngineError::ReferrerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_chain_depth_is_capped() {
        let f = fixture().await;
        let mut parent = "ROOT1".to_string();
        for i in 0..10 {
            let id = format!("m{:02}", i);
            let code = format!("RFDEEP{}2", ["A", "B", "C", "D", "E", "F", "G", "H", "J", "K"][i]);
            add_member(&f.store, &id, &code, true).await;
            f.binder.bind_direct(&id, &parent).await.unwrap();
            parent = code;
        }

        add_member(&f.store, "too-deep", "RFDEEPZ2", true).await;
        let err = f.binder.bind_direct("too-deep", &parent).await.unwrap_err();
        assert!(matches!(err, EngineError::ChainTooDeep { depth: 11, max_depth: 10 }));
    }

    #[tokio::test]
    async fn test_missing_fallback_root_is_config_error() {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryStore::new());
        let codes = Arc::new(CodeRegistry::new(store.clone(), &config));
        let binder = ChainBinder::new(store.clone(), codes, Arc::new(config.clone()), &config);
        store.insert_member(Member::new("a", "member")).await;

        let err = binder.assign_provisional("a", None).await.unwrap_err();
        assert_eq!(err.kind(), crate::utils::error::ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn test_migrate_orphans_is_rerunnable() {
        let f = fixture().await;
        add_member(&f.store, "a", "RFAAAAA2", true).await;
        add_member(&f.store, "b", "RFBBBBB2", true).await;
        // 未付款的會員不在掃描範圍
        add_member(&f.store, "c", "RFCCCCC2", false).await;

        let (first, outcomes) = f.binder.migrate_orphans().await.unwrap();
        assert_eq!(first, MigrationReport { scanned: 2, migrated: 2, errors: 0 });
        assert_eq!(outcomes.len(), 2);

        let (second, _) = f.binder.migrate_orphans().await.unwrap();
        assert_eq!(second, MigrationReport::default());
        assert_eq!(member(&f.store, "admin").await.direct_referral_count, 2);
    }
}
