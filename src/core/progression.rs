//! Role ladder and promotion decisions.
//!
//! A member is promoted straight to the highest tier whose thresholds it
//! meets on both gates. Roles never go down, the admin root is never
//! evaluated, and a promotion that fails a side check (inactive member,
//! missing location) is recorded as a blocked audit entry instead of an
//! error.

use crate::config::toml_config::{EngineConfig, ProgressionConfig};
use crate::core::transaction::run_transaction;
use crate::domain::model::{
    AnalyticsEvent, AuditOutcome, MemberId, MemberStatus, Notification, NotificationKind,
    OutboxPayload, PromotionAuditEntry, PromotionRecord, StatsSnapshot, ADMIN_ROLE,
};
use crate::domain::ports::DocumentStore;
use crate::utils::error::Result;
use crate::utils::retry::RetryConfig;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub level: u32,
    pub name: String,
    pub direct_required: u64,
    pub team_required: u64,
    pub requires_location: bool,
}

impl Tier {
    pub fn is_met_by(&self, stats: StatsSnapshot) -> bool {
        stats.direct_referrals >= self.direct_required && stats.team_size >= self.team_required
    }
}

#[derive(Debug, Clone)]
pub struct Ladder {
    base_role: String,
    tiers: Vec<Tier>,
}

impl Ladder {
    pub fn from_config(config: &ProgressionConfig) -> Self {
        let tiers = config
            .tiers
            .iter()
            .enumerate()
            .map(|(i, t)| Tier {
                level: i as u32 + 1,
                name: t.name.clone(),
                direct_required: t.direct_required,
                team_required: t.team_required,
                requires_location: t.requires_location,
            })
            .collect();
        Self {
            base_role: config.base_role.clone(),
            tiers,
        }
    }

    pub fn base_role(&self) -> &str {
        &self.base_role
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Level of a ladder role; `None` for the admin role and unknown names.
    pub fn level_of(&self, role: &str) -> Option<u32> {
        if role == self.base_role {
            return Some(0);
        }
        self.tiers.iter().find(|t| t.name == role).map(|t| t.level)
    }

    pub fn highest_eligible(&self, stats: StatsSnapshot) -> Option<&Tier> {
        self.tiers.iter().rev().find(|t| t.is_met_by(stats))
    }

    pub fn next_tier(&self, level: u32) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.level > level)
    }

    /// Progress toward the next tier; overall progress is the smaller ratio.
    pub fn progress(&self, level: u32, stats: StatsSnapshot) -> TierProgress {
        match self.next_tier(level) {
            Some(next) => {
                let direct_ratio = ratio(stats.direct_referrals, next.direct_required);
                let team_ratio = ratio(stats.team_size, next.team_required);
                TierProgress {
                    next_role: Some(next.name.clone()),
                    direct_ratio,
                    team_ratio,
                    overall: direct_ratio.min(team_ratio),
                }
            }
            None => TierProgress {
                next_role: None,
                direct_ratio: 1.0,
                team_ratio: 1.0,
                overall: 1.0,
            },
        }
    }
}

fn ratio(value: u64, required: u64) -> f64 {
    if required == 0 {
        return 1.0;
    }
    (value as f64 / required as f64).min(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierProgress {
    pub next_role: Option<String>,
    pub direct_ratio: f64,
    pub team_ratio: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionResult {
    pub member_id: MemberId,
    pub promoted: bool,
    pub previous_role: String,
    pub current_role: String,
    pub direct_referrals: u64,
    pub team_size: u64,
    /// Set when an eligible promotion failed a side check.
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPromotionReport {
    pub results: Vec<PromotionResult>,
    pub failures: Vec<(MemberId, String)>,
}

impl BatchPromotionReport {
    pub fn promoted(&self) -> usize {
        self.results.iter().filter(|r| r.promoted).count()
    }
}

pub struct ProgressionEngine<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    ladder: Ladder,
    tx_retry: RetryConfig,
}

impl<S: DocumentStore + ?Sized> ProgressionEngine<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            ladder: Ladder::from_config(&config.progression),
            tx_retry: config.transactions.retry_config(),
        }
    }

    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    /// Evaluate and, when eligible, promote. Stats are read inside the same
    /// transaction that writes the role, so a concurrent decrement cannot
    /// slip in between.
    pub async fn check_and_promote(&self, member_id: &str) -> Result<PromotionResult> {
        let result = run_transaction(&self.store, &self.tx_retry, "check_and_promote", move |mut tx| async move {
            let mut member = tx.require_member(member_id).await?;
            let stats = member.stats_snapshot();
            let mut result = PromotionResult {
                member_id: member.id.clone(),
                promoted: false,
                previous_role: member.role.clone(),
                current_role: member.role.clone(),
                direct_referrals: stats.direct_referrals,
                team_size: stats.team_size,
                blocked_reason: None,
            };

            if member.role == ADMIN_ROLE {
                return Ok((tx, result));
            }

            let current_level = self.ladder.level_of(&member.role).unwrap_or(member.role_level);
            let target = match self.ladder.highest_eligible(stats) {
                Some(tier) if tier.level > current_level => tier.clone(),
                _ => return Ok((tx, result)),
            };

            let blocked_reason = if member.status != MemberStatus::Active {
                Some("member is not active".to_string())
            } else if target.requires_location
                && member.location.as_deref().map_or(true, |l| l.trim().is_empty())
            {
                Some(format!("location is required for {}", target.name))
            } else {
                None
            };

            let now = Utc::now();
            let mut audit = PromotionAuditEntry {
                id: uuid::Uuid::new_v4().to_string(),
                member_id: member.id.clone(),
                from_role: member.role.clone(),
                to_role: target.name.clone(),
                from_level: current_level,
                to_level: target.level,
                stats,
                outcome: AuditOutcome::Promoted,
                recorded_at: now,
            };

            if let Some(reason) = blocked_reason {
                audit.outcome = AuditOutcome::Blocked {
                    reason: reason.clone(),
                };
                // 同一個阻擋原因只記錄一次，直到結果改變
                let latest = self.store.promotion_audit(&member.id).await?.pop();
                let repeated = latest.is_some_and(|prev| {
                    prev.from_role == audit.from_role
                        && prev.to_role == audit.to_role
                        && prev.outcome == audit.outcome
                });
                if !repeated {
                    tx.append_audit(audit);
                }
                result.blocked_reason = Some(reason);
                return Ok((tx, result));
            }

            member.role_promotion_history.push(PromotionRecord {
                from: member.role.clone(),
                to: target.name.clone(),
                from_level: current_level,
                to_level: target.level,
                stats,
                promoted_at: now,
            });
            member.role = target.name.clone();
            member.role_level = target.level;
            tx.put_member(member).await?;
            tx.append_audit(audit);

            tx.enqueue(OutboxPayload::Notification(Notification {
                member_id: member_id.to_string(),
                kind: NotificationKind::RolePromoted {
                    from: result.previous_role.clone(),
                    to: target.name.clone(),
                },
            }));
            let mut properties = serde_json::Map::new();
            properties.insert("from".to_string(), result.previous_role.clone().into());
            properties.insert("to".to_string(), target.name.clone().into());
            properties.insert("level".to_string(), target.level.into());
            tx.enqueue(OutboxPayload::Analytics(AnalyticsEvent {
                name: "role_promoted".to_string(),
                member_id: member_id.to_string(),
                properties,
                occurred_at: now,
            }));

            result.promoted = true;
            result.current_role = target.name;
            Ok((tx, result))
        })
        .await?;

        if result.promoted {
            tracing::info!(
                "🎖️ {} promoted {} -> {} (direct={}, team={})",
                member_id,
                result.previous_role,
                result.current_role,
                result.direct_referrals,
                result.team_size
            );
        } else if let Some(reason) = &result.blocked_reason {
            tracing::warn!("⚠️ Promotion of {} blocked: {}", member_id, reason);
        }

        Ok(result)
    }

    pub async fn check_and_promote_batch(&self, member_ids: &[MemberId]) -> BatchPromotionReport {
        let mut report = BatchPromotionReport::default();
        for id in member_ids {
            match self.check_and_promote(id).await {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    tracing::error!("❌ Promotion check failed for {}: {}", id, e);
                    report.failures.push((id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Progress of a stored member toward its next tier.
    pub async fn member_progress(&self, member_id: &str) -> Result<TierProgress> {
        let member = self
            .store
            .member(member_id)
            .await?
            .ok_or_else(|| crate::utils::error::EngineError::MemberNotFound {
                member_id: member_id.to_string(),
            })?
            .value;
        let level = self.ladder.level_of(&member.role).unwrap_or(member.role_level);
        Ok(self.ladder.progress(level, member.stats_snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::domain::model::Member;

    fn snapshot(direct: u64, team: u64) -> StatsSnapshot {
        StatsSnapshot {
            direct_referrals: direct,
            team_size: team,
        }
    }

    async fn active_member(store: &MemoryStore, id: &str, direct: u64, team: u64) {
        let mut member = Member::new(id, "member");
        member.status = MemberStatus::Active;
        member.membership_paid = true;
        member.direct_referral_count = direct;
        member.team_size = team;
        store.insert_member(member).await;
    }

    fn engine(store: Arc<MemoryStore>) -> ProgressionEngine<MemoryStore> {
        ProgressionEngine::new(store, &EngineConfig::default())
    }

    #[test]
    fn test_eligibility_requires_both_gates() {
        let ladder = Ladder::from_config(&ProgressionConfig::default());
        assert!(ladder.highest_eligible(snapshot(100, 4)).is_none());
        assert!(ladder.highest_eligible(snapshot(1, 1000)).is_none());
        assert_eq!(ladder.highest_eligible(snapshot(2, 5)).unwrap().name, "promoter");
        assert_eq!(ladder.highest_eligible(snapshot(12, 60)).unwrap().name, "manager");
    }

    #[test]
    fn test_progress_is_minimum_of_ratios() {
        let ladder = Ladder::from_config(&ProgressionConfig::default());
        let progress = ladder.progress(0, snapshot(2, 1));
        assert_eq!(progress.next_role.as_deref(), Some("promoter"));
        assert_eq!(progress.direct_ratio, 1.0);
        assert!((progress.team_ratio - 0.2).abs() < f64::EPSILON);
        assert!((progress.overall - 0.2).abs() < f64::EPSILON);

        let top = ladder.progress(5, snapshot(0, 0));
        assert!(top.next_role.is_none());
        assert_eq!(top.overall, 1.0);
        assert_eq!(ladder.level_of(ADMIN_ROLE), None);
    }

    #[tokio::test]
    async fn test_direct_jump_to_highest_tier() {
        let store = Arc::new(MemoryStore::new());
        active_member(&store, "m1", 12, 60).await;

        let result = engine(store.clone()).check_and_promote("m1").await.unwrap();
        assert!(result.promoted);
        assert_eq!(result.previous_role, "member");
        assert_eq!(result.current_role, "manager");

        let member = store.member("m1").await.unwrap().unwrap().value;
        assert_eq!(member.role_level, 3);
        assert_eq!(member.role_promotion_history.len(), 1);
        assert_eq!(store.promotion_audit("m1").await.unwrap().len(), 1);

        let tasks = store.outbox_tasks().await;
        assert!(tasks.iter().any(|t| matches!(
            &t.payload,
            OutboxPayload::Notification(n) if n.member_id == "m1"
        )));
    }

    #[tokio::test]
    async fn test_never_demotes() {
        let store = Arc::new(MemoryStore::new());
        active_member(&store, "m1", 12, 60).await;
        let engine = engine(store.clone());
        engine.check_and_promote("m1").await.unwrap();

        let mut member = store.member("m1").await.unwrap().unwrap().value;
        member.direct_referral_count = 0;
        member.team_size = 0;
        store.insert_member(member).await;

        let result = engine.check_and_promote("m1").await.unwrap();
        assert!(!result.promoted);
        assert_eq!(result.current_role, "manager");
        assert_eq!(store.member("m1").await.unwrap().unwrap().value.role_level, 3);
    }

    #[tokio::test]
    async fn test_missing_location_blocks_with_audit() {
        let store = Arc::new(MemoryStore::new());
        active_member(&store, "m1", 20, 100).await;

        let result = engine(store.clone()).check_and_promote("m1").await.unwrap();
        assert!(!result.promoted);
        assert!(result.blocked_reason.unwrap().contains("director"));

        let audit = store.promotion_audit("m1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(matches!(audit[0].outcome, AuditOutcome::Blocked { .. }));
        assert_eq!(store.member("m1").await.unwrap().unwrap().value.role, "member");
        assert!(store.outbox_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_block_is_audited_once() {
        let store = Arc::new(MemoryStore::new());
        active_member(&store, "m1", 20, 100).await;
        let engine = engine(store.clone());

        for _ in 0..3 {
            let result = engine.check_and_promote("m1").await.unwrap();
            assert!(result.blocked_reason.is_some());
        }
        assert_eq!(store.promotion_audit("m1").await.unwrap().len(), 1);

        let mut member = store.member("m1").await.unwrap().unwrap().value;
        member.location = Some("Kaohsiung".to_string());
        store.insert_member(member).await;
        assert!(engine.check_and_promote("m1").await.unwrap().promoted);

        let audit = store.promotion_audit("m1").await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].outcome, AuditOutcome::Promoted);
    }

    #[tokio::test]
    async fn test_admin_and_inactive_members() {
        let store = Arc::new(MemoryStore::new());
        let mut admin = Member::new("admin", ADMIN_ROLE);
        admin.direct_referral_count = 100;
        admin.team_size = 1000;
        store.insert_member(admin).await;

        let mut pending = Member::new("p1", "member");
        pending.direct_referral_count = 2;
        pending.team_size = 5;
        store.insert_member(pending).await;

        let engine = engine(store.clone());
        let admin_result = engine.check_and_promote("admin").await.unwrap();
        assert!(!admin_result.promoted);
        assert_eq!(admin_result.current_role, ADMIN_ROLE);

        let pending_result = engine.check_and_promote("p1").await.unwrap();
        assert!(!pending_result.promoted);
        assert!(pending_result.blocked_reason.is_some());
    }

    #[tokio::test]
    async fn test_batch_collects_results_and_failures() {
        let store = Arc::new(MemoryStore::new());
        active_member(&store, "m1", 2, 5).await;
        active_member(&store, "m2", 0, 0).await;

        let ids: Vec<MemberId> = ["m1", "missing", "m2"].iter().map(|s| s.to_string()).collect();
        let report = engine(store).check_and_promote_batch(&ids).await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.promoted(), 1);
        assert_eq!(report.failures.len(), 1);
    }
}
