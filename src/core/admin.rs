//! Administrative maintenance jobs. Every job is paged and safe to rerun.

use crate::core::chain_binding::{BindOutcome, MigrationReport};
use crate::core::engine::ReferralEngine;
use crate::core::statistics::RecomputeReport;
use crate::domain::model::{Member, MemberId};
use crate::domain::ports::{DocumentStore, MemberFilter};
use crate::utils::error::{EngineError, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyMigrationReport {
    pub codes_issued: usize,
    pub bound: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainViolation {
    pub member_id: MemberId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainVerificationReport {
    pub scanned: usize,
    pub violations: Vec<ChainViolation>,
}

impl ChainVerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

impl<S: DocumentStore + ?Sized + 'static> ReferralEngine<S> {
    fn authorize(&self, actor_id: &str) -> Result<()> {
        if self.provider.is_admin(actor_id) {
            Ok(())
        } else {
            tracing::warn!("🚫 {} tried to run an admin job", actor_id);
            Err(EngineError::PermissionDenied {
                member_id: actor_id.to_string(),
            })
        }
    }

    /// Bind every active orphan under the fallback root.
    pub async fn fix_orphans(&self, actor_id: &str) -> Result<MigrationReport> {
        self.authorize(actor_id)?;
        self.migrate_orphans().await
    }

    pub async fn recompute_all_stats(&self, actor_id: &str) -> Result<RecomputeReport> {
        self.authorize(actor_id)?;
        let report = self.stats.recompute_all().await?;
        self.stats.cache().clear().await;
        for member_id in &report.drifted {
            self.promote_best_effort(member_id, "reconciliation").await;
        }
        Ok(report)
    }

    /// Issue codes to members that have none, then bind paid members still
    /// waiting in the provisional state.
    pub async fn migrate_legacy(&self, actor_id: &str) -> Result<LegacyMigrationReport> {
        self.authorize(actor_id)?;
        let mut report = LegacyMigrationReport::default();

        let missing = self.collect(MemberFilter::MissingCode).await?;
        for member in &missing {
            match self.codes.ensure_code(&member.id).await {
                Ok(code) => {
                    tracing::debug!("Issued {} to legacy member {}", code, member.id);
                    report.codes_issued += 1;
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("❌ Could not issue a code to {}: {}", member.id, e);
                }
            }
        }

        let waiting = self.collect(MemberFilter::PaidUnbound).await?;
        for member in &waiting {
            match self.bind(&member.id).await {
                Ok(BindOutcome::Bound { .. }) => report.bound += 1,
                Ok(other) => tracing::debug!("Legacy member {} not bound: {:?}", member.id, other),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("❌ Could not bind legacy member {}: {}", member.id, e);
                }
            }
        }

        tracing::info!(
            "🧰 Legacy migration: codes_issued={}, bound={}, errors={}",
            report.codes_issued,
            report.bound,
            report.errors
        );
        Ok(report)
    }

    /// Report members whose chain is not their parent's chain plus the parent code.
    pub async fn verify_chains(&self, actor_id: &str) -> Result<ChainVerificationReport> {
        self.authorize(actor_id)?;
        let mut report = ChainVerificationReport::default();
        let max_depth = self.config.referral.max_chain_depth;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .scan_members(MemberFilter::All, cursor.as_deref(), self.config.referral.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|m| m.id.clone());

            for member in &page {
                report.scanned += 1;
                if let Some(reason) = self.chain_violation(member, max_depth).await? {
                    report.violations.push(ChainViolation {
                        member_id: member.id.clone(),
                        reason,
                    });
                }
            }
        }

        if report.is_consistent() {
            tracing::info!("✅ Verified {} referral chains", report.scanned);
        } else {
            tracing::warn!(
                "⚠️ {} of {} referral chains are inconsistent",
                report.violations.len(),
                report.scanned
            );
        }
        Ok(report)
    }

    async fn chain_violation(&self, member: &Member, max_depth: usize) -> Result<Option<String>> {
        let parent_code = match &member.referred_by {
            Some(code) => code,
            None if member.referral_chain.is_empty() => return Ok(None),
            None => return Ok(Some("unbound member carries a chain".to_string())),
        };

        if member.referral_chain.len() > max_depth {
            return Ok(Some(format!(
                "chain depth {} exceeds {}",
                member.referral_chain.len(),
                max_depth
            )));
        }
        if member.referral_code.as_ref().is_some_and(|own| member.referral_chain.contains(own)) {
            return Ok(Some("chain contains the member's own code".to_string()));
        }

        let owner_id = match self.store.code(parent_code).await? {
            Some(doc) => doc.value.owner_id,
            None => return Ok(Some(format!("parent code {} is not indexed", parent_code))),
        };
        let parent = match self.store.member(&owner_id).await? {
            Some(doc) => doc.value,
            None => return Ok(Some(format!("parent {} does not exist", owner_id))),
        };

        let mut expected = parent.referral_chain;
        expected.push(parent_code.clone());
        if expected != member.referral_chain {
            return Ok(Some(format!(
                "chain {:?} does not match parent chain {:?}",
                member.referral_chain, expected
            )));
        }
        Ok(None)
    }

    async fn collect(&self, filter: MemberFilter) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .scan_members(filter, cursor.as_deref(), self.config.referral.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|m| m.id.clone());
            members.extend(page);
        }
        Ok(members)
    }
}
