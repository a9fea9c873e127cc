use crate::config::toml_config::{EngineConfig, FraudConfig};
use crate::domain::model::{FraudSignalKind, SuspiciousActivity};
use crate::domain::ports::DocumentStore;
use crate::utils::error::{EngineError, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

const DEVICE_REUSE_SCORE: u32 = 40;
const REFERRAL_RATE_SCORE: u32 = 30;
const REFERRAL_PATTERN_SCORE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAssessment {
    pub is_fraudulent: bool,
    /// 0 到 100
    pub risk_score: u8,
    pub signals: Vec<FraudSignalKind>,
}

impl FraudAssessment {
    pub fn clean() -> Self {
        Self {
            is_fraudulent: false,
            risk_score: 0,
            signals: Vec::new(),
        }
    }
}

/// Scores a registration against device reuse, referral rate and referral
/// pattern signals. Runs outside any binding transaction.
pub struct FraudGuard<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    config: FraudConfig,
    root_code: String,
}

impl<S: DocumentStore + ?Sized> FraudGuard<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            config: config.fraud.clone(),
            root_code: config.referral.root_code.clone(),
        }
    }

    /// `referrer_code` is the code the member is joining under, if any.
    pub async fn check(&self, member_id: &str, referrer_code: Option<&str>) -> Result<FraudAssessment> {
        if !self.config.enabled {
            return Ok(FraudAssessment::clean());
        }

        let member = self
            .store
            .member(member_id)
            .await?
            .ok_or_else(|| EngineError::MemberNotFound {
                member_id: member_id.to_string(),
            })?
            .value;

        let mut findings: Vec<(FraudSignalKind, u32, String)> = Vec::new();

        if let Some(fingerprint) = member.device_fingerprint.as_deref().filter(|f| !f.is_empty()) {
            let seen = self.store.count_members_with_fingerprint(fingerprint).await?;
            if seen >= self.config.fingerprint_reuse_threshold {
                findings.push((
                    FraudSignalKind::DeviceReuse,
                    DEVICE_REUSE_SCORE,
                    format!("device fingerprint shared by {} members", seen),
                ));
            }
        }

        // 系統根節點的代碼承接所有孤兒，不做速率與結構判斷
        if let Some(code) = referrer_code.filter(|c| *c != self.root_code) {
            let now = Utc::now();
            let hourly = self.store.count_referrals_since(code, now - Duration::hours(1)).await?;
            let daily = self.store.count_referrals_since(code, now - Duration::days(1)).await?;
            if hourly > self.config.hourly_referral_cap || daily > self.config.daily_referral_cap {
                findings.push((
                    FraudSignalKind::ReferralRate,
                    REFERRAL_RATE_SCORE,
                    format!("code {} referred {} in the last hour, {} today", code, hourly, daily),
                ));
            }

            let counts = self.store.referral_payment_counts(code).await?;
            if counts.total >= self.config.pattern_min_referrals
                && counts.total > 0
                && counts.unpaid as f64 / counts.total as f64 >= self.config.pattern_unpaid_ratio
            {
                findings.push((
                    FraudSignalKind::ReferralPattern,
                    REFERRAL_PATTERN_SCORE,
                    format!("{} of {} referrals of {} are unpaid", counts.unpaid, counts.total, code),
                ));
            }
        }

        let score = findings.iter().map(|(_, s, _)| *s).sum::<u32>().min(100) as u8;
        let assessment = FraudAssessment {
            is_fraudulent: score >= self.config.fraud_score_threshold,
            risk_score: score,
            signals: findings.iter().map(|(kind, _, _)| *kind).collect(),
        };

        for (signal, signal_score, detail) in findings {
            let record = SuspiciousActivity {
                member_id: member_id.to_string(),
                signal,
                detail,
                risk_score: signal_score as u8,
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.store.append_suspicious_activity(record).await {
                tracing::warn!("⚠️ Failed to record suspicious activity for {}: {}", member_id, e);
            }
        }

        if assessment.is_fraudulent {
            tracing::warn!(
                "🚨 {} flagged as fraudulent (score {}, signals {:?})",
                member_id,
                assessment.risk_score,
                assessment.signals
            );
        } else if !assessment.signals.is_empty() {
            tracing::info!("🔍 {} raised {:?} (score {})", member_id, assessment.signals, assessment.risk_score);
        }

        Ok(assessment)
    }
}
