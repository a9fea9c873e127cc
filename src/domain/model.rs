use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MemberId = String;

/// Role name of the administrative root; it sits outside the promotion ladder.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    PendingPayment,
    Active,
    Blocked,
}

/// A node of the referral forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: MemberId,
    /// Legacy records may still lack a code; `ensure_code` repairs them.
    pub referral_code: Option<String>,
    pub referred_by: Option<String>,
    pub provisional_ref: Option<String>,
    pub referral_chain: Vec<String>,
    pub direct_referral_count: u64,
    pub team_size: u64,
    pub role: String,
    pub role_level: u32,
    pub status: MemberStatus,
    pub membership_paid: bool,
    pub assigned_by_system: bool,
    pub location: Option<String>,
    pub device_fingerprint: Option<String>,
    pub role_promotion_history: Vec<PromotionRecord>,
    pub created_at: DateTime<Utc>,
    pub bound_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(id: impl Into<MemberId>, base_role: &str) -> Self {
        Self {
            id: id.into(),
            referral_code: None,
            referred_by: None,
            provisional_ref: None,
            referral_chain: Vec::new(),
            direct_referral_count: 0,
            team_size: 0,
            role: base_role.to_string(),
            role_level: 0,
            status: MemberStatus::PendingPayment,
            membership_paid: false,
            assigned_by_system: false,
            location: None,
            device_fingerprint: None,
            role_promotion_history: Vec::new(),
            created_at: Utc::now(),
            bound_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.role == ADMIN_ROLE && self.referred_by.is_none()
    }

    pub fn is_bound(&self) -> bool {
        self.referred_by.is_some()
    }

    /// Bound members and the root can accept children without breaking chain consistency.
    pub fn can_refer(&self) -> bool {
        self.is_bound() || self.is_root()
    }

    pub fn is_orphan(&self) -> bool {
        !self.is_root() && self.referred_by.is_none() && self.provisional_ref.is_none()
    }

    pub fn chain_depth(&self) -> usize {
        self.referral_chain.len()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            direct_referrals: self.direct_referral_count,
            team_size: self.team_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub direct_referrals: u64,
    pub team_size: u64,
}

/// Entry of `Member::role_promotion_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRecord {
    pub from: String,
    pub to: String,
    pub from_level: u32,
    pub to_level: u32,
    pub stats: StatsSnapshot,
    pub promoted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCodeRecord {
    pub code: String,
    pub owner_id: MemberId,
    pub active: bool,
    pub clicks: u64,
    pub conversions: u64,
    pub created_at: DateTime<Utc>,
}

impl ReferralCodeRecord {
    pub fn new(code: impl Into<String>, owner_id: impl Into<MemberId>) -> Self {
        Self {
            code: code.into(),
            owner_id: owner_id.into(),
            active: true,
            clicks: 0,
            conversions: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditOutcome {
    Promoted,
    Blocked { reason: String },
}

/// Immutable audit trail of promotion decisions, stored apart from the member document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionAuditEntry {
    pub id: String,
    pub member_id: MemberId,
    pub from_role: String,
    pub to_role: String,
    pub from_level: u32,
    pub to_level: u32,
    pub stats: StatsSnapshot,
    pub outcome: AuditOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub name: String,
    pub member_id: MemberId,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    RolePromoted { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub member_id: MemberId,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum OutboxPayload {
    Notification(Notification),
    Analytics(AnalyticsEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

/// Side-effect task committed together with the transaction that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxTask {
    pub id: String,
    pub payload: OutboxPayload,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxTask {
    pub fn new(payload: OutboxPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudSignalKind {
    DeviceReuse,
    ReferralRate,
    ReferralPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivity {
    pub member_id: MemberId,
    pub signal: FraudSignalKind,
    pub detail: String,
    pub risk_score: u8,
    pub recorded_at: DateTime<Utc>,
}

/// Statistics returned by `get_statistics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatistics {
    pub direct_referrals: u64,
    pub team_size: u64,
    pub chain_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_serializes_with_document_field_names() {
        let mut member = Member::new("m1", "member");
        member.referral_code = Some("RFABCDEF".to_string());
        member.provisional_ref = Some("ROOT1".to_string());

        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["referralCode"], "RFABCDEF");
        assert_eq!(json["provisionalRef"], "ROOT1");
        assert_eq!(json["status"], "pending_payment");
        assert!(json["referredBy"].is_null());
    }

    #[test]
    fn test_root_and_orphan_classification() {
        let mut root = Member::new("admin", ADMIN_ROLE);
        root.referral_code = Some("ROOT1".to_string());
        assert!(root.is_root());
        assert!(root.can_refer());
        assert!(!root.is_orphan());

        let mut member = Member::new("m1", "member");
        assert!(member.is_orphan());
        assert!(!member.can_refer());

        member.provisional_ref = Some("ROOT1".to_string());
        assert!(!member.is_orphan());
    }
}
