use crate::domain::model::{
    AnalyticsEvent, Member, Notification, OutboxTask, PromotionAuditEntry, ReferralCodeRecord,
    SuspiciousActivity,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A document together with the version observed when it was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Identity of a document taking part in an optimistic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocKey {
    Member(String),
    Code(String),
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocKey::Member(id) => write!(f, "members/{}", id),
            DocKey::Code(code) => write!(f, "referralCodes/{}", code),
        }
    }
}

/// Buffered writes of one transaction.
///
/// `preconditions` lists every document read together with the version seen,
/// where version 0 means "must not exist". The store applies the batch only if
/// all of them still hold, otherwise it returns `EngineError::Conflict`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub preconditions: Vec<(DocKey, u64)>,
    pub members: Vec<Member>,
    pub codes: Vec<ReferralCodeRecord>,
    pub audits: Vec<PromotionAuditEntry>,
    pub outbox: Vec<OutboxTask>,
}

impl WriteBatch {
    pub fn has_writes(&self) -> bool {
        !(self.members.is_empty()
            && self.codes.is_empty()
            && self.audits.is_empty()
            && self.outbox.is_empty())
    }
}

/// Selection used by paged scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberFilter {
    All,
    /// Active, non-root members with neither `referred_by` nor `provisional_ref`.
    ActiveOrphans,
    MissingCode,
    /// Paid members still waiting on a provisional reference.
    PaidUnbound,
}

impl MemberFilter {
    pub fn matches(&self, member: &Member) -> bool {
        use crate::domain::model::MemberStatus;
        match self {
            MemberFilter::All => true,
            MemberFilter::ActiveOrphans => {
                member.status == MemberStatus::Active && member.is_orphan()
            }
            MemberFilter::MissingCode => member.referral_code.is_none(),
            MemberFilter::PaidUnbound => {
                member.membership_paid
                    && member.referred_by.is_none()
                    && member.provisional_ref.is_some()
                    && member.status != MemberStatus::Blocked
            }
        }
    }
}

/// Counts of members pointing at a referrer code, bound or provisional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferralPaymentCounts {
    pub total: u64,
    pub unpaid: u64,
}

/// Transactional document store holding the referral forest.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn member(&self, id: &str) -> Result<Option<Versioned<Member>>>;

    async fn code(&self, code: &str) -> Result<Option<Versioned<ReferralCodeRecord>>>;

    /// Atomically apply a batch, checking every precondition first.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Single-document create-if-absent on the code index.
    async fn create_code_if_absent(&self, record: ReferralCodeRecord) -> Result<bool>;

    /// Parent-pointer lookup: members whose `referred_by` equals `code`.
    async fn count_direct_referrals(&self, code: &str) -> Result<u64>;

    /// Chain-membership lookup: members whose `referral_chain` contains `code`.
    async fn count_team_members(&self, code: &str) -> Result<u64>;

    /// Codes of the members bound directly under `code`.
    async fn direct_referral_codes(&self, code: &str) -> Result<Vec<String>>;

    /// Paged scan ordered by member id, starting strictly after `after`.
    async fn scan_members(
        &self,
        filter: MemberFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Member>>;

    async fn count_members_with_fingerprint(&self, fingerprint: &str) -> Result<u64>;

    /// Members created since `since` that point at `code` (bound or provisional).
    async fn count_referrals_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn referral_payment_counts(&self, code: &str) -> Result<ReferralPaymentCounts>;

    async fn promotion_audit(&self, member_id: &str) -> Result<Vec<PromotionAuditEntry>>;

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxTask>>;

    async fn update_outbox(&self, task: OutboxTask) -> Result<()>;

    async fn append_analytics_event(&self, event: AnalyticsEvent) -> Result<()>;

    async fn append_suspicious_activity(&self, record: SuspiciousActivity) -> Result<()>;
}

pub trait ConfigProvider: Send + Sync {
    fn fallback_root_code(&self) -> &str;
    fn root_member_id(&self) -> &str;
    fn is_admin(&self, member_id: &str) -> bool;
}

/// Fire-and-forget notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}
