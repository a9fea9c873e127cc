//! Registration, payment confirmation and root bootstrap.
//!
//! Referral handling never fails a registration: binding and fraud errors
//! are logged and surfaced in the returned outcome.

use crate::config::toml_config::EngineConfig;
use crate::core::chain_binding::{BindOutcome, ChainBinder, ProvisionalOutcome};
use crate::core::code_registry::CodeRegistry;
use crate::core::fraud::{FraudAssessment, FraudGuard};
use crate::core::transaction::run_transaction;
use crate::domain::model::{Member, MemberId, MemberStatus, ReferralCodeRecord, ADMIN_ROLE};
use crate::domain::ports::{ConfigProvider, DocumentStore};
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMember {
    pub id: MemberId,
    /// Referrer code supplied at sign-up, if any.
    pub referral_code: Option<String>,
    pub location: Option<String>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub member_id: MemberId,
    pub referral_code: String,
    pub fraud: Option<FraudAssessment>,
    pub provisional: Option<ProvisionalOutcome>,
    pub binding: Option<BindOutcome>,
    pub referral_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub member_id: MemberId,
    pub status: MemberStatus,
    /// The payment moved the member to `active`.
    pub activated: bool,
    pub binding: Option<BindOutcome>,
    pub referral_error: Option<String>,
}

pub struct Registrar<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    codes: Arc<CodeRegistry<S>>,
    binder: Arc<ChainBinder<S>>,
    fraud: Arc<FraudGuard<S>>,
    provider: Arc<dyn ConfigProvider>,
    base_role: String,
    tx_retry: RetryConfig,
}

impl<S: DocumentStore + ?Sized> Registrar<S> {
    pub fn new(
        store: Arc<S>,
        codes: Arc<CodeRegistry<S>>,
        binder: Arc<ChainBinder<S>>,
        fraud: Arc<FraudGuard<S>>,
        provider: Arc<dyn ConfigProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            codes,
            binder,
            fraud,
            provider,
            base_role: config.progression.base_role.clone(),
            tx_retry: config.transactions.retry_config(),
        }
    }

    pub async fn register(&self, new_member: NewMember) -> Result<RegistrationOutcome> {
        let member_id = new_member.id.trim().to_string();
        if member_id.is_empty() {
            return Err(EngineError::InvalidMemberId {
                member_id: new_member.id.clone(),
            });
        }

        let referral_code = self.create_member(&member_id, &new_member).await?;
        tracing::info!("👤 Registered {} with code {}", member_id, referral_code);

        let mut outcome = RegistrationOutcome {
            member_id: member_id.clone(),
            referral_code,
            fraud: None,
            provisional: None,
            binding: None,
            referral_error: None,
        };

        let supplied = new_member.referral_code.as_deref();
        match self.fraud.check(&member_id, supplied).await {
            Ok(assessment) => {
                let fraudulent = assessment.is_fraudulent;
                outcome.fraud = Some(assessment);
                if fraudulent {
                    self.block(&member_id).await?;
                    return Ok(outcome);
                }
            }
            Err(e) => tracing::warn!("⚠️ Fraud check failed for {}: {}", member_id, e),
        }

        match self.attach_referrer(&member_id, supplied).await {
            Ok((provisional, binding)) => {
                outcome.provisional = Some(provisional);
                outcome.binding = binding;
            }
            Err(e) => {
                tracing::error!("❌ Referral handling failed for {}: {}", member_id, e);
                outcome.referral_error = Some(e.to_string());
            }
        }

        Ok(outcome)
    }

    /// Create the member document and reserve its code in one transaction.
    async fn create_member(&self, member_id: &str, new_member: &NewMember) -> Result<String> {
        let max_attempts = self.codes.max_attempts();
        for attempt in 1..=max_attempts {
            let drawn = self.codes.draw_candidate();
            let candidate: &str = &drawn;
            let result = run_transaction(&self.store, &self.tx_retry, "register", move |mut tx| async move {
                if tx.member(member_id).await?.is_some() {
                    return Err(EngineError::MemberAlreadyExists {
                        member_id: member_id.to_string(),
                    });
                }
                tx.create_code(ReferralCodeRecord::new(candidate, member_id)).await?;

                let mut member = Member::new(member_id, &self.base_role);
                member.referral_code = Some(candidate.to_string());
                member.location = new_member.location.clone();
                member.device_fingerprint = new_member.device_fingerprint.clone();
                tx.put_member(member).await?;
                Ok((tx, candidate.to_string()))
            })
            .await;

            match result {
                Err(EngineError::CodeCollision { code }) => {
                    tracing::debug!("Code {} already taken (attempt {}/{})", code, attempt, max_attempts);
                }
                other => return other,
            }
        }

        Err(EngineError::CodeGenerationExhausted {
            attempts: max_attempts,
        })
    }

    async fn attach_referrer(
        &self,
        member_id: &str,
        supplied: Option<&str>,
    ) -> Result<(ProvisionalOutcome, Option<BindOutcome>)> {
        let provisional = self.binder.assign_provisional(member_id, supplied).await?;
        let binding = match &provisional {
            ProvisionalOutcome::Direct { code } => Some(self.binder.bind_direct(member_id, code).await?),
            _ => None,
        };
        Ok((provisional, binding))
    }

    async fn block(&self, member_id: &str) -> Result<()> {
        run_transaction(&self.store, &self.tx_retry, "block_member", move |mut tx| async move {
            let mut member = tx.require_member(member_id).await?;
            member.status = MemberStatus::Blocked;
            tx.put_member(member).await?;
            Ok((tx, ()))
        })
        .await?;
        tracing::warn!("🚫 {} blocked, referral skipped", member_id);
        Ok(())
    }

    /// Mark the membership paid, then bind best effort.
    pub async fn confirm_payment(&self, member_id: &str) -> Result<PaymentOutcome> {
        let (member, activated) = run_transaction(&self.store, &self.tx_retry, "confirm_payment", move |mut tx| async move {
            let mut member = tx.require_member(member_id).await?;
            let mut activated = false;
            if !member.membership_paid || member.status == MemberStatus::PendingPayment {
                member.membership_paid = true;
                if member.status != MemberStatus::Blocked {
                    activated = member.status != MemberStatus::Active;
                    member.status = MemberStatus::Active;
                }
                tx.put_member(member.clone()).await?;
            }
            Ok((tx, (member, activated)))
        })
        .await?;

        let mut outcome = PaymentOutcome {
            member_id: member_id.to_string(),
            status: member.status,
            activated,
            binding: None,
            referral_error: None,
        };
        if member.status == MemberStatus::Blocked {
            tracing::warn!("🚫 Payment confirmed for blocked member {}; not binding", member_id);
            return Ok(outcome);
        }
        tracing::info!("💳 Payment confirmed for {}", member_id);

        let bound = async {
            if member.is_orphan() {
                if let ProvisionalOutcome::Direct { code } =
                    self.binder.assign_provisional(member_id, None).await?
                {
                    return self.binder.bind_direct(member_id, &code).await;
                }
            }
            self.binder.bind(member_id).await
        }
        .await;

        match bound {
            Ok(binding) => outcome.binding = Some(binding),
            Err(e) => {
                tracing::error!("❌ Binding after payment failed for {}: {}", member_id, e);
                outcome.referral_error = Some(e.to_string());
            }
        }
        Ok(outcome)
    }

    /// Create the admin root and its code if missing. Returns whether anything was written.
    pub async fn bootstrap_root(&self) -> Result<bool> {
        let root_id = self.provider.root_member_id().to_string();
        let root_code = self.provider.fallback_root_code().to_string();
        let (root_id, root_code) = (root_id.as_str(), root_code.as_str());

        let created = run_transaction(&self.store, &self.tx_retry, "bootstrap_root", move |mut tx| async move {
            let mut wrote = false;

            match tx.code(root_code).await? {
                Some(record) if record.owner_id != root_id => {
                    return Err(EngineError::ConfigError {
                        message: format!("Root code {} is owned by {}", root_code, record.owner_id),
                    });
                }
                Some(_) => {}
                None => {
                    tx.put_code(ReferralCodeRecord::new(root_code, root_id)).await?;
                    wrote = true;
                }
            }

            match tx.member(root_id).await? {
                Some(root) if root.role == ADMIN_ROLE && root.referral_code.as_deref() == Some(root_code) => {}
                Some(mut root) => {
                    root.role = ADMIN_ROLE.to_string();
                    root.referral_code = Some(root_code.to_string());
                    tx.put_member(root).await?;
                    wrote = true;
                }
                None => {
                    let mut root = Member::new(root_id, ADMIN_ROLE);
                    root.referral_code = Some(root_code.to_string());
                    root.status = MemberStatus::Active;
                    root.membership_paid = true;
                    tx.put_member(root).await?;
                    wrote = true;
                }
            }

            Ok((tx, wrote))
        })
        .await?;

        if created {
            tracing::info!("🌱 Root {} bootstrapped with code {}", root_id, root_code);
        }
        Ok(created)
    }
}
