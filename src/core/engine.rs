use crate::config::toml_config::EngineConfig;
use crate::core::chain_binding::{BindOutcome, ChainBinder, MigrationReport, ProvisionalOutcome};
use crate::core::code_registry::CodeRegistry;
use crate::core::fraud::FraudGuard;
use crate::core::outbox::{DispatchReport, OutboxDispatcher};
use crate::core::progression::{PromotionResult, ProgressionEngine, TierProgress};
use crate::core::registration::{NewMember, PaymentOutcome, Registrar, RegistrationOutcome};
use crate::core::statistics::StatisticsAggregator;
use crate::domain::model::{MemberId, MemberStatistics};
use crate::domain::ports::{ConfigProvider, DocumentStore, Notifier};
use crate::utils::error::Result;
use std::sync::Arc;

/// Entry point wiring the registry, binder, aggregator, progression engine,
/// fraud guard and outbox around one injected store.
///
/// Operations that bind a member re-evaluate promotions for every member
/// whose counters changed, after the binding transaction has committed.
pub struct ReferralEngine<S: DocumentStore + ?Sized + 'static> {
    pub(crate) store: Arc<S>,
    pub(crate) provider: Arc<dyn ConfigProvider>,
    pub(crate) config: EngineConfig,
    pub(crate) codes: Arc<CodeRegistry<S>>,
    pub(crate) binder: Arc<ChainBinder<S>>,
    pub(crate) stats: Arc<StatisticsAggregator<S>>,
    pub(crate) progression: Arc<ProgressionEngine<S>>,
    pub(crate) registrar: Registrar<S>,
    pub(crate) outbox: Arc<OutboxDispatcher<S>>,
}

impl<S: DocumentStore + ?Sized + 'static> ReferralEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig, notifier: Arc<dyn Notifier>) -> Self {
        let provider: Arc<dyn ConfigProvider> = Arc::new(config.clone());
        Self::with_provider(store, config, provider, notifier)
    }

    /// Same as [`ReferralEngine::new`] with an external configuration collaborator.
    pub fn with_provider(
        store: Arc<S>,
        config: EngineConfig,
        provider: Arc<dyn ConfigProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let codes = Arc::new(CodeRegistry::new(store.clone(), &config));
        Self::assemble(store, config, provider, notifier, codes)
    }

    /// Use a prepared code registry, e.g. one with a deterministic random source.
    pub fn with_code_registry(
        store: Arc<S>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        codes: CodeRegistry<S>,
    ) -> Self {
        let provider: Arc<dyn ConfigProvider> = Arc::new(config.clone());
        Self::assemble(store, config, provider, notifier, Arc::new(codes))
    }

    fn assemble(
        store: Arc<S>,
        config: EngineConfig,
        provider: Arc<dyn ConfigProvider>,
        notifier: Arc<dyn Notifier>,
        codes: Arc<CodeRegistry<S>>,
    ) -> Self {
        let binder = Arc::new(ChainBinder::new(store.clone(), codes.clone(), provider.clone(), &config));
        let stats = Arc::new(StatisticsAggregator::new(store.clone(), &config));
        let progression = Arc::new(ProgressionEngine::new(store.clone(), &config));
        let fraud = Arc::new(FraudGuard::new(store.clone(), &config));
        let registrar = Registrar::new(
            store.clone(),
            codes.clone(),
            binder.clone(),
            fraud,
            provider.clone(),
            &config,
        );
        let outbox = Arc::new(OutboxDispatcher::new(store.clone(), notifier, &config));

        Self {
            store,
            provider,
            config,
            codes,
            binder,
            stats,
            progression,
            registrar,
            outbox,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codes(&self) -> &CodeRegistry<S> {
        &self.codes
    }

    pub fn statistics(&self) -> &StatisticsAggregator<S> {
        &self.stats
    }

    pub fn progression(&self) -> &ProgressionEngine<S> {
        &self.progression
    }

    pub fn outbox(&self) -> Arc<OutboxDispatcher<S>> {
        self.outbox.clone()
    }

    pub async fn bootstrap_root(&self) -> Result<bool> {
        self.registrar.bootstrap_root().await
    }

    pub async fn ensure_code(&self, member_id: &str) -> Result<String> {
        self.codes.ensure_code(member_id).await
    }

    pub async fn record_click(&self, code: &str) -> Result<()> {
        self.codes.record_click(code).await
    }

    pub async fn deactivate_code(&self, code: &str) -> Result<()> {
        self.codes.deactivate(code).await
    }

    pub async fn register(&self, new_member: NewMember) -> Result<RegistrationOutcome> {
        let outcome = self.registrar.register(new_member).await?;
        if let Some(binding) = &outcome.binding {
            self.after_bind(&outcome.member_id, binding).await;
        }
        Ok(outcome)
    }

    pub async fn confirm_payment(&self, member_id: &str) -> Result<PaymentOutcome> {
        let outcome = self.registrar.confirm_payment(member_id).await?;
        if let Some(binding) = &outcome.binding {
            self.after_bind(member_id, binding).await;
        }
        // 付款前累積的下線在啟用後才能計入晉升
        if outcome.activated {
            self.promote_best_effort(member_id, "payment").await;
        }
        Ok(outcome)
    }

    pub async fn assign_provisional(
        &self,
        member_id: &str,
        supplied_code: Option<&str>,
    ) -> Result<ProvisionalOutcome> {
        self.binder.assign_provisional(member_id, supplied_code).await
    }

    pub async fn bind(&self, member_id: &str) -> Result<BindOutcome> {
        let outcome = self.binder.bind(member_id).await?;
        self.after_bind(member_id, &outcome).await;
        Ok(outcome)
    }

    pub async fn bind_direct(&self, member_id: &str, code: &str) -> Result<BindOutcome> {
        let outcome = self.binder.bind_direct(member_id, code).await?;
        self.after_bind(member_id, &outcome).await;
        Ok(outcome)
    }

    pub async fn migrate_orphans(&self) -> Result<MigrationReport> {
        let (report, outcomes) = self.binder.migrate_orphans().await?;
        for (member_id, outcome) in &outcomes {
            self.after_bind(member_id, outcome).await;
        }
        Ok(report)
    }

    pub async fn check_and_promote(&self, member_id: &str) -> Result<PromotionResult> {
        self.progression.check_and_promote(member_id).await
    }

    /// A forced recompute that repairs drifted counters re-evaluates the member's role.
    pub async fn get_statistics(&self, member_id: &str, force_recompute: bool) -> Result<MemberStatistics> {
        if !force_recompute {
            return self.stats.get_statistics(member_id, false).await;
        }

        self.stats.cache().invalidate(member_id).await;
        let (stats, drifted) = self.stats.recompute_with_drift(member_id).await?;
        if drifted {
            self.promote_best_effort(member_id, "reconciliation").await;
        }
        Ok(stats)
    }

    pub async fn progress(&self, member_id: &str) -> Result<TierProgress> {
        self.progression.member_progress(member_id).await
    }

    pub async fn drain_outbox(&self) -> Result<DispatchReport> {
        self.outbox.drain().await
    }

    /// Post-commit work for a successful bind: drop cached statistics and
    /// re-evaluate promotions of every member whose counters moved.
    async fn after_bind(&self, member_id: &str, outcome: &BindOutcome) {
        let touched = match outcome {
            BindOutcome::Bound { touched, .. } => touched,
            _ => return,
        };

        let mut stale: Vec<MemberId> = touched.clone();
        stale.push(member_id.to_string());
        self.stats.invalidate(&stale).await;

        for id in touched {
            self.promote_best_effort(id, "bind").await;
        }
    }

    pub(crate) async fn promote_best_effort(&self, member_id: &str, trigger: &str) {
        if let Err(e) = self.progression.check_and_promote(member_id).await {
            tracing::warn!("⚠️ Promotion check after {} failed for {}: {}", trigger, member_id, e);
        }
    }
}
