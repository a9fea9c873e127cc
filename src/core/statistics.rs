use crate::config::toml_config::{EngineConfig, TeamSizeStrategy};
use crate::core::stats_cache::StatsCache;
use crate::core::transaction::run_transaction;
use crate::domain::model::{MemberId, MemberStatistics};
use crate::domain::ports::{DocumentStore, MemberFilter};
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Per-member outcome of a batch recompute.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecomputeReport {
    pub recomputed: usize,
    /// Members whose stored counters were corrected.
    pub drifted: Vec<MemberId>,
    pub failures: Vec<(MemberId, String)>,
}

/// Recomputes referral counters from the source of truth and serves them
/// through a short-lived cache. Incremental counters are owned by binding.
pub struct StatisticsAggregator<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    strategy: TeamSizeStrategy,
    tree_walk_max_depth: usize,
    batch_size: usize,
    batch_pause: Duration,
    tx_retry: RetryConfig,
    cache: StatsCache,
}

impl<S: DocumentStore + ?Sized> StatisticsAggregator<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        let stats = &config.statistics;
        Self {
            store,
            strategy: stats.strategy,
            tree_walk_max_depth: stats.tree_walk_max_depth,
            batch_size: stats.batch_size.max(1),
            batch_pause: stats.batch_pause(),
            tx_retry: config.transactions.retry_config(),
            cache: StatsCache::new(stats.cache_ttl(), stats.cache_max_entries),
        }
    }

    pub fn with_strategy(mut self, strategy: TeamSizeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn cache(&self) -> &StatsCache {
        &self.cache
    }

    pub async fn team_size(&self, code: &str) -> Result<u64> {
        match self.strategy {
            TeamSizeStrategy::ChainMembership => self.store.count_team_members(code).await,
            TeamSizeStrategy::TreeWalk => self.team_size_by_tree_walk(code).await,
        }
    }

    /// Breadth-first walk over parent pointers.
    ///
    /// The visited set and the depth cap bound the walk even when stored
    /// data contains a cycle.
    pub async fn team_size_by_tree_walk(&self, code: &str) -> Result<u64> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut worklist: VecDeque<(String, usize)> = VecDeque::new();
        visited.insert(code.to_string());
        worklist.push_back((code.to_string(), 0));

        let mut team = 0u64;
        while let Some((current, depth)) = worklist.pop_front() {
            if depth >= self.tree_walk_max_depth {
                continue;
            }
            team += self.store.count_direct_referrals(&current).await?;
            for child in self.store.direct_referral_codes(&current).await? {
                if visited.insert(child.clone()) {
                    worklist.push_back((child, depth + 1));
                } else {
                    tracing::warn!("⚠️ Referral code {} reached twice while walking {}", child, code);
                }
            }
        }

        Ok(team)
    }

    /// Overwrite the member's counters with freshly computed values.
    pub async fn recompute(&self, member_id: &str) -> Result<MemberStatistics> {
        Ok(self.recompute_with_drift(member_id).await?.0)
    }

    /// Same as [`StatisticsAggregator::recompute`], also reporting whether
    /// the stored counters had drifted and were overwritten.
    pub async fn recompute_with_drift(&self, member_id: &str) -> Result<(MemberStatistics, bool)> {
        let member = self
            .store
            .member(member_id)
            .await?
            .ok_or_else(|| EngineError::MemberNotFound {
                member_id: member_id.to_string(),
            })?
            .value;

        let (direct, team) = match &member.referral_code {
            Some(code) => (
                self.store.count_direct_referrals(code).await?,
                self.team_size(code).await?,
            ),
            None => (0, 0),
        };

        let stats = run_transaction(&self.store, &self.tx_retry, "recompute_stats", move |mut tx| async move {
            let mut member = tx.require_member(member_id).await?;
            let stats = MemberStatistics {
                direct_referrals: direct,
                team_size: team,
                chain_depth: member.chain_depth(),
            };
            let drifted = member.direct_referral_count != direct || member.team_size != team;
            if drifted {
                tracing::info!(
                    "🔧 Counter drift for {}: direct {} -> {}, team {} -> {}",
                    member_id,
                    member.direct_referral_count,
                    direct,
                    member.team_size,
                    team
                );
                member.direct_referral_count = direct;
                member.team_size = team;
                tx.put_member(member).await?;
            }
            Ok((tx, (stats, drifted)))
        })
        .await?;

        self.cache.insert(member_id, stats.0).await;
        Ok(stats)
    }

    /// Cached read of the stored counters, or a full recompute when forced.
    pub async fn get_statistics(&self, member_id: &str, force_recompute: bool) -> Result<MemberStatistics> {
        if force_recompute {
            self.cache.invalidate(member_id).await;
            return self.recompute(member_id).await;
        }

        self.cache
            .get_or_fetch(member_id, || async move {
                let member = self
                    .store
                    .member(member_id)
                    .await?
                    .ok_or_else(|| EngineError::MemberNotFound {
                        member_id: member_id.to_string(),
                    })?
                    .value;
                Ok(MemberStatistics {
                    direct_referrals: member.direct_referral_count,
                    team_size: member.team_size,
                    chain_depth: member.chain_depth(),
                })
            })
            .await
    }

    pub async fn invalidate(&self, member_ids: &[MemberId]) {
        for id in member_ids {
            self.cache.invalidate(id).await;
        }
    }

    /// Recompute in bounded batches with a pause between batches.
    /// Failures are collected; the batch never aborts early.
    pub async fn recompute_batch(&self, member_ids: &[MemberId]) -> RecomputeReport {
        let mut report = RecomputeReport::default();
        for (index, chunk) in member_ids.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
            self.recompute_chunk(chunk, &mut report).await;
        }
        report
    }

    async fn recompute_chunk(&self, chunk: &[MemberId], report: &mut RecomputeReport) {
        for id in chunk {
            match self.recompute_with_drift(id).await {
                Ok((_, drifted)) => {
                    report.recomputed += 1;
                    if drifted {
                        report.drifted.push(id.clone());
                    }
                }
                Err(e) => {
                    tracing::error!("❌ Failed to recompute statistics for {}: {}", id, e);
                    report.failures.push((id.clone(), e.to_string()));
                }
            }
        }
    }

    /// Paged recompute over every member.
    pub async fn recompute_all(&self) -> Result<RecomputeReport> {
        let mut report = RecomputeReport::default();
        let mut cursor: Option<String> = None;
        let mut first = true;

        loop {
            let page = self
                .store
                .scan_members(MemberFilter::All, cursor.as_deref(), self.batch_size)
                .await?;
            if page.is_empty() {
                break;
            }
            if !first && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
            first = false;
            cursor = page.last().map(|m| m.id.clone());

            let ids: Vec<MemberId> = page.into_iter().map(|m| m.id).collect();
            self.recompute_chunk(&ids, &mut report).await;
        }

        tracing::info!(
            "📊 Recomputed statistics for {} members ({} failures)",
            report.recomputed,
            report.failures.len()
        );
        Ok(report)
    }
}
