//! Short-TTL read-through cache for member statistics.
//!
//! Concurrent misses for the same member coalesce: the first caller
//! registers an in-flight entry and runs the fetch, later callers subscribe
//! to its broadcast channel and receive the same value. A failed fetch is
//! not shared: each waiter retries with its own fetch and gets its own error.

use crate::domain::model::{MemberId, MemberStatistics};
use crate::utils::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

type FetchResult = Option<MemberStatistics>;
type InFlight = HashMap<MemberId, broadcast::Sender<FetchResult>>;

pub struct StatsCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<MemberId, (MemberStatistics, Instant)>>,
    in_flight: Mutex<InFlight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsCacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub max_entries: usize,
}

enum Slot<'a> {
    Leader(LeaderGuard<'a>),
    Follower(broadcast::Receiver<FetchResult>),
}

/// Owns the in-flight registration of one fetch; dropping it unregisters
/// the key so waiters are released even if the fetch is cancelled.
struct LeaderGuard<'a> {
    cache: &'a StatsCache,
    member_id: &'a str,
    sender: broadcast::Sender<FetchResult>,
    started_at: Instant,
    completed: bool,
}

impl LeaderGuard<'_> {
    fn complete(mut self, result: &Result<MemberStatistics>) {
        self.cache.lock_in_flight().remove(self.member_id);
        self.completed = true;
        tracing::debug!(
            member_id = self.member_id,
            waiting = self.sender.receiver_count(),
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Completing coalesced statistics fetch"
        );
        let _ = self.sender.send(result.as_ref().ok().copied());
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.cache.lock_in_flight().remove(self.member_id);
        }
    }
}

impl StatsCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn get(&self, member_id: &str) -> Option<MemberStatistics> {
        let entries = self.entries.read().await;
        entries
            .get(member_id)
            .filter(|(_, cached_at)| cached_at.elapsed() < self.ttl)
            .map(|(stats, _)| *stats)
    }

    pub async fn insert(&self, member_id: &str, stats: MemberStatistics) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(member_id) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, (_, cached_at)| cached_at.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                // 仍然滿了就淘汰最舊的一筆
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, (_, cached_at))| *cached_at)
                    .map(|(id, _)| id.clone());
                if let Some(id) = oldest {
                    entries.remove(&id);
                }
            }
        }
        entries.insert(member_id.to_string(), (stats, Instant::now()));
    }

    pub async fn invalidate(&self, member_id: &str) {
        self.entries.write().await.remove(member_id);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> StatsCacheStats {
        StatsCacheStats {
            entries: self.entries.read().await.len(),
            in_flight: self.lock_in_flight().len(),
            max_entries: self.max_entries,
        }
    }

    /// Return the cached value or run `fetch` once for all concurrent callers.
    pub async fn get_or_fetch<F, Fut>(&self, member_id: &str, fetch: F) -> Result<MemberStatistics>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MemberStatistics>>,
    {
        if let Some(stats) = self.get(member_id).await {
            return Ok(stats);
        }

        let slot = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(member_id) {
                Some(sender) => Slot::Follower(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    in_flight.insert(member_id.to_string(), sender.clone());
                    Slot::Leader(LeaderGuard {
                        cache: self,
                        member_id,
                        sender,
                        started_at: Instant::now(),
                        completed: false,
                    })
                }
            }
        };

        match slot {
            Slot::Follower(mut receiver) => match receiver.recv().await {
                Ok(Some(stats)) => Ok(stats),
                // 領頭的請求失敗或被取消，自己重新查詢
                Ok(None) | Err(_) => fetch().await,
            },
            Slot::Leader(guard) => {
                let result = fetch().await;
                if let Ok(stats) = &result {
                    self.insert(member_id, *stats).await;
                }
                guard.complete(&result);
                result
            }
        }
    }
}
