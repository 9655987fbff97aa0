use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::GatewayError;
use crate::pool::{Credential, Pool};
use crate::routing::SelectionStrategy;

/// 选择器的共享状态：每个池一个独立游标，外加进行中请求计数
#[derive(Debug, Default)]
pub struct SelectorState {
    cursors: Mutex<HashMap<i64, Arc<AtomicUsize>>>,
    in_flight: Mutex<HashMap<i64, usize>>,
}

impl SelectorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor(&self, pool_id: i64) -> Arc<AtomicUsize> {
        let mut map = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(pool_id).or_default().clone()
    }

    /// fetch_add 保证并发请求拿到不同位置
    fn next_position(&self, pool_id: i64, modulus: usize) -> usize {
        if modulus == 0 {
            return 0;
        }
        self.cursor(pool_id).fetch_add(1, Ordering::Relaxed) % modulus
    }

    pub fn in_flight(&self, credential_id: i64) -> usize {
        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&credential_id).copied().unwrap_or(0)
    }

    pub fn begin(self: &Arc<Self>, credential_id: i64) -> InFlightGuard {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(credential_id).or_insert(0) += 1;
        InFlightGuard {
            state: self.clone(),
            credential_id,
        }
    }

    fn finish(&self, credential_id: i64) {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = map.get_mut(&credential_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                map.remove(&credential_id);
            }
        }
    }
}

/// 上游调用结束（含被取消）时自动减少进行中计数
#[derive(Debug)]
pub struct InFlightGuard {
    state: Arc<SelectorState>,
    credential_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.finish(self.credential_id);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SelectError {
    NoEligibleCredential { pool_id: i64, provider: String },
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::NoEligibleCredential { pool_id, provider } => {
                write!(f, "No eligible credential in pool {} ({})", pool_id, provider)
            }
        }
    }
}

impl std::error::Error for SelectError {}

impl From<SelectError> for GatewayError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoEligibleCredential { provider, .. } => {
                GatewayError::NoEligibleCredential { provider }
            }
        }
    }
}

pub struct PoolSelector {
    state: Arc<SelectorState>,
}

impl PoolSelector {
    pub fn new() -> Self {
        Self::with_state(Arc::new(SelectorState::default()))
    }

    pub fn with_state(state: Arc<SelectorState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<SelectorState> {
        &self.state
    }

    /// 先过滤（启用、非 unhealthy、未过期、未限流、未尝试过），再按池策略挑一个
    pub fn select<'a>(
        &self,
        pool: &Pool,
        credentials: &'a [Credential],
        exclude: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<&'a Credential, SelectError> {
        let mut eligible: Vec<&'a Credential> = credentials
            .iter()
            .filter(|c| c.pool_id == pool.id && !exclude.contains(&c.id) && c.is_eligible(now))
            .collect();
        if eligible.is_empty() {
            return Err(SelectError::NoEligibleCredential {
                pool_id: pool.id,
                provider: pool.provider.to_string(),
            });
        }
        eligible.sort_by_key(|c| c.id);

        let picked = match pool.strategy {
            SelectionStrategy::RoundRobin => {
                eligible[self.state.next_position(pool.id, eligible.len())]
            }
            SelectionStrategy::WeightedRoundRobin => self.weighted(pool.id, &eligible),
            SelectionStrategy::LeastConnections => eligible
                .iter()
                .copied()
                .min_by_key(|c| (self.state.in_flight(c.id), c.total_requests, c.id))
                .unwrap_or(eligible[0]),
            SelectionStrategy::Random => {
                let mut rng = rand::rng();
                eligible[rng.random_range(0..eligible.len())]
            }
        };
        Ok(picked)
    }

    /// 游标对总权重取模后沿累计权重定位；一整轮内每个凭据恰好出现 weight 次
    fn weighted<'a>(&self, pool_id: i64, eligible: &[&'a Credential]) -> &'a Credential {
        let total: usize = eligible.iter().map(|c| c.weight.max(1) as usize).sum();
        let mut position = self.state.next_position(pool_id, total);
        for c in eligible {
            let w = c.weight.max(1) as usize;
            if position < w {
                return c;
            }
            position -= w;
        }
        eligible[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::pool::HealthStatus;
    use crate::pool::model::tests::api_key_credential;
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pool(strategy: SelectionStrategy) -> Pool {
        let mut p = Pool::new("p", ProviderKind::OpenAI);
        p.id = 1;
        p.strategy = strategy;
        p
    }

    fn counts(picks: &[i64]) -> HashMap<i64, usize> {
        let mut m = HashMap::new();
        for id in picks {
            *m.entry(*id).or_insert(0) += 1;
        }
        m
    }

    #[test]
    fn round_robin_persists_across_instances() {
        let creds = vec![api_key_credential(3, 1), api_key_credential(1, 1), api_key_credential(2, 1)];
        let state = Arc::new(SelectorState::default());
        let p = pool(SelectionStrategy::RoundRobin);
        let now = Utc::now();

        let mut out = Vec::new();
        for _ in 0..6 {
            let sel = PoolSelector::with_state(state.clone());
            out.push(sel.select(&p, &creds, &HashSet::new(), now).unwrap().id);
        }
        assert_eq!(out, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn pools_rotate_independently() {
        let state = Arc::new(SelectorState::default());
        let sel = PoolSelector::with_state(state);
        let now = Utc::now();
        let p1 = pool(SelectionStrategy::RoundRobin);
        let mut p2 = pool(SelectionStrategy::RoundRobin);
        p2.id = 2;
        let c1 = vec![api_key_credential(1, 1), api_key_credential(2, 1)];
        let mut c2 = vec![api_key_credential(10, 1), api_key_credential(11, 1)];
        for c in &mut c2 {
            c.pool_id = 2;
        }

        assert_eq!(sel.select(&p1, &c1, &HashSet::new(), now).unwrap().id, 1);
        assert_eq!(sel.select(&p2, &c2, &HashSet::new(), now).unwrap().id, 10);
        assert_eq!(sel.select(&p1, &c1, &HashSet::new(), now).unwrap().id, 2);
        assert_eq!(sel.select(&p2, &c2, &HashSet::new(), now).unwrap().id, 11);
    }

    #[test]
    fn weighted_rotation_is_exact_over_full_cycles() {
        let creds = vec![api_key_credential(1, 1), api_key_credential(2, 2), api_key_credential(3, 3)];
        let sel = PoolSelector::new();
        let p = pool(SelectionStrategy::WeightedRoundRobin);
        let now = Utc::now();
        let k = 50;
        let picks: Vec<i64> = (0..k * 6)
            .map(|_| sel.select(&p, &creds, &HashSet::new(), now).unwrap().id)
            .collect();
        let m = counts(&picks);
        assert_eq!(m[&1], k);
        assert_eq!(m[&2], 2 * k);
        assert_eq!(m[&3], 3 * k);
    }

    #[test]
    fn weighted_skips_unhealthy_and_keeps_ratio() {
        let mut c = api_key_credential(3, 1);
        c.health_status = HealthStatus::Unhealthy;
        let creds = vec![api_key_credential(1, 1), api_key_credential(2, 2), c];
        let sel = PoolSelector::new();
        let p = pool(SelectionStrategy::WeightedRoundRobin);
        let now = Utc::now();

        let picks: Vec<i64> = (0..40)
            .map(|_| sel.select(&p, &creds, &HashSet::new(), now).unwrap().id)
            .collect();
        let m = counts(&picks);
        assert_eq!(m.get(&3), None);
        // 40 次里 A:B = 1:2
        assert!((13..=14).contains(&m[&1]), "A picked {}", m[&1]);
        assert!((26..=27).contains(&m[&2]), "B picked {}", m[&2]);
        assert_eq!(m[&1] + m[&2], 40);
    }

    #[test]
    fn never_returns_ineligible_credentials() {
        let mut rng = StdRng::seed_from_u64(7);
        let sel = PoolSelector::new();
        let now = Utc::now();
        let strategies = [
            SelectionStrategy::RoundRobin,
            SelectionStrategy::WeightedRoundRobin,
            SelectionStrategy::LeastConnections,
            SelectionStrategy::Random,
        ];

        for round in 0..300 {
            let n = rng.random_range(0..6);
            let creds: Vec<Credential> = (0..n)
                .map(|i| {
                    let mut c = api_key_credential(i as i64 + 1, rng.random_range(1..4));
                    c.is_active = rng.random_bool(0.7);
                    c.health_status = match rng.random_range(0..3) {
                        0 => HealthStatus::Healthy,
                        1 => HealthStatus::Unhealthy,
                        _ => HealthStatus::Unknown,
                    };
                    if rng.random_bool(0.3) {
                        c.expires_at = Some(now - Duration::minutes(1));
                    }
                    if rng.random_bool(0.3) {
                        c.rate_limit = 5;
                        c.current_usage = 5;
                        c.rate_limit_reset_at = Some(now + Duration::seconds(30));
                    }
                    c
                })
                .collect();
            let p = pool(strategies[round % strategies.len()]);
            let any_eligible = creds.iter().any(|c| c.is_eligible(now));
            match sel.select(&p, &creds, &HashSet::new(), now) {
                Ok(c) => assert!(c.is_eligible(now), "picked ineligible {:?}", c.ineligibility(now)),
                Err(e) => {
                    assert!(!any_eligible);
                    assert!(matches!(e, SelectError::NoEligibleCredential { .. }));
                }
            }
        }
    }

    #[test]
    fn excluded_credentials_are_skipped() {
        let creds = vec![api_key_credential(1, 1), api_key_credential(2, 1)];
        let sel = PoolSelector::new();
        let p = pool(SelectionStrategy::RoundRobin);
        let now = Utc::now();
        let tried: HashSet<i64> = [1].into_iter().collect();
        for _ in 0..3 {
            assert_eq!(sel.select(&p, &creds, &tried, now).unwrap().id, 2);
        }
        let all: HashSet<i64> = [1, 2].into_iter().collect();
        assert!(sel.select(&p, &creds, &all, now).is_err());
    }

    #[test]
    fn least_connections_prefers_idle_credential() {
        let creds = vec![api_key_credential(1, 1), api_key_credential(2, 1)];
        let sel = PoolSelector::new();
        let p = pool(SelectionStrategy::LeastConnections);
        let now = Utc::now();

        let g1 = sel.state().begin(1);
        assert_eq!(sel.select(&p, &creds, &HashSet::new(), now).unwrap().id, 2);
        let g2 = sel.state().begin(2);
        let g3 = sel.state().begin(2);
        assert_eq!(sel.select(&p, &creds, &HashSet::new(), now).unwrap().id, 1);
        drop((g2, g3));
        drop(g1);
        assert_eq!(sel.state().in_flight(1), 0);
        assert_eq!(sel.select(&p, &creds, &HashSet::new(), now).unwrap().id, 1);
    }

    #[test]
    fn concurrent_round_robin_does_not_skip_or_repeat() {
        let creds = vec![
            api_key_credential(1, 1),
            api_key_credential(2, 1),
            api_key_credential(3, 1),
            api_key_credential(4, 1),
        ];
        let sel = PoolSelector::new();
        let p = pool(SelectionStrategy::RoundRobin);
        let now = Utc::now();

        let picks: Vec<i64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..500)
                            .map(|_| sel.select(&p, &creds, &HashSet::new(), now).unwrap().id)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let m = counts(&picks);
        for id in 1..=4 {
            assert_eq!(m[&id], 1000);
        }
    }
}
