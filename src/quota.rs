//! Квоты: сколько ключей можно завести и сколько трафика на ключ.

use crate::config::QuotaConfig;
use crate::db::{KeyRepository, RepoError};
use crate::model::{Tier, VpnKey};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenial {
    KeyLimitReached { active: i64, max: i64 },
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDenial::KeyLimitReached { active, max } => {
                write!(f, "достигнут лимит ключей ({} из {})", active, max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<QuotaDenial>,
}

impl QuotaDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: QuotaDenial) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaEnforcer {
    policy: QuotaConfig,
}

impl QuotaEnforcer {
    pub fn new(policy: QuotaConfig) -> Self {
        Self { policy }
    }

    pub fn max_keys_for_tier(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => self.policy.free_max_keys,
            Tier::Vip => self.policy.vip_max_keys,
        }
    }

    pub fn data_limit_for_tier(&self, tier: Tier) -> i64 {
        self.policy.data_limit_bytes(tier)
    }

    pub fn billing_cycle_secs(&self) -> i64 {
        self.policy.billing_cycle_secs()
    }

    pub fn decide(&self, active_keys: i64, tier: Tier) -> QuotaDecision {
        let max = self.max_keys_for_tier(tier);
        if active_keys < max {
            QuotaDecision::allow()
        } else {
            QuotaDecision::deny(QuotaDenial::KeyLimitReached {
                active: active_keys,
                max,
            })
        }
    }

    /// Считает только активные ключи пользователя. Решение не атомарно с созданием.
    pub async fn can_create_key(
        &self,
        repo: &dyn KeyRepository,
        owner_id: i64,
        tier: Tier,
    ) -> Result<QuotaDecision, RepoError> {
        let active = repo.count_active_for_user(owner_id).await?;
        Ok(self.decide(active, tier))
    }

    /// Лимит достигнут уже при равенстве.
    pub fn is_over_data_cap(&self, key: &VpnKey, live_used_bytes: i64) -> bool {
        live_used_bytes >= key.data_limit_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockKeyRepository;
    use crate::model::{BYTES_PER_GIB, BackendType};

    fn enforcer() -> QuotaEnforcer {
        QuotaEnforcer::new(QuotaConfig::default())
    }

    fn key_with_limit(limit: i64) -> VpnKey {
        VpnKey {
            id: 1,
            owner_id: 7,
            backend_type: BackendType::Outline,
            display_name: "phone".to_string(),
            external_reference: "3".to_string(),
            credential_material: String::new(),
            is_active: true,
            data_limit_bytes: limit,
            used_bytes: 0,
            last_counter_bytes: 0,
            billing_cycle_start: 0,
            created_at: 0,
            last_synced_at: None,
        }
    }

    #[test]
    fn key_limit_boundary() {
        let q = enforcer();
        assert!(q.decide(1, Tier::Free).allowed);
        let denied = q.decide(2, Tier::Free);
        assert!(!denied.allowed);
        assert_eq!(
            denied.reason,
            Some(QuotaDenial::KeyLimitReached { active: 2, max: 2 })
        );
        assert!(q.decide(2, Tier::Vip).allowed);
        assert!(!q.decide(10, Tier::Vip).allowed);
    }

    #[test]
    fn data_cap_is_inclusive() {
        let q = enforcer();
        let key = key_with_limit(10 * BYTES_PER_GIB);
        assert!(!q.is_over_data_cap(&key, 5 * BYTES_PER_GIB));
        assert!(!q.is_over_data_cap(&key, 10 * BYTES_PER_GIB - 1));
        assert!(q.is_over_data_cap(&key, 10 * BYTES_PER_GIB));
        assert!(q.is_over_data_cap(&key, 11 * BYTES_PER_GIB));
    }

    #[test]
    fn tier_limits_come_from_policy() {
        let q = enforcer();
        assert_eq!(q.max_keys_for_tier(Tier::Free), 2);
        assert_eq!(q.data_limit_for_tier(Tier::Vip), 100 * BYTES_PER_GIB);
        assert_eq!(q.billing_cycle_secs(), 30 * 86_400);
    }

    #[tokio::test]
    async fn can_create_key_counts_active_keys() {
        let mut repo = MockKeyRepository::new();
        repo.expect_count_active_for_user()
            .withf(|owner| *owner == 7)
            .times(1)
            .returning(|_| Ok(2));
        let decision = enforcer()
            .can_create_key(&repo, 7, Tier::Free)
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn storage_failure_propagates() {
        let mut repo = MockKeyRepository::new();
        repo.expect_count_active_for_user()
            .returning(|_| Err(RepoError::Storage("disk".to_string())));
        let result = enforcer().can_create_key(&repo, 7, Tier::Free).await;
        assert!(matches!(result, Err(RepoError::Storage(_))));
    }
}
