//! Жизненный цикл VPN-ключа: создание, удаление, сводка по пользователю.
//!
//! Каждая операция здесь короткая сага поверх двух независимых систем:
//! бэкенда и локальной БД. Ошибки нижних слоёв переводятся в
//! [`LifecycleError`] только на этой границе.

use crate::backend::{
    BackendError, BackendStatus, Backends, HealthStatus, validate_display_name,
};
use crate::db::{KeyRepository, RepoError, TierLookup};
use crate::model::{BackendType, NewOrphanTask, NewVpnKey, Tier, VpnKey, unix_now};
use crate::quota::{QuotaDenial, QuotaEnforcer};
use crate::reconciler::{ReconcileError, UsageReconciler, UsageView};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub const ORPHAN_REASON_CREATE: &str = "create_compensation_failed";
pub const ORPHAN_REASON_DELETE: &str = "delete_backend_failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Превышена квота: {0}")]
    QuotaExceeded(QuotaDenial),
    #[error("Бэкенд отказал по лимиту: {0}")]
    BackendQuotaExceeded(String),
    #[error("Бэкенд недоступен: {0}")]
    BackendUnavailable(String),
    #[error("Некорректные данные: {0}")]
    InvalidInput(String),
    #[error("Ключ {0} не найден")]
    KeyNotFound(i64),
    #[error("Ключ {backend_type}:{external_reference} уже существует")]
    DuplicateKey {
        backend_type: BackendType,
        external_reference: String,
    },
    #[error("Бэкенд {0} не настроен")]
    BackendNotConfigured(BackendType),
    #[error("Ошибка хранилища: {0}")]
    Storage(String),
}

impl From<BackendError> for LifecycleError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unavailable(msg) => LifecycleError::BackendUnavailable(msg),
            BackendError::QuotaExceeded(msg) => LifecycleError::BackendQuotaExceeded(msg),
            BackendError::InvalidInput(msg) => LifecycleError::InvalidInput(msg),
        }
    }
}

impl From<RepoError> for LifecycleError {
    fn from(error: RepoError) -> Self {
        match error {
            RepoError::DuplicateKey {
                backend_type,
                external_reference,
            } => LifecycleError::DuplicateKey {
                backend_type,
                external_reference,
            },
            RepoError::Storage(msg) => LifecycleError::Storage(msg),
        }
    }
}

impl From<ReconcileError> for LifecycleError {
    fn from(error: ReconcileError) -> Self {
        match error {
            ReconcileError::BackendNotConfigured(backend_type) => {
                LifecycleError::BackendNotConfigured(backend_type)
            }
        }
    }
}

impl LifecycleError {
    /// Сообщение для конечного пользователя, без деталей транспорта.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::QuotaExceeded(denial) => format!(
                "Недостаточно квоты: {}. Удалите один из ключей или перейдите на VIP.",
                denial
            ),
            LifecycleError::BackendQuotaExceeded(_) => {
                "На сервере закончились свободные места. Попробуйте другой тип ключа или обратитесь к администратору."
                    .to_string()
            }
            LifecycleError::BackendUnavailable(_) => {
                "Сервис временно недоступен. Попробуйте позже.".to_string()
            }
            LifecycleError::KeyNotFound(_) => "Ключ уже удалён или не найден.".to_string(),
            LifecycleError::InvalidInput(msg) => format!("Некорректные данные: {}", msg),
            LifecycleError::DuplicateKey { .. }
            | LifecycleError::BackendNotConfigured(_)
            | LifecycleError::Storage(_) => {
                "Внутренняя ошибка. Администратор уже уведомлён.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted,
    /// Запись в БД удалена, ключ на бэкенде мог остаться.
    OrphanedOnServer,
    /// Ключ на бэкенде удалён, запись в БД осталась.
    OrphanedInDatabase,
    Failed,
}

/// Итог удаления: обе стороны отдельно.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub key_id: i64,
    pub owner_id: i64,
    pub key_name: String,
    pub backend_type: BackendType,
    pub server_deleted: bool,
    pub db_deleted: bool,
    pub server_error: Option<String>,
    pub db_error: Option<String>,
}

impl DeletionReport {
    pub fn outcome(&self) -> DeletionOutcome {
        match (self.server_deleted, self.db_deleted) {
            (true, true) => DeletionOutcome::Deleted,
            (false, true) => DeletionOutcome::OrphanedOnServer,
            (true, false) => DeletionOutcome::OrphanedInDatabase,
            (false, false) => DeletionOutcome::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == DeletionOutcome::Deleted
    }
}

/// Итог включения или отключения ключа. БД меняется только после бэкенда.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub key_id: i64,
    pub owner_id: i64,
    pub key_name: String,
    pub backend_type: BackendType,
    pub is_active: bool,
    pub server_applied: bool,
    pub db_updated: bool,
    pub server_error: Option<String>,
    pub db_error: Option<String>,
}

impl ActivationReport {
    pub fn is_success(&self) -> bool {
        self.server_applied && self.db_updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub key: VpnKey,
    pub usage: UsageView,
    pub over_cap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub owner_id: i64,
    pub tier: Tier,
    pub max_keys: i64,
    pub keys: Vec<KeyStatus>,
    pub total_keys: usize,
    pub active_keys: usize,
    pub total_used_bytes: i64,
    pub total_limit_bytes: i64,
}

pub struct KeyLifecycleService {
    repo: Arc<dyn KeyRepository>,
    tiers: Arc<dyn TierLookup>,
    backends: Backends,
    quota: QuotaEnforcer,
    reconciler: UsageReconciler,
}

impl KeyLifecycleService {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        tiers: Arc<dyn TierLookup>,
        backends: Backends,
        quota: QuotaEnforcer,
    ) -> Self {
        let reconciler = UsageReconciler::new(repo.clone(), backends.clone());
        Self {
            repo,
            tiers,
            backends,
            quota,
            reconciler,
        }
    }

    pub fn repo(&self) -> &Arc<dyn KeyRepository> {
        &self.repo
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    pub fn reconciler(&self) -> &UsageReconciler {
        &self.reconciler
    }

    pub async fn create(
        &self,
        owner_id: i64,
        backend_type: BackendType,
        display_name: &str,
    ) -> Result<VpnKey, LifecycleError> {
        let display_name = validate_display_name(display_name)?;
        let client = self
            .backends
            .client(backend_type)
            .ok_or(LifecycleError::BackendNotConfigured(backend_type))?;

        let tier = self.tiers.get_tier(owner_id).await?;
        let decision = self
            .quota
            .can_create_key(self.repo.as_ref(), owner_id, tier)
            .await?;
        if let (false, Some(reason)) = (decision.allowed, decision.reason) {
            info!(owner_id, %tier, %reason, "Key creation denied by quota");
            return Err(LifecycleError::QuotaExceeded(reason));
        }

        let data_limit_bytes = self.quota.data_limit_for_tier(tier);
        let provisioned = client.provision(display_name, data_limit_bytes).await?;

        let new_key = NewVpnKey {
            owner_id,
            backend_type,
            display_name: display_name.to_string(),
            external_reference: provisioned.external_reference.clone(),
            credential_material: provisioned.credential_material,
            data_limit_bytes,
            created_at: unix_now(),
        };

        match self.repo.create(&new_key).await {
            Ok(key) => {
                info!(
                    key_id = key.id,
                    owner_id,
                    backend = %backend_type,
                    external_reference = %key.external_reference,
                    "Key created"
                );
                Ok(key)
            }
            Err(err) => {
                error!(
                    owner_id,
                    backend = %backend_type,
                    external_reference = %provisioned.external_reference,
                    error = %err,
                    "Failed to store provisioned key, rolling back on backend"
                );
                match client.deprovision(&provisioned.external_reference).await {
                    Ok(_) => info!(
                        backend = %backend_type,
                        external_reference = %provisioned.external_reference,
                        "Provisioned key rolled back"
                    ),
                    Err(rollback_err) => {
                        self.record_orphan(
                            backend_type,
                            &provisioned.external_reference,
                            ORPHAN_REASON_CREATE,
                            &rollback_err,
                        )
                        .await
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Удаление ключа владельцем. Чужой ключ неотличим от отсутствующего.
    pub async fn delete(&self, owner_id: i64, key_id: i64) -> Result<DeletionReport, LifecycleError> {
        let key = self
            .repo
            .get(key_id)
            .await?
            .filter(|key| key.owner_id == owner_id)
            .ok_or(LifecycleError::KeyNotFound(key_id))?;
        Ok(self.delete_key(&key).await)
    }

    /// То же удаление без проверки владельца.
    pub async fn admin_delete_any(&self, key_id: i64) -> Result<DeletionReport, LifecycleError> {
        let key = self
            .repo
            .get(key_id)
            .await?
            .ok_or(LifecycleError::KeyNotFound(key_id))?;
        Ok(self.delete_key(&key).await)
    }

    async fn delete_key(&self, key: &VpnKey) -> DeletionReport {
        let (server_deleted, server_error) = match self.backends.client(key.backend_type) {
            Some(client) => match client.deprovision(&key.external_reference).await {
                Ok(_) => (true, None),
                Err(err) => (false, Some(err.to_string())),
            },
            None => (
                false,
                Some(LifecycleError::BackendNotConfigured(key.backend_type).to_string()),
            ),
        };

        // ответ false значит, что запись уже удалил параллельный запрос
        let (db_deleted, db_error) = match self.repo.delete(key.id).await {
            Ok(_) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };

        let report = DeletionReport {
            key_id: key.id,
            owner_id: key.owner_id,
            key_name: key.display_name.clone(),
            backend_type: key.backend_type,
            server_deleted,
            db_deleted,
            server_error,
            db_error,
        };

        match report.outcome() {
            DeletionOutcome::Deleted => info!(
                key_id = key.id,
                owner_id = key.owner_id,
                backend = %key.backend_type,
                "Key deleted"
            ),
            DeletionOutcome::OrphanedOnServer => {
                warn!(
                    key_id = key.id,
                    backend = %key.backend_type,
                    external_reference = %key.external_reference,
                    error = report.server_error.as_deref().unwrap_or_default(),
                    "Key removed locally, backend removal not confirmed"
                );
                let reason = report.server_error.clone().unwrap_or_default();
                self.record_orphan(
                    key.backend_type,
                    &key.external_reference,
                    ORPHAN_REASON_DELETE,
                    &reason,
                )
                .await;
            }
            DeletionOutcome::OrphanedInDatabase => warn!(
                key_id = key.id,
                error = report.db_error.as_deref().unwrap_or_default(),
                "Key removed on backend, local record left behind"
            ),
            DeletionOutcome::Failed => warn!(
                key_id = key.id,
                server_error = report.server_error.as_deref().unwrap_or_default(),
                db_error = report.db_error.as_deref().unwrap_or_default(),
                "Key deletion failed on both sides"
            ),
        }

        report
    }

    async fn record_orphan(
        &self,
        backend_type: BackendType,
        external_reference: &str,
        reason: &str,
        cause: &dyn std::fmt::Display,
    ) {
        let task = NewOrphanTask {
            backend_type,
            external_reference: external_reference.to_string(),
            reason: reason.to_string(),
        };
        match self.repo.record_orphan(&task).await {
            Ok(task_id) => warn!(
                task_id,
                backend = %backend_type,
                external_reference,
                reason,
                cause = %cause,
                "Orphaned backend key queued for cleanup"
            ),
            Err(err) => error!(
                backend = %backend_type,
                external_reference,
                reason,
                cause = %cause,
                error = %err,
                "Orphaned backend key could not be queued, manual cleanup required"
            ),
        }
    }

    pub async fn get_user_summary(&self, owner_id: i64) -> Result<UserSummary, LifecycleError> {
        let tier = self.tiers.get_tier(owner_id).await?;
        let mut keys = self.repo.list_for_user(owner_id).await?;
        keys.sort_by_key(|key| (key.created_at, key.id));

        let mut statuses = Vec::with_capacity(keys.len());
        for key in keys {
            let usage = match self.reconciler.reconcile(&key).await {
                Ok(usage) => usage,
                Err(err) => {
                    warn!(key_id = key.id, error = %err, "Showing cached usage");
                    UsageView::from_cache(&key, BackendStatus::Error, None)
                }
            };
            let over_cap = self.quota.is_over_data_cap(&key, usage.used_bytes);
            statuses.push(KeyStatus {
                key,
                usage,
                over_cap,
            });
        }

        Ok(UserSummary {
            owner_id,
            tier,
            max_keys: self.quota.max_keys_for_tier(tier),
            total_keys: statuses.len(),
            active_keys: statuses.iter().filter(|s| s.key.is_active).count(),
            total_used_bytes: statuses.iter().map(|s| s.usage.used_bytes).sum(),
            total_limit_bytes: statuses.iter().map(|s| s.key.data_limit_bytes).sum(),
            keys: statuses,
        })
    }

    pub async fn rename(
        &self,
        owner_id: i64,
        key_id: i64,
        display_name: &str,
    ) -> Result<(), LifecycleError> {
        let display_name = validate_display_name(display_name)?;
        self.repo
            .get(key_id)
            .await?
            .filter(|key| key.owner_id == owner_id)
            .ok_or(LifecycleError::KeyNotFound(key_id))?;
        if !self.repo.rename(key_id, display_name).await? {
            return Err(LifecycleError::KeyNotFound(key_id));
        }
        info!(key_id, owner_id, "Key renamed");
        Ok(())
    }

    pub async fn set_active(
        &self,
        key_id: i64,
        is_active: bool,
    ) -> Result<ActivationReport, LifecycleError> {
        let key = self
            .repo
            .get(key_id)
            .await?
            .ok_or(LifecycleError::KeyNotFound(key_id))?;
        Ok(self.set_key_active(&key, is_active).await)
    }

    /// Сначала бэкенд приостанавливает или возобновляет трафик, затем
    /// меняется флаг в БД. Отсутствующая на бэкенде сущность уже не
    /// пропускает трафик, поэтому для отключения это успех.
    pub async fn set_key_active(&self, key: &VpnKey, is_active: bool) -> ActivationReport {
        let (server_applied, server_error) = match self.backends.client(key.backend_type) {
            Some(client) => match client.set_enabled(key, is_active).await {
                Ok(true) => (true, None),
                Ok(false) if !is_active => (true, None),
                Ok(false) => (
                    false,
                    Some(format!("ключ {} отсутствует на бэкенде", key.external_reference)),
                ),
                Err(err) => (false, Some(err.to_string())),
            },
            None => (
                false,
                Some(LifecycleError::BackendNotConfigured(key.backend_type).to_string()),
            ),
        };

        let (db_updated, db_error) = if server_applied {
            match self.repo.set_active(key.id, is_active).await {
                Ok(true) => (true, None),
                Ok(false) => (false, Some(LifecycleError::KeyNotFound(key.id).to_string())),
                Err(err) => (false, Some(err.to_string())),
            }
        } else {
            (false, None)
        };

        let report = ActivationReport {
            key_id: key.id,
            owner_id: key.owner_id,
            key_name: key.display_name.clone(),
            backend_type: key.backend_type,
            is_active,
            server_applied,
            db_updated,
            server_error,
            db_error,
        };

        if report.is_success() {
            info!(key_id = key.id, is_active, backend = %key.backend_type, "Key activity changed");
        } else {
            warn!(
                key_id = key.id,
                is_active,
                server_applied,
                db_updated,
                server_error = report.server_error.as_deref().unwrap_or_default(),
                db_error = report.db_error.as_deref().unwrap_or_default(),
                "Key activity change incomplete"
            );
        }
        report
    }

    pub async fn set_data_limit(
        &self,
        key_id: i64,
        data_limit_bytes: i64,
    ) -> Result<(), LifecycleError> {
        if data_limit_bytes <= 0 {
            return Err(LifecycleError::InvalidInput(
                "лимит трафика должен быть больше нуля".to_string(),
            ));
        }
        if !self.repo.set_data_limit(key_id, data_limit_bytes).await? {
            return Err(LifecycleError::KeyNotFound(key_id));
        }
        info!(key_id, data_limit_bytes, "Key data limit changed");
        Ok(())
    }

    /// Начинает новый период с текущего момента. Счётчики бэкенда не трогаются.
    pub async fn reset_billing_cycle(&self, key_id: i64) -> Result<(), LifecycleError> {
        if !self.repo.reset_billing_cycle(key_id, unix_now()).await? {
            return Err(LifecycleError::KeyNotFound(key_id));
        }
        info!(key_id, "Billing cycle reset");
        Ok(())
    }

    pub async fn health(&self) -> Vec<(BackendType, HealthStatus)> {
        let mut report = Vec::new();
        for backend_type in self.backends.configured() {
            if let Some(client) = self.backends.client(backend_type) {
                report.push((backend_type, client.health_check().await));
            }
        }
        report
    }
}
