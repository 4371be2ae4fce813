//! SQLite-слой: VPN-ключи, тарифы пользователей, журнал осиротевших ключей.

use crate::model::{
    BackendType, NewOrphanTask, NewVpnKey, OrphanTask, Tier, UsageUpdate, VpnKey, unix_now,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("Ключ {backend_type}:{external_reference} уже существует")]
    DuplicateKey {
        backend_type: BackendType,
        external_reference: String,
    },
    #[error("Ошибка хранилища: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        RepoError::Storage(error.to_string())
    }
}

/// Хранилище VPN-ключей. Бизнес-логики здесь нет.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Ошибка `DuplicateKey`, если пара (backend_type, external_reference) уже есть.
    async fn create(&self, key: &NewVpnKey) -> Result<VpnKey, RepoError>;

    async fn get(&self, id: i64) -> Result<Option<VpnKey>, RepoError>;

    async fn get_by_external_reference(
        &self,
        backend_type: BackendType,
        external_reference: &str,
    ) -> Result<Option<VpnKey>, RepoError>;

    async fn list_for_user(&self, owner_id: i64) -> Result<Vec<VpnKey>, RepoError>;

    async fn list_all(&self) -> Result<Vec<VpnKey>, RepoError>;

    /// Пишет только поля учёта. `false`, если ключа нет или период уже сменился.
    async fn update_usage(&self, id: i64, update: &UsageUpdate) -> Result<bool, RepoError>;

    /// `false`, если записи уже не было.
    async fn delete(&self, id: i64) -> Result<bool, RepoError>;

    async fn count_active_for_user(&self, owner_id: i64) -> Result<i64, RepoError>;

    async fn rename(&self, id: i64, display_name: &str) -> Result<bool, RepoError>;

    async fn set_active(&self, id: i64, is_active: bool) -> Result<bool, RepoError>;

    async fn set_data_limit(&self, id: i64, data_limit_bytes: i64) -> Result<bool, RepoError>;

    /// Обнуляет трафик периода; счётчик бэкенда остаётся базой.
    async fn reset_billing_cycle(&self, id: i64, cycle_start: i64) -> Result<bool, RepoError>;

    async fn record_orphan(&self, task: &NewOrphanTask) -> Result<i64, RepoError>;

    async fn list_open_orphans(&self, limit: i64) -> Result<Vec<OrphanTask>, RepoError>;

    async fn resolve_orphan(&self, id: i64) -> Result<bool, RepoError>;

    async fn fail_orphan_attempt(&self, id: i64, error: &str) -> Result<bool, RepoError>;
}

/// Внешний источник тарифа пользователя.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TierLookup: Send + Sync {
    async fn get_tier(&self, owner_id: i64) -> Result<Tier, RepoError>;
}

const KEY_COLUMNS: &str = "id, owner_id, backend_type, display_name, external_reference, credential_material, is_active, data_limit_bytes, used_bytes, last_counter_bytes, billing_cycle_start, created_at, last_synced_at";

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vpn_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                backend_type TEXT NOT NULL,
                display_name TEXT NOT NULL,
                external_reference TEXT NOT NULL,
                credential_material TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                data_limit_bytes INTEGER NOT NULL,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                last_counter_bytes INTEGER NOT NULL DEFAULT 0,
                billing_cycle_start INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_synced_at INTEGER,
                UNIQUE(backend_type, external_reference)
            );
            CREATE INDEX IF NOT EXISTS idx_vpn_keys_owner ON vpn_keys(owner_id);
            CREATE INDEX IF NOT EXISTS idx_vpn_keys_cycle ON vpn_keys(billing_cycle_start);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция vpn_keys: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_tiers (
                owner_id INTEGER PRIMARY KEY,
                tier TEXT NOT NULL DEFAULT 'free',
                vip_until INTEGER,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reconciliation_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backend_type TEXT NOT NULL,
                external_reference TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_reconciliation_open ON reconciliation_tasks(resolved_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция user_tiers/reconciliation_tasks: {}", e))?;

        Ok(())
    }

    /// Назначает тариф. `vip_until = None` для VIP означает бессрочно.
    pub async fn set_tier(
        &self,
        owner_id: i64,
        tier: Tier,
        vip_until: Option<i64>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO user_tiers (owner_id, tier, vip_until, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET
                 tier = excluded.tier,
                 vip_until = excluded.vip_until,
                 updated_at = excluded.updated_at",
        )
        .bind(owner_id)
        .bind(tier)
        .bind(vip_until)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for Db {
    async fn create(&self, key: &NewVpnKey) -> Result<VpnKey, RepoError> {
        let result = sqlx::query_as::<_, VpnKey>(&format!(
            "INSERT INTO vpn_keys
             (owner_id, backend_type, display_name, external_reference, credential_material, is_active, data_limit_bytes, used_bytes, last_counter_bytes, billing_cycle_start, created_at)
             VALUES (?, ?, ?, ?, ?, 1, ?, 0, 0, ?, ?)
             RETURNING {}",
            KEY_COLUMNS
        ))
        .bind(key.owner_id)
        .bind(key.backend_type)
        .bind(&key.display_name)
        .bind(&key.external_reference)
        .bind(&key.credential_material)
        .bind(key.data_limit_bytes)
        .bind(key.created_at)
        .bind(key.created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db_err| db_err.is_unique_violation()) =>
            {
                Err(RepoError::DuplicateKey {
                    backend_type: key.backend_type,
                    external_reference: key.external_reference.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<VpnKey>, RepoError> {
        let row = sqlx::query_as::<_, VpnKey>(&format!(
            "SELECT {} FROM vpn_keys WHERE id = ?",
            KEY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_by_external_reference(
        &self,
        backend_type: BackendType,
        external_reference: &str,
    ) -> Result<Option<VpnKey>, RepoError> {
        let row = sqlx::query_as::<_, VpnKey>(&format!(
            "SELECT {} FROM vpn_keys WHERE backend_type = ? AND external_reference = ?",
            KEY_COLUMNS
        ))
        .bind(backend_type)
        .bind(external_reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_for_user(&self, owner_id: i64) -> Result<Vec<VpnKey>, RepoError> {
        let rows = sqlx::query_as::<_, VpnKey>(&format!(
            "SELECT {} FROM vpn_keys WHERE owner_id = ?",
            KEY_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_all(&self) -> Result<Vec<VpnKey>, RepoError> {
        let rows = sqlx::query_as::<_, VpnKey>(&format!(
            "SELECT {} FROM vpn_keys ORDER BY id ASC",
            KEY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_usage(&self, id: i64, update: &UsageUpdate) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE vpn_keys
             SET used_bytes = MAX(used_bytes, ?),
                 last_counter_bytes = ?,
                 last_synced_at = ?
             WHERE id = ? AND billing_cycle_start = ?",
        )
        .bind(update.used_bytes)
        .bind(update.counter_bytes)
        .bind(update.synced_at)
        .bind(id)
        .bind(update.cycle_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM vpn_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_active_for_user(&self, owner_id: i64) -> Result<i64, RepoError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM vpn_keys WHERE owner_id = ? AND is_active = 1",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn rename(&self, id: i64, display_name: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE vpn_keys SET display_name = ? WHERE id = ?")
            .bind(display_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_active(&self, id: i64, is_active: bool) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE vpn_keys SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_data_limit(&self, id: i64, data_limit_bytes: i64) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE vpn_keys SET data_limit_bytes = ? WHERE id = ?")
            .bind(data_limit_bytes)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_billing_cycle(&self, id: i64, cycle_start: i64) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE vpn_keys SET used_bytes = 0, billing_cycle_start = ? WHERE id = ?",
        )
        .bind(cycle_start)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_orphan(&self, task: &NewOrphanTask) -> Result<i64, RepoError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO reconciliation_tasks (backend_type, external_reference, reason, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(task.backend_type)
        .bind(&task.external_reference)
        .bind(&task.reason)
        .bind(unix_now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_open_orphans(&self, limit: i64) -> Result<Vec<OrphanTask>, RepoError> {
        let rows = sqlx::query_as::<_, OrphanTask>(
            "SELECT id, backend_type, external_reference, reason, attempts, last_error, created_at
             FROM reconciliation_tasks
             WHERE resolved_at IS NULL
             ORDER BY attempts ASC, created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn resolve_orphan(&self, id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE reconciliation_tasks SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_orphan_attempt(&self, id: i64, error: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE reconciliation_tasks SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TierLookup for Db {
    async fn get_tier(&self, owner_id: i64) -> Result<Tier, RepoError> {
        let row = sqlx::query_as::<_, (Tier, Option<i64>)>(
            "SELECT tier, vip_until FROM user_tiers WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((Tier::Vip, None)) => Tier::Vip,
            Some((Tier::Vip, Some(until))) if until > unix_now() => Tier::Vip,
            _ => Tier::Free,
        })
    }
}
