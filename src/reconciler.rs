//! Сверка трафика ключа между бэкендом и локальной БД.
//!
//! Счётчики бэкендов не сбрасываются вместе с расчётным периодом. Поэтому в
//! БД хранится последний увиденный счётчик, а трафик периода накапливается
//! приращениями. Уменьшение счётчика трактуется по [`CounterKind`] бэкенда.

use crate::backend::{BackendError, BackendStatus, Backends};
use crate::db::KeyRepository;
use crate::model::{BackendType, CounterKind, UsageUpdate, VpnKey, unix_now};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("Бэкенд {0} не настроен")]
    BackendNotConfigured(BackendType),
}

/// Ключ есть в БД, но не на бэкенде.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyFault {
    pub key_id: i64,
    pub backend_type: BackendType,
    pub external_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageView {
    pub key_id: i64,
    /// Трафик за текущий период.
    pub used_bytes: i64,
    /// Сырой счётчик бэкенда, если его удалось получить.
    pub live_counter: Option<i64>,
    pub status: BackendStatus,
    /// `true`, когда значение взято из БД, а не с бэкенда.
    pub stale: bool,
    pub synced_at: Option<i64>,
    pub fault: Option<ConsistencyFault>,
}

impl UsageView {
    /// Представление по данным из БД, без обращения к бэкенду.
    pub fn from_cache(key: &VpnKey, status: BackendStatus, fault: Option<ConsistencyFault>) -> Self {
        Self {
            key_id: key.id,
            used_bytes: key.used_bytes,
            live_counter: None,
            status,
            stale: true,
            synced_at: key.last_synced_at,
            fault,
        }
    }
}

/// Прибавляет к трафику периода приращение счётчика.
///
/// Если счётчик уменьшился, кумулятивный счётчик перезапустился и всё его
/// значение новое. Скользящее окно просто потеряло старый трафик, и
/// приращения нет: новая база отсчёта равна текущему значению.
pub fn accumulate_usage(
    used_bytes: i64,
    last_counter: i64,
    live_counter: i64,
    kind: CounterKind,
) -> i64 {
    let delta = if live_counter >= last_counter {
        live_counter - last_counter
    } else {
        match kind {
            CounterKind::Cumulative => live_counter,
            CounterKind::RollingWindow => 0,
        }
    };
    used_bytes.saturating_add(delta.max(0))
}

#[derive(Clone)]
pub struct UsageReconciler {
    repo: Arc<dyn KeyRepository>,
    backends: Backends,
}

impl UsageReconciler {
    pub fn new(repo: Arc<dyn KeyRepository>, backends: Backends) -> Self {
        Self { repo, backends }
    }

    /// Ошибки бэкенда не пробрасываются: они превращаются в `stale` или `fault`.
    pub async fn reconcile(&self, key: &VpnKey) -> Result<UsageView, ReconcileError> {
        let client = self
            .backends
            .client(key.backend_type)
            .ok_or(ReconcileError::BackendNotConfigured(key.backend_type))?;

        let record = match client.get_usage(&key.external_reference).await {
            Ok(record) => record,
            Err(err) => {
                match &err {
                    BackendError::Unavailable(_) => debug!(
                        key_id = key.id,
                        backend = %key.backend_type,
                        error = %err,
                        "Backend unavailable, serving cached usage"
                    ),
                    _ => warn!(
                        key_id = key.id,
                        backend = %key.backend_type,
                        error = %err,
                        "Usage query rejected, serving cached usage"
                    ),
                }
                return Ok(UsageView::from_cache(key, BackendStatus::Error, None));
            }
        };

        if record.backend_status == BackendStatus::Unknown {
            warn!(
                key_id = key.id,
                backend = %key.backend_type,
                external_reference = %key.external_reference,
                "Key exists locally but not on backend"
            );
            let fault = ConsistencyFault {
                key_id: key.id,
                backend_type: key.backend_type,
                external_reference: key.external_reference.clone(),
            };
            return Ok(UsageView::from_cache(key, BackendStatus::Unknown, Some(fault)));
        }

        let live = record.bytes_transferred;
        let used_bytes = accumulate_usage(
            key.used_bytes,
            key.last_counter_bytes,
            live,
            key.backend_type.counter_kind(),
        );
        let synced_at = unix_now();
        let update = UsageUpdate {
            used_bytes,
            counter_bytes: live,
            synced_at,
            cycle_start: key.billing_cycle_start,
        };

        match self.repo.update_usage(key.id, &update).await {
            Ok(true) => {}
            Ok(false) => debug!(
                key_id = key.id,
                "Usage not persisted: key removed or billing cycle changed"
            ),
            Err(err) => warn!(key_id = key.id, error = %err, "Failed to persist usage"),
        }

        Ok(UsageView {
            key_id: key.id,
            used_bytes,
            live_counter: Some(live),
            status: record.backend_status,
            stale: false,
            synced_at: Some(synced_at),
            fault: None,
        })
    }
}
