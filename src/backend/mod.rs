//! Единый интерфейс к VPN-бэкендам (WireGuard, Outline).
//!
//! Каждый клиент сам переводит ошибки своего транспорта (таймауты, коды HTTP,
//! stderr утилиты `wg`) в [`BackendError`]; выше этого слоя транспортные
//! ошибки не поднимаются.

pub mod outline;
pub mod wireguard;

use crate::model::{BackendType, VpnKey};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MAX_DISPLAY_NAME_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Сеть, авторизация, таймаут, неразборчивый ответ. Можно повторить позже.
    #[error("Бэкенд недоступен: {0}")]
    Unavailable(String),
    /// Бэкенд сам отказал из-за своих лимитов.
    #[error("Бэкенд отказал по лимиту: {0}")]
    QuotaExceeded(String),
    #[error("Некорректные входные данные: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Active,
    Inactive,
    /// Сущность не найдена на бэкенде.
    Unknown,
    Error,
}

/// Живые данные о потреблении одного ключа.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    /// Кумулятивный счётчик бэкенда.
    pub bytes_transferred: i64,
    pub backend_status: BackendStatus,
}

impl UsageRecord {
    pub fn not_found() -> Self {
        Self {
            bytes_transferred: 0,
            backend_status: BackendStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub version: Option<String>,
    pub error_message: Option<String>,
}

impl HealthStatus {
    pub fn healthy(version: Option<String>) -> Self {
        Self {
            is_healthy: true,
            version,
            error_message: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            version: None,
            error_message: Some(error.into()),
        }
    }
}

/// Результат создания сущности на бэкенде.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub external_reference: String,
    pub credential_material: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VpnBackendClient: Send + Sync {
    async fn provision(
        &self,
        display_name: &str,
        data_limit_bytes: i64,
    ) -> Result<Provisioned, BackendError>;

    /// `Ok(false)`, если сущности уже нет: повторное удаление не ошибка.
    async fn deprovision(&self, external_reference: &str) -> Result<bool, BackendError>;

    /// Для исчезнувшей сущности возвращает статус `Unknown`, а не ошибку.
    async fn get_usage(&self, external_reference: &str) -> Result<UsageRecord, BackendError>;

    /// Приостанавливает или возобновляет передачу трафика, не удаляя сущность.
    /// `Ok(false)`, если сущности на бэкенде нет.
    async fn set_enabled(&self, key: &VpnKey, enabled: bool) -> Result<bool, BackendError>;

    async fn health_check(&self) -> HealthStatus;
}

/// Набор настроенных клиентов; выбор по типу делается один раз здесь.
#[derive(Clone, Default)]
pub struct Backends {
    wireguard: Option<Arc<dyn VpnBackendClient>>,
    outline: Option<Arc<dyn VpnBackendClient>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend_type: BackendType, client: Arc<dyn VpnBackendClient>) -> Self {
        match backend_type {
            BackendType::Wireguard => self.wireguard = Some(client),
            BackendType::Outline => self.outline = Some(client),
        }
        self
    }

    pub fn client(&self, backend_type: BackendType) -> Option<&Arc<dyn VpnBackendClient>> {
        match backend_type {
            BackendType::Wireguard => self.wireguard.as_ref(),
            BackendType::Outline => self.outline.as_ref(),
        }
    }

    pub fn configured(&self) -> Vec<BackendType> {
        BackendType::ALL
            .into_iter()
            .filter(|backend_type| self.client(*backend_type).is_some())
            .collect()
    }
}

/// Ограничивает вызов бэкенда по времени; таймаут равен недоступности.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Unavailable(format!(
            "{} не уложился в {} с",
            operation,
            limit.as_secs_f32()
        ))),
    }
}

pub fn validate_display_name(name: &str) -> Result<&str, BackendError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(BackendError::InvalidInput("пустое имя ключа".to_string()));
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(BackendError::InvalidInput(format!(
            "имя ключа длиннее {} символов",
            MAX_DISPLAY_NAME_CHARS
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(BackendError::InvalidInput(
            "имя ключа содержит управляющие символы".to_string(),
        ));
    }
    Ok(trimmed)
}
