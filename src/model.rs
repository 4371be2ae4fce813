//! Доменные типы: VPN-ключи, тарифы, записи для сверки.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const BYTES_PER_GIB: i64 = 1024 * 1024 * 1024;

/// Текущее время в секундах UNIX.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Wireguard,
    Outline,
}

impl BackendType {
    pub const ALL: [BackendType; 2] = [BackendType::Wireguard, BackendType::Outline];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Wireguard => "wireguard",
            BackendType::Outline => "outline",
        }
    }

    pub fn counter_kind(&self) -> CounterKind {
        match self {
            BackendType::Wireguard => CounterKind::Cumulative,
            BackendType::Outline => CounterKind::RollingWindow,
        }
    }
}

/// Как ведёт себя счётчик трафика бэкенда.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Растёт до перезапуска интерфейса, затем начинается с нуля.
    Cumulative,
    /// Сумма за скользящее окно (Outline `/metrics/transfer`): может уменьшаться
    /// без перезапуска, когда старый трафик выходит из окна.
    RollingWindow,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Неизвестный тип бэкенда: {0}")]
pub struct UnknownBackendType(pub String);

impl FromStr for BackendType {
    type Err = UnknownBackendType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Ok(BackendType::Wireguard),
            "outline" | "ss" => Ok(BackendType::Outline),
            other => Err(UnknownBackendType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Vip,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => f.write_str("free"),
            Tier::Vip => f.write_str("vip"),
        }
    }
}

#[derive(Debug, Error)]
#[error("Неизвестный тариф: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "vip" => Ok(Tier::Vip),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// Запись о VPN-ключе.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VpnKey {
    pub id: i64,
    pub owner_id: i64,
    pub backend_type: BackendType,
    pub display_name: String,
    /// Адрес ключа на бэкенде: публичный ключ пира WireGuard или id ключа Outline.
    pub external_reference: String,
    #[serde(skip)]
    pub credential_material: String,
    pub is_active: bool,
    pub data_limit_bytes: i64,
    /// Трафик за текущий расчётный период. Кеш, источник истины на бэкенде.
    pub used_bytes: i64,
    /// Последнее увиденное значение кумулятивного счётчика бэкенда.
    pub last_counter_bytes: i64,
    pub billing_cycle_start: i64,
    pub created_at: i64,
    pub last_synced_at: Option<i64>,
}

/// Данные для вставки нового ключа; id и счётчики назначает хранилище.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVpnKey {
    pub owner_id: i64,
    pub backend_type: BackendType,
    pub display_name: String,
    pub external_reference: String,
    pub credential_material: String,
    pub data_limit_bytes: i64,
    pub created_at: i64,
}

/// Узкое обновление учёта трафика после успешной сверки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    pub used_bytes: i64,
    pub counter_bytes: i64,
    pub synced_at: i64,
    /// Начало периода, для которого посчитан `used_bytes`.
    pub cycle_start: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrphanTask {
    pub id: i64,
    pub backend_type: BackendType,
    pub external_reference: String,
    pub reason: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrphanTask {
    pub backend_type: BackendType,
    pub external_reference: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_type_parses_aliases() {
        assert_eq!("WireGuard".parse::<BackendType>().unwrap(), BackendType::Wireguard);
        assert_eq!("wg".parse::<BackendType>().unwrap(), BackendType::Wireguard);
        assert_eq!(" outline ".parse::<BackendType>().unwrap(), BackendType::Outline);
        assert!("openvpn".parse::<BackendType>().is_err());
    }

    #[test]
    fn tier_display_matches_parse() {
        for tier in [Tier::Free, Tier::Vip] {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
    }
}
