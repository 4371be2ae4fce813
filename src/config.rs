//! Конфигурация из TOML-файла.

use crate::model::{BYTES_PER_GIB, Tier};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const BOT_TOKEN_ENV: &str = "VPNKEY_BOT_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Не удалось прочитать конфиг {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Не удалось разобрать конфиг: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Некорректный конфиг: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub wireguard: Option<WireguardConfig>,
    pub outline: Option<OutlineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_free_max_keys")]
    pub free_max_keys: i64,
    #[serde(default = "default_vip_max_keys")]
    pub vip_max_keys: i64,
    #[serde(default = "default_free_data_limit_gb")]
    pub free_data_limit_gb: i64,
    #[serde(default = "default_vip_data_limit_gb")]
    pub vip_data_limit_gb: i64,
    #[serde(default = "default_billing_cycle_days")]
    pub billing_cycle_days: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_max_keys: default_free_max_keys(),
            vip_max_keys: default_vip_max_keys(),
            free_data_limit_gb: default_free_data_limit_gb(),
            vip_data_limit_gb: default_vip_data_limit_gb(),
            billing_cycle_days: default_billing_cycle_days(),
        }
    }
}

impl QuotaConfig {
    pub fn data_limit_bytes(&self, tier: Tier) -> i64 {
        let gb = match tier {
            Tier::Free => self.free_data_limit_gb,
            Tier::Vip => self.vip_data_limit_gb,
        };
        gb.saturating_mul(BYTES_PER_GIB)
    }

    pub fn billing_cycle_secs(&self) -> i64 {
        self.billing_cycle_days.saturating_mul(86_400)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireguardConfig {
    #[serde(default = "default_wg_interface")]
    pub interface: String,
    pub endpoint: String,
    pub subnet: String,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    pub max_peers: Option<usize>,
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub save_config: bool,
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineConfig {
    pub api_url: String,
    pub cert_sha256: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vpnkey-admin/keys.db")
}

fn default_backend_timeout_secs() -> u64 {
    10
}

fn default_free_max_keys() -> i64 {
    2
}

fn default_vip_max_keys() -> i64 {
    10
}

fn default_free_data_limit_gb() -> i64 {
    10
}

fn default_vip_data_limit_gb() -> i64 {
    100
}

fn default_billing_cycle_days() -> i64 {
    30
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_wg_interface() -> String {
    "wg0".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string()]
}

fn default_keepalive() -> u16 {
    25
}

fn default_wg_binary() -> String {
    "wg".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.wireguard.is_none() && self.outline.is_none() {
            return Err(ConfigError::Invalid(
                "не настроен ни один бэкенд ([wireguard] или [outline])".to_string(),
            ));
        }
        if self.backend_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_secs должен быть больше нуля".to_string(),
            ));
        }
        let q = &self.quota;
        if q.free_max_keys < 0 || q.vip_max_keys < 0 {
            return Err(ConfigError::Invalid(
                "лимиты ключей не могут быть отрицательными".to_string(),
            ));
        }
        if q.free_data_limit_gb <= 0 || q.vip_data_limit_gb <= 0 {
            return Err(ConfigError::Invalid(
                "лимиты трафика должны быть больше нуля".to_string(),
            ));
        }
        if q.billing_cycle_days <= 0 {
            return Err(ConfigError::Invalid(
                "billing_cycle_days должен быть больше нуля".to_string(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_secs должен быть больше нуля".to_string(),
            ));
        }
        if let Some(wg) = &self.wireguard {
            parse_subnet(&wg.subnet)?;
            if wg.interface.trim().is_empty() {
                return Err(ConfigError::Invalid("пустое имя интерфейса WireGuard".to_string()));
            }
            if !wg.endpoint.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "endpoint WireGuard должен быть в виде host:port, получено {}",
                    wg.endpoint
                )));
            }
        }
        if let Some(outline) = &self.outline
            && !(outline.api_url.starts_with("https://") || outline.api_url.starts_with("http://"))
        {
            return Err(ConfigError::Invalid(format!(
                "api_url Outline должен быть абсолютным URL, получено {}",
                outline.api_url
            )));
        }
        Ok(())
    }

    /// Токен бота: переменная окружения имеет приоритет над файлом.
    pub fn bot_token(&self) -> Option<String> {
        std::env::var(BOT_TOKEN_ENV)
            .ok()
            .or_else(|| self.bot_token.clone())
            .filter(|token| !token.trim().is_empty())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

/// Разбирает подсеть вида `10.8.0.0/24` в (адрес сети, длина префикса).
pub fn parse_subnet(raw: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let (addr, prefix) = raw
        .split_once('/')
        .ok_or_else(|| ConfigError::Invalid(format!("подсеть без префикса: {}", raw)))?;
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("некорректный адрес подсети: {}", raw)))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("некорректный префикс подсети: {}", raw)))?;
    if !(8..=30).contains(&prefix) {
        return Err(ConfigError::Invalid(format!(
            "префикс подсети должен быть от 8 до 30: {}",
            raw
        )));
    }
    let mask = u32::MAX << (32 - prefix);
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix))
}
