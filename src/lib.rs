//! vpnkey-admin: жизненный цикл VPN-ключей (WireGuard и Outline) и учёт трафика.

pub mod backend;
pub mod config;
pub mod credentials;
pub mod db;
pub mod format;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod quota;
pub mod reconciler;
pub mod sync;
