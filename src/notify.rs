//! Уведомления владельцам ключей и администраторам.
//!
//! Доставка «выстрелил и забыл»: ошибки отправки только логируются.

use crate::format::{backend_label, format_bytes, render_deletion_report};
use crate::lifecycle::DeletionReport;
use crate::model::VpnKey;
use async_trait::async_trait;
use teloxide::prelude::*;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn key_deleted(&self, report: &DeletionReport);

    async fn data_cap_reached(&self, key: &VpnKey, used_bytes: i64);

    async fn admin_alert(&self, text: &str);
}

pub fn data_cap_text(key: &VpnKey, used_bytes: i64) -> String {
    format!(
        "⚠️ Ключ «{}» ({}) израсходовал лимит трафика: {} из {}.",
        key.display_name,
        backend_label(key.backend_type),
        format_bytes(used_bytes),
        format_bytes(key.data_limit_bytes)
    )
}

pub struct TelegramNotifier {
    bot: Bot,
    admin_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, admin_ids: Vec<i64>) -> Self {
        Self { bot, admin_ids }
    }

    async fn send(&self, chat_id: i64, text: String) {
        if let Err(error) = self.bot.send_message(ChatId(chat_id), text).await {
            tracing::warn!(chat_id, error = %error, "Не удалось отправить уведомление");
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn key_deleted(&self, report: &DeletionReport) {
        self.send(report.owner_id, render_deletion_report(report)).await;
    }

    async fn data_cap_reached(&self, key: &VpnKey, used_bytes: i64) {
        self.send(key.owner_id, data_cap_text(key, used_bytes)).await;
    }

    async fn admin_alert(&self, text: &str) {
        for admin_id in &self.admin_ids {
            self.send(*admin_id, format!("🛠 {}", text)).await;
        }
    }
}

/// Без бота: только запись в лог.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn key_deleted(&self, report: &DeletionReport) {
        tracing::info!(
            key_id = report.key_id,
            owner_id = report.owner_id,
            server_deleted = report.server_deleted,
            db_deleted = report.db_deleted,
            "Key deletion notice"
        );
    }

    async fn data_cap_reached(&self, key: &VpnKey, used_bytes: i64) {
        tracing::info!(
            key_id = key.id,
            owner_id = key.owner_id,
            used_bytes,
            data_limit_bytes = key.data_limit_bytes,
            "Data cap reached"
        );
    }

    async fn admin_alert(&self, text: &str) {
        tracing::warn!(alert = text, "Admin alert");
    }
}
