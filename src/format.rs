//! Человекочитаемое представление ключей, сводок и отчётов.

use crate::backend::{BackendStatus, HealthStatus};
use crate::lifecycle::{ActivationReport, DeletionOutcome, DeletionReport, KeyStatus, UserSummary};
use crate::model::{BackendType, VpnKey};
use chrono::{DateTime, Local, Utc};

pub fn format_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| "—".to_string())
}

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string()
        })
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

/// Двоичные единицы, один знак после запятой.
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["Б", "КиБ", "МиБ", "ГиБ", "ТиБ"];
    if bytes < 1024 {
        return format!("{} {}", bytes, UNITS[0]);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn backend_label(backend_type: BackendType) -> &'static str {
    match backend_type {
        BackendType::Wireguard => "WireGuard",
        BackendType::Outline => "Outline",
    }
}

fn status_label(status: BackendStatus) -> &'static str {
    match status {
        BackendStatus::Active => "активен",
        BackendStatus::Inactive => "неактивен",
        BackendStatus::Unknown => "не найден на сервере",
        BackendStatus::Error => "нет связи с сервером",
    }
}

pub fn render_key_line(key: &VpnKey) -> String {
    let state = if key.is_active { "вкл" } else { "выкл" };
    format!(
        "• #{} {} | {} | {} | {} из {} | создан {}",
        key.id,
        key.display_name,
        backend_label(key.backend_type),
        state,
        format_bytes(key.used_bytes),
        format_bytes(key.data_limit_bytes),
        format_date(key.created_at)
    )
}

fn render_key_status(status: &KeyStatus) -> String {
    let mut line = format!(
        "• #{} {} ({}): {} из {}, {}",
        status.key.id,
        status.key.display_name,
        backend_label(status.key.backend_type),
        format_bytes(status.usage.used_bytes),
        format_bytes(status.key.data_limit_bytes),
        status_label(status.usage.status)
    );
    if !status.key.is_active {
        line.push_str(", отключён");
    }
    if status.over_cap {
        line.push_str(", лимит исчерпан");
    }
    if status.usage.stale {
        let synced = status
            .usage
            .synced_at
            .map(format_timestamp)
            .unwrap_or_else(|| "никогда".to_string());
        line.push_str(&format!(" (данные на {})", synced));
    }
    line
}

pub fn render_summary(summary: &UserSummary) -> String {
    let mut text = format!(
        "Пользователь {} ({})\nКлючей: {} (активных {} из {})\nТрафик: {} из {}",
        summary.owner_id,
        summary.tier,
        summary.total_keys,
        summary.active_keys,
        summary.max_keys,
        format_bytes(summary.total_used_bytes),
        format_bytes(summary.total_limit_bytes)
    );
    if summary.keys.is_empty() {
        text.push_str("\n\nКлючей пока нет.");
        return text;
    }
    text.push('\n');
    for status in &summary.keys {
        text.push('\n');
        text.push_str(&render_key_status(status));
    }
    text
}

pub fn render_deletion_report(report: &DeletionReport) -> String {
    let head = format!(
        "Ключ «{}» (#{}, {})",
        report.key_name,
        report.key_id,
        backend_label(report.backend_type)
    );
    match report.outcome() {
        DeletionOutcome::Deleted => format!("{} удалён.", head),
        DeletionOutcome::OrphanedOnServer => format!(
            "{} удалён из базы, но сервер не подтвердил удаление: {}. Повторная очистка поставлена в очередь.",
            head,
            report.server_error.as_deref().unwrap_or("—")
        ),
        DeletionOutcome::OrphanedInDatabase => format!(
            "{} удалён на сервере, но запись в базе осталась: {}.",
            head,
            report.db_error.as_deref().unwrap_or("—")
        ),
        DeletionOutcome::Failed => format!(
            "{} не удалён. Сервер: {}. База: {}.",
            head,
            report.server_error.as_deref().unwrap_or("—"),
            report.db_error.as_deref().unwrap_or("—")
        ),
    }
}

pub fn render_activation_report(report: &ActivationReport) -> String {
    let head = format!(
        "Ключ «{}» (#{}, {})",
        report.key_name,
        report.key_id,
        backend_label(report.backend_type)
    );
    let action = if report.is_active { "включён" } else { "отключён" };
    match (report.server_applied, report.db_updated) {
        (true, true) => format!("{} {}.", head, action),
        (true, false) => format!(
            "{} {} на сервере, но база не обновлена: {}.",
            head,
            action,
            report.db_error.as_deref().unwrap_or("—")
        ),
        _ => format!(
            "{} не {}: {}. База не менялась.",
            head,
            action,
            report.server_error.as_deref().unwrap_or("—")
        ),
    }
}

pub fn render_health(report: &[(BackendType, HealthStatus)]) -> String {
    if report.is_empty() {
        return "Бэкенды не настроены.".to_string();
    }
    report
        .iter()
        .map(|(backend_type, status)| {
            if status.is_healthy {
                format!(
                    "✅ {}: работает{}",
                    backend_label(*backend_type),
                    status
                        .version
                        .as_deref()
                        .map(|v| format!(", версия {}", v))
                        .unwrap_or_default()
                )
            } else {
                format!(
                    "❌ {}: {}",
                    backend_label(*backend_type),
                    status.error_message.as_deref().unwrap_or("недоступен")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BYTES_PER_GIB;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(0), "0 Б");
        assert_eq!(format_bytes(1023), "1023 Б");
        assert_eq!(format_bytes(1536), "1.5 КиБ");
        assert_eq!(format_bytes(5 * BYTES_PER_GIB), "5.0 ГиБ");
    }

    #[test]
    fn partial_deletion_reads_differently_from_success() {
        let mut report = DeletionReport {
            key_id: 3,
            owner_id: 7,
            key_name: "laptop".to_string(),
            backend_type: BackendType::Wireguard,
            server_deleted: true,
            db_deleted: true,
            server_error: None,
            db_error: None,
        };
        let full = render_deletion_report(&report);
        report.server_deleted = false;
        report.server_error = Some("timeout".to_string());
        let partial = render_deletion_report(&report);
        assert!(full.ends_with("удалён."));
        assert_ne!(full, partial);
        assert!(partial.contains("timeout"));
    }

    #[test]
    fn failed_suspend_says_database_unchanged() {
        let mut report = ActivationReport {
            key_id: 3,
            owner_id: 7,
            key_name: "laptop".to_string(),
            backend_type: BackendType::Outline,
            is_active: false,
            server_applied: true,
            db_updated: true,
            server_error: None,
            db_error: None,
        };
        assert!(render_activation_report(&report).ends_with("отключён."));
        report.server_applied = false;
        report.db_updated = false;
        report.server_error = Some("timeout".to_string());
        let failed = render_activation_report(&report);
        assert!(failed.contains("не отключён: timeout"));
        assert!(failed.contains("База не менялась"));
    }

    #[test]
    fn health_lists_each_backend() {
        let text = render_health(&[
            (BackendType::Wireguard, HealthStatus::healthy(Some("1.0".to_string()))),
            (BackendType::Outline, HealthStatus::unhealthy("connection refused")),
        ]);
        assert!(text.contains("WireGuard: работает, версия 1.0"));
        assert!(text.contains("Outline: connection refused"));
    }
}
