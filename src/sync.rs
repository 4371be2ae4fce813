//! Периодическая сверка: очистка осиротевших ключей, смена расчётных
//! периодов, синхронизация трафика, реакция на расхождения.

use crate::format::backend_label;
use crate::lifecycle::KeyLifecycleService;
use crate::model::{OrphanTask, VpnKey, unix_now};
use crate::notify::Notifier;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ORPHAN_BATCH: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub orphans_resolved: usize,
    pub orphans_failed: usize,
    pub cycles_reset: usize,
    pub keys_synced: usize,
    pub keys_stale: usize,
    pub faults: usize,
    pub deactivated: usize,
    pub caps_reached: usize,
    pub errors: usize,
}

/// Начало текущего периода, если старый уже истёк. Сдвиг на целое число периодов.
pub fn next_cycle_start(cycle_start: i64, cycle_secs: i64, now: i64) -> Option<i64> {
    if cycle_secs <= 0 || cycle_start.saturating_add(cycle_secs) > now {
        return None;
    }
    let elapsed_cycles = (now - cycle_start) / cycle_secs;
    Some(cycle_start + elapsed_cycles * cycle_secs)
}

pub struct SyncJob {
    service: Arc<KeyLifecycleService>,
    notifier: Arc<dyn Notifier>,
}

impl SyncJob {
    pub fn new(service: Arc<KeyLifecycleService>, notifier: Arc<dyn Notifier>) -> Self {
        Self { service, notifier }
    }

    pub async fn run(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.run_pass(unix_now()).await;
            info!(?report, "Sync pass finished");
        }
    }

    /// Один проход. Сбой по одному ключу не прерывает остальные.
    pub async fn run_pass(&self, now: i64) -> PassReport {
        let mut report = PassReport::default();
        self.retry_orphans(&mut report).await;

        let keys = match self.service.repo().list_all().await {
            Ok(keys) => keys,
            Err(err) => {
                error!(error = %err, "Failed to list keys for sync");
                report.errors += 1;
                return report;
            }
        };

        for key in keys {
            self.sync_key(key, now, &mut report).await;
        }
        report
    }

    async fn retry_orphans(&self, report: &mut PassReport) {
        let repo = self.service.repo();
        let tasks = match repo.list_open_orphans(ORPHAN_BATCH).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "Failed to list orphan tasks");
                report.errors += 1;
                return;
            }
        };

        for task in tasks {
            match self.retry_orphan(&task).await {
                Ok(()) => {
                    if let Err(err) = repo.resolve_orphan(task.id).await {
                        warn!(task_id = task.id, error = %err, "Failed to resolve orphan task");
                        report.errors += 1;
                    } else {
                        info!(
                            task_id = task.id,
                            backend = %task.backend_type,
                            external_reference = %task.external_reference,
                            "Orphaned backend key removed"
                        );
                        report.orphans_resolved += 1;
                    }
                }
                Err(reason) => {
                    debug!(task_id = task.id, error = %reason, "Orphan cleanup failed again");
                    report.orphans_failed += 1;
                    if let Err(err) = repo.fail_orphan_attempt(task.id, &reason).await {
                        warn!(task_id = task.id, error = %err, "Failed to update orphan task");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    async fn retry_orphan(&self, task: &OrphanTask) -> Result<(), String> {
        let client = self
            .service
            .backends()
            .client(task.backend_type)
            .ok_or_else(|| format!("бэкенд {} не настроен", task.backend_type))?;
        client
            .deprovision(&task.external_reference)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    async fn sync_key(&self, mut key: VpnKey, now: i64, report: &mut PassReport) {
        let repo = self.service.repo();
        let quota = self.service.quota();

        if let Some(start) = next_cycle_start(key.billing_cycle_start, quota.billing_cycle_secs(), now) {
            match repo.reset_billing_cycle(key.id, start).await {
                Ok(true) => {
                    debug!(key_id = key.id, cycle_start = start, "Billing cycle rolled over");
                    key.used_bytes = 0;
                    key.billing_cycle_start = start;
                    report.cycles_reset += 1;
                }
                Ok(false) => return,
                Err(err) => {
                    warn!(key_id = key.id, error = %err, "Failed to roll billing cycle");
                    report.errors += 1;
                }
            }
        }

        let view = match self.service.reconciler().reconcile(&key).await {
            Ok(view) => view,
            Err(err) => {
                warn!(key_id = key.id, error = %err, "Skipping key");
                report.errors += 1;
                return;
            }
        };

        if let Some(fault) = &view.fault {
            report.faults += 1;
            if !key.is_active {
                return;
            }
            let activation = self.service.set_key_active(&key, false).await;
            if activation.is_success() {
                report.deactivated += 1;
                self.notifier
                    .admin_alert(&format!(
                        "Ключ #{} «{}» пользователя {} не найден на {} ({}). Ключ отключён, запись сохранена.",
                        fault.key_id,
                        key.display_name,
                        key.owner_id,
                        backend_label(fault.backend_type),
                        fault.external_reference
                    ))
                    .await;
            } else {
                warn!(
                    key_id = key.id,
                    server_error = activation.server_error.as_deref().unwrap_or_default(),
                    db_error = activation.db_error.as_deref().unwrap_or_default(),
                    "Failed to deactivate faulty key"
                );
                report.errors += 1;
            }
            return;
        }

        if view.stale {
            report.keys_stale += 1;
            return;
        }
        report.keys_synced += 1;

        let crossed = !quota.is_over_data_cap(&key, key.used_bytes)
            && quota.is_over_data_cap(&key, view.used_bytes);
        if crossed && key.is_active {
            report.caps_reached += 1;
            self.notifier.data_cap_reached(&key, view.used_bytes).await;
        }
    }
}
