//! vpnkey-admin: управление VPN-ключами и периодическая сверка трафика.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use vpnkey_admin::backend::outline::OutlineClient;
use vpnkey_admin::backend::wireguard::WireguardClient;
use vpnkey_admin::backend::{Backends, VpnBackendClient};
use vpnkey_admin::config::Config;
use vpnkey_admin::db::Db;
use vpnkey_admin::lifecycle::{DeletionReport, KeyLifecycleService, LifecycleError};
use vpnkey_admin::model::{BYTES_PER_GIB, BackendType, Tier, unix_now};
use vpnkey_admin::notify::{Notifier, TelegramNotifier, TracingNotifier};
use vpnkey_admin::quota::QuotaEnforcer;
use vpnkey_admin::sync::SyncJob;
use vpnkey_admin::{credentials, format};

#[derive(Parser)]
#[command(name = "vpnkey-admin")]
#[command(about = "VPN key lifecycle and usage accounting for WireGuard and Outline")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "/etc/vpnkey-admin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic sync job until Ctrl-C
    Serve,
    /// Run a single sync pass
    Sync,
    /// Create a key for a user
    Create {
        #[arg(long)]
        owner: i64,
        /// wireguard | outline
        #[arg(long)]
        backend: BackendType,
        #[arg(long)]
        name: String,
        /// Write the credential as a QR code PNG
        #[arg(long)]
        qr: Option<PathBuf>,
    },
    /// Delete a key on behalf of its owner
    Delete {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        key: i64,
    },
    /// Delete any key without ownership check
    AdminDelete {
        #[arg(long)]
        key: i64,
    },
    /// Show a user's keys and usage
    Summary {
        #[arg(long)]
        owner: i64,
    },
    /// Rename a key
    Rename {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        key: i64,
        #[arg(long)]
        name: String,
    },
    /// Change a key's data limit
    SetLimit {
        #[arg(long)]
        key: i64,
        #[arg(long)]
        gb: i64,
    },
    /// Start a new billing cycle for a key now
    ResetCycle {
        #[arg(long)]
        key: i64,
    },
    /// Enable or disable a key without deleting it
    SetActive {
        #[arg(long)]
        key: i64,
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Assign a user's tier
    SetTier {
        #[arg(long)]
        owner: i64,
        /// free | vip
        #[arg(long)]
        tier: Tier,
        /// VIP duration in days; omit for no expiry
        #[arg(long)]
        days: Option<i64>,
    },
    /// Check every configured backend
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    tracing::info!(
        config_path = %cli.config.display(),
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        wireguard = config.wireguard.is_some(),
        outline = config.outline.is_some(),
        "Configuration loaded"
    );

    let db = Arc::new(Db::open(&config.db_path).await?);
    let backends = build_backends(&config)?;
    let service = Arc::new(KeyLifecycleService::new(
        db.clone(),
        db.clone(),
        backends,
        QuotaEnforcer::new(config.quota.clone()),
    ));
    let notifier = build_notifier(&config);

    match cli.command {
        Command::Serve => {
            let job = SyncJob::new(service.clone(), notifier);
            let period = Duration::from_secs(config.sync.interval_secs);
            tracing::info!(interval_secs = config.sync.interval_secs, "Sync job started");
            tokio::select! {
                _ = job.run(period) => {}
                result = tokio::signal::ctrl_c() => {
                    result?;
                    tracing::info!("Shutdown requested");
                }
            }
        }
        Command::Sync => {
            let report = SyncJob::new(service.clone(), notifier)
                .run_pass(unix_now())
                .await;
            println!("{:#?}", report);
        }
        Command::Create {
            owner,
            backend,
            name,
            qr,
        } => {
            let key = service
                .create(owner, backend, &name)
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("{}", format::render_key_line(&key));
            println!("\n{}", key.credential_material);
            if let Some(path) = qr {
                std::fs::write(&path, credentials::qr_png_bytes(&key.credential_material)?)?;
                println!("\nQR: {}", path.display());
            }
        }
        Command::Delete { owner, key } => {
            let report = service
                .delete(owner, key)
                .await
                .unwrap_or_else(|err| exit_with(err));
            finish_deletion(&report, notifier.as_ref()).await;
        }
        Command::AdminDelete { key } => {
            let report = service
                .admin_delete_any(key)
                .await
                .unwrap_or_else(|err| exit_with(err));
            finish_deletion(&report, notifier.as_ref()).await;
        }
        Command::Summary { owner } => {
            let summary = service
                .get_user_summary(owner)
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("{}", format::render_summary(&summary));
        }
        Command::Rename { owner, key, name } => {
            service
                .rename(owner, key, &name)
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("Ключ #{} переименован.", key);
        }
        Command::SetLimit { key, gb } => {
            service
                .set_data_limit(key, gb.saturating_mul(BYTES_PER_GIB))
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("Лимит ключа #{}: {} ГиБ.", key, gb);
        }
        Command::ResetCycle { key } => {
            service
                .reset_billing_cycle(key)
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("Для ключа #{} начат новый расчётный период.", key);
        }
        Command::SetActive { key, active } => {
            let report = service
                .set_active(key, active)
                .await
                .unwrap_or_else(|err| exit_with(err));
            println!("{}", format::render_activation_report(&report));
            if !report.is_success() {
                std::process::exit(2);
            }
        }
        Command::SetTier { owner, tier, days } => {
            let vip_until = days.map(|days| unix_now() + days.saturating_mul(86_400));
            db.set_tier(owner, tier, vip_until).await?;
            println!(
                "Пользователь {}: тариф {}{}",
                owner,
                tier,
                vip_until
                    .map(|ts| format!(" до {}", format::format_date(ts)))
                    .unwrap_or_default()
            );
        }
        Command::Health => {
            let report = service.health().await;
            println!("{}", format::render_health(&report));
            if report.iter().any(|(_, status)| !status.is_healthy) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_backends(config: &Config) -> Result<Backends, Box<dyn std::error::Error + Send + Sync>> {
    let timeout = config.backend_timeout();
    let mut backends = Backends::new();
    if let Some(wg) = &config.wireguard {
        let client = WireguardClient::new(wg.clone(), timeout)?;
        backends = backends.with(
            BackendType::Wireguard,
            Arc::new(client) as Arc<dyn VpnBackendClient>,
        );
    }
    if let Some(outline) = &config.outline {
        let client = OutlineClient::new(outline, timeout)?;
        backends = backends.with(
            BackendType::Outline,
            Arc::new(client) as Arc<dyn VpnBackendClient>,
        );
    }
    Ok(backends)
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    match config.bot_token() {
        Some(token) => Arc::new(TelegramNotifier::new(
            Bot::new(token),
            config.admin_ids.clone(),
        )),
        None => {
            tracing::info!("Bot token not configured, notifications go to the log only");
            Arc::new(TracingNotifier)
        }
    }
}

/// Подробности в лог, пользователю короткое сообщение.
fn exit_with(error: LifecycleError) -> ! {
    tracing::error!(error = %error, "Operation failed");
    eprintln!("{}", error.user_message());
    std::process::exit(1);
}

async fn finish_deletion(report: &DeletionReport, notifier: &dyn Notifier) {
    println!("{}", format::render_deletion_report(report));
    if report.db_deleted {
        notifier.key_deleted(report).await;
    }
    if !report.is_success() {
        std::process::exit(2);
    }
}
