//! Service runtime: wiring, crash recovery, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cadence_broker::{spawn_tickler, BrokerClient, BrokerSettings};
use cadence_config::AppConfig;
use cadence_engine::{OrderEngine, Scheduler};
use cadence_notify::Notifier;
use cadence_sheets::{GoogleSheets, GoogleSheetsSettings, OrderSheet};

use crate::http::{spawn_http_server, HttpState};

/// Restart policy for the scheduler loop.
const MAX_RESTART_ATTEMPTS: u32 = 10;
const RESTART_BACKOFF_START: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// A loop that survived this long is considered healthy again.
const HEALTHY_RUN: Duration = Duration::from_secs(300);

/// Run the service until a shutdown signal arrives or the scheduler fails
/// terminally. This is what `cadence run` executes in the foreground.
pub async fn run_service(config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let started_at = Utc::now();
    let timezone = config.scheduler.timezone()?;
    let fire_time = config.scheduler.fire_time()?;
    let listen_addr: SocketAddr = config
        .service
        .listen_addr
        .parse()
        .with_context(|| format!("bad listen address '{}'", config.service.listen_addr))?;

    write_pid_file(&config.service.pid_file)?;

    // Broker client, shared by reference everywhere.
    let broker = Arc::new(
        BrokerClient::new(BrokerSettings {
            base_url: config.broker.resolved_base_url(config.environment),
            consumer_key: config.broker.consumer_key.clone(),
            access_token: config.broker.access_token.clone(),
            access_token_secret: config.broker.access_token_secret.clone(),
            dh_prime: config.broker.dh_prime.clone(),
            realm: config.broker.realm.clone(),
            signature_key_path: config.broker.signature_key_path.clone(),
            encryption_key_path: config.broker.encryption_key_path.clone(),
            account_id: config.broker.account_id.clone(),
            call_timeout: Duration::from_secs(config.broker.call_timeout_secs),
        })
        .context("failed to construct broker client")?,
    );

    let worksheet = GoogleSheets::new(GoogleSheetsSettings {
        spreadsheet_id: config.sheet.spreadsheet_id.clone(),
        worksheet: config.sheet.worksheet.clone(),
        credentials_path: config.sheet.credentials_path.clone(),
    })
    .context("failed to construct sheet client")?;
    let sheet = Arc::new(OrderSheet::new(
        Arc::new(worksheet),
        config.sheet.log_start_column,
        config.sheet.max_log_columns,
    ));

    let notifier = Arc::new(Notifier::new(
        config.notifier.webhook_url.clone(),
        config.notifier.username.clone(),
        Duration::from_secs(config.notifier.timeout_secs),
        timezone,
    ));

    let engine = Arc::new(OrderEngine::new(
        Arc::clone(&broker),
        sheet,
        Arc::clone(&notifier),
        timezone,
        Duration::from_millis(config.scheduler.inter_order_pause_ms),
        cancel.clone(),
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&engine),
        fire_time,
        timezone,
        Duration::from_secs(config.scheduler.health_interval_secs),
        chrono::Duration::seconds(config.scheduler.misfire_grace_secs as i64),
    );

    let tickler = spawn_tickler(
        Arc::clone(&broker),
        Duration::from_secs(config.broker.tickler_interval_secs),
        cancel.clone(),
    );
    let http = spawn_http_server(
        listen_addr,
        Arc::new(HttpState {
            engine: Arc::clone(&engine),
            scheduler_status: scheduler.status_handle(),
        }),
        cancel.clone(),
    );

    notifier
        .send_lifecycle(
            "\u{1f680} Cadence Service Started",
            &format!(
                "Daily fire time {fire_time} {timezone}\nLocal API: http://{listen_addr}/recurring/status"
            ),
            false,
        )
        .await;

    // Scheduler supervision: restart with exponential backoff on failure,
    // give up after the attempt budget and record a terminal failure.
    let mut attempts = 0u32;
    let mut backoff = RESTART_BACKOFF_START;
    let outcome: Result<()> = loop {
        let run_started = Instant::now();
        match scheduler.run(cancel.clone()).await {
            Ok(()) => break Ok(()),
            Err(err) => {
                if cancel.is_cancelled() {
                    break Ok(());
                }
                if run_started.elapsed() >= HEALTHY_RUN {
                    attempts = 0;
                    backoff = RESTART_BACKOFF_START;
                }
                attempts += 1;
                error!(error = %err, attempt = attempts, "scheduler loop failed");
                if attempts >= MAX_RESTART_ATTEMPTS {
                    notifier
                        .send_lifecycle(
                            "\u{1f4a5} Cadence Service Terminal Failure",
                            &format!(
                                "Scheduler failed {attempts} times, giving up.\nLast error: {err}"
                            ),
                            true,
                        )
                        .await;
                    break Err(err).context("scheduler failed terminally");
                }
                warn!(delay_secs = backoff.as_secs(), "restarting scheduler loop");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break Ok(()),
                }
                backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
            }
        }
    };

    // Cooperative shutdown: tickler and HTTP server exit on the token; the
    // engine finishes (or skips) the batch it may be in.
    cancel.cancel();
    let _ = tickler.await;
    let _ = http.await;

    let stats = engine.stats();
    let uptime = Utc::now() - started_at;
    notifier
        .send_lifecycle(
            "\u{1f6d1} Cadence Service Stopped",
            &format!(
                "Uptime: {}h{}m\nExecutions: {} (success {} / failed {})",
                uptime.num_hours(),
                uptime.num_minutes() % 60,
                stats.executions,
                stats.successes,
                stats.failures,
            ),
            false,
        )
        .await;

    remove_pid_file(&config.service.pid_file);
    info!("service shutdown complete");
    outcome
}

/// Cancel the runtime token on SIGTERM or ctrl-c.
fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received ctrl-c, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }
        cancel.cancel();
    });
}

fn write_pid_file(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write PID file {}", path.display()))
}

fn remove_pid_file(path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "failed to remove PID file");
        }
    }
}
