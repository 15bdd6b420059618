use std::str::FromStr;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, watch};

use ara_realtime_sync::config::Settings;
use ara_realtime_sync::connection_manager::ConnectionSignal;
use ara_realtime_sync::dispatcher::names;
use ara_realtime_sync::metrics::encode_metrics;
use ara_realtime_sync::notification::{NotificationReconciler, PageQuery, RecordId};
use ara_realtime_sync::telemetry::init_tracing;
use ara_realtime_sync::video::VideoStatusProjector;
use ara_realtime_sync::visibility::Visibility;
use ara_realtime_sync::SyncContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;
    tracing::info!("Configuration loaded");

    let ctx = SyncContext::from_settings(&settings)?;

    let notifications = ctx.notification_reconciler();
    let visibility = ctx.visibility_reconciler();
    let (visibility_tx, visibility_rx) = watch::channel(Visibility::Foreground);
    let mut visibility_guard = visibility.spawn(visibility_rx);
    let projectors: Vec<VideoStatusProjector> = settings
        .video
        .watch_ids
        .iter()
        .map(|id| ctx.video_projector(id))
        .collect();

    let _announcements = ctx.dispatcher.on(names::ANNOUNCEMENT, |event| {
        tracing::info!(body = %event.body, "Announcement");
        Ok(())
    });
    let signal_logger = tokio::spawn(log_signals(ctx.connection.signals()));

    let state = ctx.connection.connect().await;
    tracing::info!(state = %state, "Initial connection settled");
    if let Err(e) = notifications.reload().await {
        tracing::warn!(error = %e, "Initial notification load failed");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match Command::from_str(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        run_command(command, &ctx, &notifications, &projectors, &visibility_tx)
                            .await
                    }
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    visibility_guard.stop();
    notifications.teardown();
    for projector in &projectors {
        projector.teardown();
    }
    ctx.shutdown().await;
    signal_logger.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Foreground,
    Background,
    Load(u32),
    Read(String),
    ReadAll,
    Status,
    Metrics,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let arg = parts.next();

        match (command, arg) {
            ("foreground", None) => Ok(Command::Foreground),
            ("background", None) => Ok(Command::Background),
            ("load", Some(page)) => page
                .parse()
                .map(Command::Load)
                .map_err(|_| format!("invalid page number: {}", page)),
            ("load", None) => Ok(Command::Load(1)),
            ("read", Some(id)) => Ok(Command::Read(id.to_string())),
            ("read-all", None) => Ok(Command::ReadAll),
            ("status", None) => Ok(Command::Status),
            ("metrics", None) => Ok(Command::Metrics),
            ("quit" | "exit", None) => Ok(Command::Quit),
            _ => Err(format!(
                "unknown command: {} (foreground, background, load <page>, read <id>, \
                 read-all, status, metrics, quit)",
                line.trim()
            )),
        }
    }
}

async fn run_command(
    command: Command,
    ctx: &SyncContext,
    notifications: &NotificationReconciler,
    projectors: &[VideoStatusProjector],
    visibility: &watch::Sender<Visibility>,
) {
    match command {
        Command::Foreground => {
            visibility.send_replace(Visibility::Foreground);
        }
        Command::Background => {
            visibility.send_replace(Visibility::Background);
        }
        Command::Load(page) => {
            let limit = notifications.page_info().map_or(20, |info| info.page_size.max(1));
            match notifications.load_page(PageQuery::new(page, limit)).await {
                Ok(info) => println!(
                    "page {}/{}: {} records loaded",
                    info.current_page,
                    info.total_pages,
                    notifications.records().len()
                ),
                Err(e) => println!("load failed: {}", e),
            }
        }
        Command::Read(id) => {
            if let Err(e) = notifications.mark_as_read(RecordId::from(id)).await {
                println!("mark as read failed: {}", e);
            }
        }
        Command::ReadAll => {
            if let Err(e) = notifications.mark_all_as_read().await {
                println!("mark all as read failed: {}", e);
            }
        }
        Command::Status => {
            println!("connection: {}", ctx.connection.state());
            println!("unread: {}", notifications.unread_count());
            println!(
                "loaded: {} (more pages: {})",
                notifications.records().len(),
                notifications.has_more()
            );
            for projector in projectors {
                match projector.latest() {
                    Some(status) => println!(
                        "video {}: {} {}%",
                        projector.video_id(),
                        status.status,
                        status.progress
                    ),
                    None => println!("video {}: no status yet", projector.video_id()),
                }
            }
        }
        Command::Metrics => match encode_metrics() {
            Ok(text) => print!("{}", text),
            Err(e) => println!("metrics unavailable: {}", e),
        },
        Command::Quit => {}
    }
}

async fn log_signals(mut signals: broadcast::Receiver<ConnectionSignal>) {
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::AuthFailed(reason)) => {
                tracing::error!(reason = %reason, "Credential rejected, sign in again");
            }
            Ok(ConnectionSignal::RetriesExhausted { attempts }) => {
                tracing::error!(
                    attempts = attempts,
                    "Gave up reconnecting, unread counts now come from polling"
                );
            }
            Ok(signal) => tracing::debug!(signal = ?signal, "Connection signal"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped = skipped, "Connection signals skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
