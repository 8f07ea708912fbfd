// Headless match watcher.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Get the shared push connection and authenticate
// 4. Build the REST client
// 5. Spawn the watcher loop for the configured match
// 6. Print read-model changes until Ctrl+C
// 7. Shut the watcher down, then the connection

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use matchsync_api::{HttpMatchApi, MatchApi};
use matchsync_app::app::{self, WatcherSettings};
use matchsync_app::protocol::{LoadState, MatchTarget, MatchView, SessionCommand, ViewUpdate};
use matchsync_core::config;
use matchsync_core::connection::{self, ConnectionError, ConnectionSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("matchsync starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    let watch = config
        .watch
        .clone()
        .context("config/matchsync.toml has no [watch] section; nothing to watch")?;
    info!(
        api = %config.server.api_base_url,
        socket = %config.server.socket_url,
        "config loaded"
    );

    // 3. Shared push connection
    let connection = connection::get_connection(&ConnectionSettings::from(&config));
    connection.on_error(Arc::new(|e: &ConnectionError| {
        eprintln!("push connection failed: {e}");
    }));
    match config.credentials.token.as_deref() {
        Some(token) if !token.is_empty() => connection.authenticate(token),
        _ => warn!("no token in config/credentials.toml; live updates disabled, use manual refresh"),
    }

    let mut phase_rx = connection.subscribe_phase();
    let phase_task = tokio::spawn(async move {
        while phase_rx.changed().await.is_ok() {
            let phase = *phase_rx.borrow_and_update();
            info!(?phase, "push connection phase");
        }
    });

    // 4. REST client
    let api: Arc<dyn MatchApi> =
        Arc::new(HttpMatchApi::from_config(&config).context("failed to build api client")?);

    // 5. Watcher loop
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (view_tx, mut view_rx) = mpsc::channel(64);
    let target = MatchTarget::new(watch.tournament_id, watch.match_id);
    println!(
        "watching match {} in tournament {} (Ctrl+C to stop)",
        target.match_id, target.tournament_id
    );
    let watcher = tokio::spawn(app::run(
        target,
        api,
        connection.clone(),
        WatcherSettings::from(&config.sync),
        cmd_rx,
        view_tx,
    ));

    // 6. Print changes until Ctrl+C
    loop {
        tokio::select! {
            update = view_rx.recv() => match update {
                Some(ViewUpdate::Snapshot(view)) => print_view(&view),
                Some(ViewUpdate::Stopped) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // 7. Cleanup
    let _ = cmd_tx.send(SessionCommand::Shutdown).await;
    match watcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("watcher exited with error: {e:#}"),
        Err(e) => error!("watcher task failed: {e}"),
    }
    connection.shutdown();
    phase_task.abort();
    info!("matchsync exited");
    Ok(())
}

fn print_view(view: &MatchView) {
    info!(?view, "read model changed");
    match &view.load_state {
        LoadState::Loading => println!("loading..."),
        LoadState::Failed(e) => println!("failed to load match: {e}"),
        LoadState::Ready => {
            let score = view
                .score
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            let winner = view.winner_id.as_deref().unwrap_or("undetermined");
            let status = view
                .match_data
                .as_ref()
                .map(|m| format!("{:?}", m.status))
                .unwrap_or_default();
            println!(
                "v{} {status} {score} winner={winner} bracket={:?} edit={:?}{}",
                view.committed_version,
                view.bracket,
                view.permission,
                if view.has_lobby { " [lobby]" } else { "" }
            );
            if let Some(e) = &view.last_error {
                println!("  refresh failed: {e}");
            }
        }
    }
}

const DEFAULT_LOG_FILTER: &str =
    "matchsync=info,matchsync_core=info,matchsync_api=info,matchsync_app=info,warn";

/// Send tracing output to `logs/matchsync.log` under the working directory,
/// appending so earlier watch sessions stay readable. `RUST_LOG` overrides
/// the default filter.
fn init_tracing() -> anyhow::Result<()> {
    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let log_path = log_dir.join("matchsync.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))?;

    Ok(())
}
