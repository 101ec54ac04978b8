mod config;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, watch as tokio_watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use team_sync_core::{SyncTeam, SyncUser, TeamRole};
use team_sync_local::{FileCredentialStore, SyncCoordinator};
use team_sync_remote::HttpRemoteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting team-sync daemon");
    info!("  Remote store: {}", config.url);
    info!("  Poll interval: {} ms", config.poll_interval_ms);
    info!("  Debounce: {} ms", config.debounce_ms);

    let remote = Arc::new(HttpRemoteStore::new(config.remote())?);

    let credentials_path = config
        .credentials_file
        .clone()
        .unwrap_or_else(FileCredentialStore::default_path);
    info!("  Credentials: {}", credentials_path.display());
    let credentials = Arc::new(FileCredentialStore::new(credentials_path));

    let coordinator = SyncCoordinator::new(remote, credentials, config.coordinator())?;
    spawn_update_logger(&coordinator);

    if let Err(e) = coordinator.start().await {
        warn!("Saved session could not be restored: {}", e);
    }

    if let Some(token) = config.session_token.clone() {
        let email = config.email.clone().unwrap_or_else(|| "unknown".to_string());
        let user = SyncUser {
            id: email.clone(),
            email,
            name: None,
        };
        coordinator.authenticate(token, user).await?;
    }

    if !coordinator.status().authenticated {
        anyhow::bail!("No usable session; sign in again and pass --session-token");
    }

    if let Some(team_id) = config.team_id.clone() {
        coordinator
            .set_active_team(SyncTeam {
                id: team_id.clone(),
                name: team_id,
                role: TeamRole::Member,
                member_count: None,
            })
            .await?;
    }
    if coordinator.status().active_team.is_none() {
        anyhow::bail!("No active team; pass --team-id");
    }

    for project in &config.projects {
        match coordinator.enable_sync(&project.id, &project.path).await {
            Ok(()) => info!("Syncing {} at {}", project.id, project.path.display()),
            Err(e) => error!("Failed to enable sync for {}: {}", project.id, e),
        }
    }

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    coordinator.shutdown().await;
    info!("Daemon shutdown complete");
    Ok(())
}

/// Log status updates and conflicts until the coordinator goes away.
fn spawn_update_logger(coordinator: &SyncCoordinator) {
    let mut updates = coordinator.subscribe_updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => info!(kind = ?update.kind, project = ?update.project_id, "{}", update.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Update log lagged, {} updates skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut conflicts = coordinator.subscribe_conflicts();
    tokio::spawn(async move {
        loop {
            match conflicts.recv().await {
                Ok(conflict) => warn!(
                    key = %conflict.key,
                    current = conflict.current_revision,
                    incoming = conflict.incoming_revision,
                    actor = %conflict.remote_actor,
                    "Stale remote update ignored"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
