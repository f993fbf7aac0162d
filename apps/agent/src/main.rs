mod core;
mod features;

use std::sync::Arc;
use std::time::Duration;

use keldris_types::AgentIdentity;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::engine::{CliEngine, Engine};
use crate::core::store::{MemoryStore, Store};
use crate::features::backup::tracker::BackupTracker;
use crate::features::backup::{BackupRunnerConfig, WorkloadBackup};
use crate::features::dedup::DedupIndex;
use crate::features::schedule::{BackupLauncher, JobLauncher, ScheduleBackupResumer, ScheduleTrigger};
use crate::features::shutdown::{
    ShutdownConfig, ShutdownCoordinator, StartupConfig, StartupService,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_uuid(name: &str) -> Uuid {
    std::env::var(name)
        .ok()
        .and_then(|v| Uuid::parse_str(&v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let engine_binary = env_or("KELDRIS_ENGINE_BIN", "docker");
    let agent_id = env_uuid("KELDRIS_AGENT_ID");
    let org_id = env_uuid("KELDRIS_ORG_ID");

    // The persistent store is an external contract; the in-memory one keeps
    // a standalone agent functional.
    let memory_store = Arc::new(MemoryStore::new());
    memory_store
        .put_agent(AgentIdentity {
            id: agent_id,
            org_id,
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
        .await;
    let store: Arc<dyn Store> = memory_store;
    let identity = store
        .get_agent(agent_id)
        .await?
        .expect("agent identity registered above");

    let engine: Arc<dyn Engine> = Arc::new(CliEngine::new(engine_binary));
    let tracker = Arc::new(BackupTracker::new(store.clone(), identity.id));
    let dedup = Arc::new(DedupIndex::new(store.clone()));
    if let Err(err) = dedup.load_cache(identity.org_id).await {
        warn!(error = %err, "dedup cache load failed, starting cold");
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(
        tracker.clone(),
        ShutdownConfig {
            timeout: Duration::from_secs(env_u64("KELDRIS_SHUTDOWN_TIMEOUT", 300)),
            drain_timeout: Duration::from_secs(env_u64("KELDRIS_DRAIN_TIMEOUT", 30)),
            checkpoint_running_backups: true,
        },
    ));

    let backup = Arc::new(WorkloadBackup::new(
        engine,
        store.clone(),
        dedup,
        tracker,
        coordinator.gate(),
        identity.org_id,
        BackupRunnerConfig::default(),
    ));
    let launcher: Arc<dyn JobLauncher> = Arc::new(BackupLauncher::new(backup));

    let root_cancel = CancellationToken::new();
    let startup = StartupService::new(
        store.clone(),
        Arc::new(ScheduleBackupResumer::new(store.clone(), launcher.clone())),
        identity.id,
        StartupConfig {
            resume_checkpoints: true,
            max_resumes_per_startup: env_u64("KELDRIS_MAX_RESUMES", 5) as usize,
            resume_delay: Duration::from_secs(env_u64("KELDRIS_RESUME_DELAY", 5)),
        },
    );
    match startup.resume_checkpoints(&root_cancel).await {
        Ok(0) => {}
        Ok(resumed) => info!(resumed, "checkpoints resumed"),
        Err(err) => warn!(error = %err, "checkpoint resume failed"),
    }

    let trigger = Arc::new(ScheduleTrigger::new(
        store,
        coordinator.gate(),
        launcher,
    ));
    trigger.reload().await?;
    let refresh = trigger.clone().spawn_refresh();
    info!(agent_id = %identity.id, "agent running");

    wait_for_signal().await;
    info!("shutdown signal received");
    trigger.stop().await;
    refresh.abort();
    root_cancel.cancel();
    coordinator.shutdown(&CancellationToken::new()).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
