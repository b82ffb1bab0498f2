//! leaguesync - inspect and drive the league app's offline sync state.
//!
//! Works directly on the durable queue and cache a device (or a desktop build)
//! keeps in its data directory. Only `sync` and `retry-failed` touch the network.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use leaguesync_core::{
    AddOutcome, CacheManager, Clock, Config, FileStorage, ListQuery, NetworkState, OperationKind,
    QueueOptions, RemoteError, RemoteStore, RestRemoteStore, Storage, SyncEvent, SyncOperation,
    SyncReport, SyncService, SystemClock, Table,
};

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser)]
#[command(name = "leaguesync", version, about = "Offline sync queue and cache for the league app")]
struct Cli {
    /// Use this data directory instead of the configured one
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Access token of the signed-in player; requests use the API key otherwise
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue counts and the last successful sync
    Status,
    /// Operations waiting to be sent, in send order
    Pending,
    /// Operations that used up their retries
    Failed,
    /// Send pending operations now
    Sync,
    /// Give failed operations a fresh retry budget and sync
    RetryFailed,
    /// Drop an operation that has not started sending
    Cancel { id: String },
    /// Cached entry count and hit statistics; drops expired entries
    CacheStats,
    /// Remove every cached read
    ClearCache,
    /// Queue a mutation, e.g. `enqueue profiles update '{"id":"u1","bio":"hi"}' --ref u1`
    Enqueue {
        table: Table,
        operation: OperationKind,
        /// Row payload as JSON
        data: String,
        /// Deduplication key; a second enqueue with the same key is dropped while the first is outstanding
        #[arg(long = "ref")]
        reference: Option<String>,
    },
}

// ============================================================================
// Setup
// ============================================================================

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard must be
/// held until exit so buffered file output is flushed.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path {} has no file name", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

/// Stand-in for commands that never go online.
struct Unconfigured;

impl Unconfigured {
    fn error() -> RemoteError {
        RemoteError::InvalidRequest(
            "no remote configured; set LEAGUESYNC_REMOTE_URL and LEAGUESYNC_API_KEY".to_string(),
        )
    }
}

#[async_trait]
impl RemoteStore for Unconfigured {
    async fn insert(&self, _: Table, _: &Value) -> Result<Value, RemoteError> {
        Err(Self::error())
    }

    async fn update(&self, _: Table, _: &str, _: &Value) -> Result<Value, RemoteError> {
        Err(Self::error())
    }

    async fn delete(&self, _: Table, _: &str) -> Result<(), RemoteError> {
        Err(Self::error())
    }

    async fn upsert(&self, _: Table, _: &Value) -> Result<Value, RemoteError> {
        Err(Self::error())
    }

    async fn fetch_by_id(&self, _: Table, _: &str) -> Result<Option<Value>, RemoteError> {
        Err(Self::error())
    }

    async fn fetch_list(&self, _: Table, _: &ListQuery) -> Result<Vec<Value>, RemoteError> {
        Err(Self::error())
    }
}

fn remote_store(config: &Config, token: Option<String>) -> Result<Arc<dyn RemoteStore>> {
    let (Some(url), Some(key)) = (config.remote_url.as_deref(), config.api_key.as_deref()) else {
        bail!("No remote configured; set LEAGUESYNC_REMOTE_URL and LEAGUESYNC_API_KEY");
    };
    let mut store = RestRemoteStore::new(url, key).context("Failed to build HTTP client")?;
    if let Some(token) = token {
        store.set_token(token);
    }
    Ok(Arc::new(store))
}

async fn open_service(
    config: &Config,
    remote: Arc<dyn RemoteStore>,
) -> Result<Arc<SyncService>> {
    let data_dir = config.data_dir()?;
    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::new(data_dir.clone())
            .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(CacheManager::new(storage.clone(), clock.clone(), config.cache.clone()));

    // Periodic sync makes no sense for a one-shot command
    let mut sync_config = config.sync.clone();
    sync_config.auto_sync_interval_ms = None;

    let service = SyncService::new(storage, remote, cache, clock, sync_config);
    service.initialize().await;
    Ok(service)
}

// ============================================================================
// Output
// ============================================================================

fn print_operations(operations: &[SyncOperation]) {
    if operations.is_empty() {
        println!("(none)");
        return;
    }
    for op in operations {
        print!(
            "{}  {:<22} p{:<2} retries {}/{}  queued {}",
            op.id,
            op.label(),
            op.priority(),
            op.retry_count,
            op.max_retries,
            op.timestamp.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(ref reference) = op.reference_id {
            print!("  ref {}", reference);
        }
        println!();
        if let Some(ref error) = op.error {
            println!("    last error: {}", error);
        }
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::OperationComplete { id, table, operation } => {
            println!("  sent    {}:{} {}", table, operation, id);
        }
        SyncEvent::OperationFailed {
            id,
            table,
            operation,
            error,
            retry_count,
            will_retry,
        } => {
            let next = if *will_retry { "will retry" } else { "giving up" };
            println!(
                "  failed  {}:{} {} (attempt {}, {}): {}",
                table, operation, id, retry_count, next, error
            );
        }
        SyncEvent::SyncError { message } => println!("  error   {}", message),
        SyncEvent::SyncStart { .. } | SyncEvent::SyncComplete { .. } => {}
    }
}

/// Go online, drain, and print what happened.
async fn run_sync(service: &Arc<SyncService>) -> Result<SyncReport> {
    let mut events = service.subscribe();
    let report = match service.set_network_status(NetworkState::online()).await {
        Some(handle) => handle.await.context("Sync task failed")?,
        None => service.sync().await,
    };
    service.shutdown();

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    println!("Sent {}, failed {}", report.processed, report.failed);
    Ok(report)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut config = Config::load().context("Failed to load config")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    info!(command = ?std::env::args().nth(1), "leaguesync starting");

    let needs_network = matches!(cli.command, Command::Sync | Command::RetryFailed);
    let remote = if needs_network {
        remote_store(&config, cli.token)?
    } else {
        Arc::new(Unconfigured) as Arc<dyn RemoteStore>
    };
    let service = open_service(&config, remote).await?;

    match cli.command {
        Command::Status => {
            let status = service.status().await;
            let summary = &status.queue;
            match status.last_sync_at {
                Some(at) => {
                    let minutes = (Utc::now() - at).num_minutes();
                    println!("Last sync:  {} ({}m ago)", at.format("%Y-%m-%d %H:%M:%S UTC"), minutes);
                }
                None => println!("Last sync:  never"),
            }
            print!("Pending:    {}", summary.pending);
            if let Some(oldest) = summary.oldest_pending {
                print!(" (oldest queued {})", oldest.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!();
            println!("Syncing:    {}", summary.syncing);
            println!("Failed:     {}", summary.failed);
        }
        Command::Pending => print_operations(&service.pending_operations().await),
        Command::Failed => print_operations(&service.failed_operations().await),
        Command::Sync => {
            let report = run_sync(&service).await?;
            if report.failed > 0 {
                bail!("{} operation(s) failed; see `leaguesync failed`", report.failed);
            }
        }
        Command::RetryFailed => {
            // Reset while still offline, then drain everything in one pass
            let reset = service.retry_failed().await;
            println!("Reset {} failed operation(s)", reset);
            let report = run_sync(&service).await?;
            if report.failed > 0 {
                bail!("{} operation(s) failed again", report.failed);
            }
        }
        Command::Cancel { id } => {
            if service.cancel_operation(&id).await {
                println!("Cancelled {}", id);
            } else {
                match service.operation(&id).await {
                    Some(op) => bail!("Operation {} is {}; only pending operations can be cancelled", id, op.status),
                    None => bail!("No operation with id {}", id),
                }
            }
        }
        Command::CacheStats => {
            let cache = service.cache();
            let stats = cache.stats().await;
            let removed = cache.cleanup_expired().await;
            println!("Entries:    {}", stats.entries - removed);
            println!("Expired:    {} (removed)", removed);
            println!(
                "Hits:       {} ({} stale), misses {}, hit rate {:.0}%",
                stats.hits,
                stats.stale_hits,
                stats.misses,
                stats.hit_rate() * 100.0
            );
        }
        Command::ClearCache => {
            let cache = service.cache();
            let count = cache.len().await;
            cache.clear().await;
            println!("Removed {} cached entr{}", count, if count == 1 { "y" } else { "ies" });
        }
        Command::Enqueue {
            table,
            operation,
            data,
            reference,
        } => {
            let data: Value = serde_json::from_str(&data).context("Payload is not valid JSON")?;
            let options = QueueOptions {
                reference_id: reference,
                immediate: false,
            };
            match service.queue_operation(table, operation, data, options).await? {
                AddOutcome::Queued(id) => println!("Queued {}", id),
                AddOutcome::Duplicate(id) => println!("Already queued as {}", id),
            }
        }
    }

    service.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "leaguesync",
            "enqueue",
            "profiles",
            "update",
            r#"{"id":"u1"}"#,
            "--ref",
            "u1",
        ])
        .unwrap();
        match cli.command {
            Command::Enqueue {
                table,
                operation,
                reference,
                ..
            } => {
                assert_eq!(table, Table::Profiles);
                assert_eq!(operation, OperationKind::Update);
                assert_eq!(reference.as_deref(), Some("u1"));
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_unknown_table_rejected() {
        assert!(Cli::try_parse_from(["leaguesync", "enqueue", "teams", "insert", "{}"]).is_err());
    }

    #[test]
    fn test_remote_requires_url_and_key() {
        let config = Config {
            remote_url: Some("https://example.supabase.co".to_string()),
            ..Config::default()
        };
        assert!(remote_store(&config, None).is_err());
    }
}
