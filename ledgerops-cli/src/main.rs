//! ledgerops - hold network-wide operation locks from the command line

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledgerops_core::lease::HolderIdentity;
use ledgerops_core::store::PostgresLeaseStore;
use ledgerops_core::{Lease, LeaseConfig, LeaseManager, LeaseStore, RenewalScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ledgerops - lease-based locks for network operations
#[derive(Parser, Debug)]
#[command(name = "ledgerops", version)]
#[command(about = "Coordinate network operations through shared leases", long_about = None)]
struct Args {
    /// Namespace the lease guards
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Lease name within the namespace (defaults to the namespace)
    #[arg(long)]
    name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the lease record and who holds it
    Status,
    /// Acquire the lease and keep it for a while
    Hold {
        #[arg(short, long, default_value_t = 60)]
        seconds: u64,
    },
    /// Run a command while holding the lease
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = LeaseConfig::load().context("failed to load configuration")?;
    init_tracing(&config, args.debug);

    let store = PostgresLeaseStore::connect(&config).await?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare lease table")?;
    let store: Arc<dyn LeaseStore> = Arc::new(store);

    let scheduler = RenewalScheduler::new();
    let manager = LeaseManager::new(store.clone(), scheduler.clone(), config);
    let name = args.name.as_deref().unwrap_or(&args.namespace);
    let lease = manager.create_named(&args.namespace, name);

    let result = match args.command {
        Command::Status => status(store.as_ref(), &lease).await,
        Command::Hold { seconds } => hold(&manager, &lease, Duration::from_secs(seconds)).await,
        Command::Exec { command } => exec(&manager, &lease, &command).await,
    };

    scheduler.shutdown().await;
    result
}

fn init_tracing(config: &LeaseConfig, debug: bool) {
    let default_filter = if debug {
        "info,ledgerops_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

async fn status(store: &dyn LeaseStore, lease: &Lease) -> Result<ExitCode> {
    let (record, now) = store
        .observe(lease.namespace(), lease.name())
        .await
        .context("failed to read lease record")?;
    let state = match lease.state().await {
        Ok(state) => state.label().to_string(),
        Err(err) => format!("unreadable: {err}"),
    };

    let holder = record
        .as_ref()
        .and_then(|r| HolderIdentity::from_wire(&r.holder_identity).ok());
    let holder_alive = holder
        .as_ref()
        .filter(|h| h.is_same_machine_identity(lease.holder()))
        .map(HolderIdentity::is_process_alive);

    let report = serde_json::json!({
        "namespace": lease.namespace(),
        "name": lease.name(),
        "state": state,
        "expired": record.as_ref().map(|r| r.is_expired_at(now)),
        "observed_at": now,
        "record": record,
        "holder": holder,
        "holder_process_alive": holder_alive,
        "me": lease.holder(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn acquire(manager: &LeaseManager, lease: &Lease) -> Result<()> {
    let report = |status: &str| eprintln!("{status}");
    let attempt = manager
        .retry()
        .acquire(lease, &report)
        .await
        .with_context(|| format!("could not lock {}/{}", lease.namespace(), lease.name()))?;
    info!(attempt, holder = %lease.holder(), "lease acquired");
    Ok(())
}

async fn release(lease: &Lease) -> Result<()> {
    lease
        .release()
        .await
        .with_context(|| format!("could not unlock {}/{}", lease.namespace(), lease.name()))
}

async fn hold(manager: &LeaseManager, lease: &Lease, period: Duration) -> Result<ExitCode> {
    acquire(manager, lease).await?;
    eprintln!(
        "holding {}/{} for {}s (Ctrl-C to release early)",
        lease.namespace(),
        lease.name(),
        period.as_secs()
    );

    tokio::select! {
        _ = tokio::time::sleep(period) => {}
        signal = shutdown_signal() => {
            info!(signal, "releasing lease early");
        }
    }

    release(lease).await?;
    Ok(ExitCode::SUCCESS)
}

async fn exec(manager: &LeaseManager, lease: &Lease, command: &[String]) -> Result<ExitCode> {
    let Some((program, program_args)) = command.split_first() else {
        bail!("no command given");
    };

    acquire(manager, lease).await?;
    let mut child = match tokio::process::Command::new(program)
        .args(program_args)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            release(lease).await?;
            return Err(err).with_context(|| format!("failed to start {program}"));
        }
    };

    let code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(err) => {
                warn!(error = %err, "failed waiting for child process");
                1
            }
        },
        signal = shutdown_signal() => {
            info!(signal, "stopping child process");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill child process");
            }
            130
        }
    };

    release(lease).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
