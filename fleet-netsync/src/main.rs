use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_netsync::audit::create_audit_logger;
use fleet_netsync::{
    InterfaceInfos, MemoryStore, ModelOperation, ReconcileConfig, UpdateMachineLinkLayerOp,
    apply_operation,
};

#[derive(Parser)]
#[command(name = "fleet-netsync")]
#[command(about = "Reconcile a machine's observed network interfaces with persisted link-layer state")]
struct Args {
    /// Link-layer state file (JSON). Created if it does not exist.
    #[arg(short, long, default_value = "/var/lib/fleet-netsync/state.json")]
    state: PathBuf,

    /// Machine to reconcile
    #[arg(short, long)]
    machine: String,

    /// Observed interfaces (JSON array)
    #[arg(short, long)]
    observed: PathBuf,

    /// Reconciliation settings (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum build-and-apply passes (overrides the config file)
    #[arg(long)]
    max_attempts: Option<usize>,

    /// Timeout for a single transaction in milliseconds (overrides the config file)
    #[arg(long)]
    apply_timeout_ms: Option<u64>,

    /// Add the machine as alive if it is not in the state file
    #[arg(long)]
    create_machine: bool,

    /// Print the operations of one pass instead of applying them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleet_netsync=info".parse()?)
                .add_directive("audit=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ReconcileConfig::load(path).await?,
        None => ReconcileConfig::default(),
    };
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(timeout) = args.apply_timeout_ms {
        config.apply_timeout_ms = Some(timeout);
    }

    let store = if tokio::fs::try_exists(&args.state).await? {
        MemoryStore::load(&args.state).await?
    } else {
        warn!("State file {} not found, starting empty", args.state.display());
        MemoryStore::new()
    };

    let created = args.create_machine && store.add_machine(&args.machine).await;
    if created {
        info!("Created machine {}", args.machine);
    }

    let raw = tokio::fs::read(&args.observed).await?;
    let incoming: InterfaceInfos = serde_json::from_slice(&raw)?;
    info!(
        "Reconciling machine {} against {} observed interfaces",
        args.machine,
        incoming.len()
    );

    let machine = store.machine(&args.machine).await?;
    let audit = create_audit_logger();
    let mut op = UpdateMachineLinkLayerOp::new(machine, incoming).with_audit(audit.clone());

    if args.dry_run {
        let ops = op.build(0).await?;
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }

    let mut events = store.subscribe();
    let outcome = apply_operation(&store, &mut op, &config).await?;

    loop {
        match events.try_recv() {
            Ok(event) => audit.record_event(&event),
            Err(TryRecvError::Lagged(n)) => warn!("Audit skipped {} change events", n),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    if outcome.applied {
        info!(
            "Applied {} operations in {} attempt(s)",
            outcome.ops, outcome.attempts
        );
    } else {
        info!("No link-layer changes for machine {}", args.machine);
    }

    if outcome.applied || created {
        if let Some(dir) = args.state.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        store.save(&args.state).await?;
        info!("State saved to {}", args.state.display());
    }

    Ok(())
}
