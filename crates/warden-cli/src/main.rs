mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    fleet::FleetSubcommand, host::HostSubcommand, run::RunSubcommand,
    snapshot::SnapshotSubcommand, Session,
};
use std::path::PathBuf;
use warden_core::types::{ActionMode, Role};

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Host security posture, guarded remediation queue and containment kits",
    version,
    propagate_version = true
)]
struct Cli {
    /// Warden root (default: auto-detect from .warden/)
    #[arg(long, global = true, env = "WARDEN_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// User id recorded on queued runs and audit entries
    #[arg(long = "as", global = true, env = "WARDEN_ACTOR", default_value = "operator")]
    actor: String,

    /// Role of the acting user: viewer, ops, or admin
    #[arg(long, global = true, env = "WARDEN_ROLE", default_value = "ops")]
    role: Role,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .warden/ with a default config and an empty store
    Init,

    /// Register and configure hosts
    Host {
        #[command(subcommand)]
        subcommand: HostSubcommand,
    },

    /// Ingest status snapshots
    Snapshot {
        #[command(subcommand)]
        subcommand: SnapshotSubcommand,
    },

    /// Show the deduplicated signal timeline for a host
    Timeline {
        host: String,
        /// Show at most this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Score a host's security posture
    Posture { host: String },

    /// Show the remediation plan for a host
    Plan { host: String },

    /// Render the containment kit for a host
    Kit { host: String },

    /// Show the resolved policy for a host, or validate the config
    Policy { host: Option<String> },

    /// Queue a plan action for a host
    Queue {
        host: String,
        action: String,
        /// dry-run or execute
        #[arg(long, default_value = "dry-run")]
        mode: ActionMode,
        /// Confirm phrase required for execute mode (EXECUTE <action>)
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Inspect and manage queued runs
    Run {
        #[command(subcommand)]
        subcommand: RunSubcommand,
    },

    /// Drain ready runs from the queue
    Drain {
        /// Maximum number of runs to process
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Auto-queue safe actions for one host, or every enabled host
    Auto { host: Option<String> },

    /// Plan staged fleet rollouts
    Fleet {
        #[command(subcommand)]
        subcommand: FleetSubcommand,
    },

    /// Show the audit trail
    Audit {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        run: Option<String>,
        /// Event name, e.g. run_failed
        #[arg(long)]
        event: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Delete finished runs and audit entries past the retention window
    Prune {
        /// Keep this many days instead of the configured retention_days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Run autonomous cycles and a background drain worker until interrupted
    Daemon {
        /// Seconds between autonomous cycles
        #[arg(long, default_value = "60")]
        interval_secs: u64,
        /// Maximum runs per background drain
        #[arg(long, default_value = "10")]
        drain_limit: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Daemon { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let session = Session::new(root, cli.json, &cli.actor, cli.role);

    let result = match cli.command {
        Commands::Init => cmd::init::run(&session),
        Commands::Host { subcommand } => cmd::host::run(&session, subcommand),
        Commands::Snapshot { subcommand } => cmd::snapshot::run(&session, subcommand),
        Commands::Timeline { host, limit } => cmd::assess::timeline(&session, &host, limit),
        Commands::Posture { host } => cmd::assess::posture(&session, &host),
        Commands::Plan { host } => cmd::assess::plan(&session, &host),
        Commands::Kit { host } => cmd::assess::kit(&session, &host),
        Commands::Policy { host } => cmd::policy::run(&session, host.as_deref()),
        Commands::Queue {
            host,
            action,
            mode,
            confirm,
        } => cmd::queue::run(&session, &host, &action, mode, confirm),
        Commands::Run { subcommand } => cmd::run::run(&session, subcommand),
        Commands::Drain { limit } => cmd::queue::drain(&session, limit),
        Commands::Auto { host } => cmd::queue::auto(&session, host.as_deref()),
        Commands::Fleet { subcommand } => cmd::fleet::run(&session, subcommand),
        Commands::Audit {
            host,
            run,
            event,
            limit,
        } => cmd::audit::run(&session, host, run.as_deref(), event.as_deref(), limit),
        Commands::Prune { days } => cmd::audit::prune(&session, days),
        Commands::Daemon {
            interval_secs,
            drain_limit,
        } => cmd::daemon::run(&session, interval_secs, drain_limit),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
