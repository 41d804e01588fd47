mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    actor::ActorSubcommand, app::AppSubcommand, config::ConfigSubcommand, jobs::JobsSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "appflow",
    about = "Application lifecycle workflow engine: submit, review and execute status transitions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .appflow/)
    #[arg(long, global = true, env = "APPFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize appflow in the current directory
    Init,

    /// Manage actors (providers, admins, users)
    Actor {
        #[command(subcommand)]
        subcommand: ActorSubcommand,
    },

    /// Manage applications
    App {
        #[command(subcommand)]
        subcommand: AppSubcommand,
    },

    /// Request a status transition. Only enqueues; `appflow work` executes it.
    Submit {
        /// Application id
        app: String,
        /// Requested status (draft, pending, approved, ...)
        status: String,
        /// Requesting actor id
        #[arg(long)]
        by: String,
        /// Admin co-signing the request up front
        #[arg(long)]
        reviewer: Option<String>,
    },

    /// Co-sign a job that is waiting for admin review
    Review {
        /// Job id
        job: String,
        /// Reviewing admin id
        #[arg(long)]
        by: String,
        /// Make the job due immediately instead of at the end of its review interval
        #[arg(long)]
        now: bool,
    },

    /// Run the worker pool (Ctrl-C to stop)
    Work {
        /// Process every job that is due now, then exit
        #[arg(long)]
        drain: bool,
    },

    /// Inspect and repair queued jobs
    Jobs {
        #[command(subcommand)]
        subcommand: JobsSubcommand,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Work { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root_path = cli.root.as_deref();
    let root = root::resolve_root(root_path);

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Actor { subcommand } => cmd::actor::run(&root, subcommand, cli.json),
        Commands::App { subcommand } => cmd::app::run(&root, subcommand, cli.json),
        Commands::Submit {
            app,
            status,
            by,
            reviewer,
        } => cmd::submit::run(&root, &app, &status, &by, reviewer.as_deref(), cli.json),
        Commands::Review { job, by, now } => cmd::review::run(&root, &job, &by, now, cli.json),
        Commands::Work { drain } => cmd::work::run(&root, drain, cli.json),
        Commands::Jobs { subcommand } => cmd::jobs::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
