use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crucible::config::{ContractCtx, HpConfig};
use crucible::node::{self, Node};

#[derive(Parser)]
#[command(author, version, about = "Decentralized smart-contract execution node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new contract directory with default config and signing keys
    New { dir: PathBuf },
    /// Generate a new keypair and replace this node's entry in the unl
    Rekey { dir: PathBuf },
    /// Run the node against an existing contract directory
    Run { dir: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::New { dir } => {
            init_console_logging();
            node::create_contract(&dir)
        }
        Commands::Rekey { dir } => {
            init_console_logging();
            node::rekey(&dir)
        }
        Commands::Run { dir } => run_node(dir),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_node(dir: PathBuf) -> crucible::errors::NodeResult<()> {
    let ctx = ContractCtx::new(&dir);
    // Logging setup follows the config, so peek at it before wiring the node.
    match HpConfig::load(&ctx.config_file) {
        Ok(config) => init_config_logging(&config, &ctx),
        Err(_) => init_console_logging(),
    }
    let node = Node::init(&dir)?;
    node.run()
}

fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn init_config_logging(config: &HpConfig, ctx: &ContractCtx) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));
    let console_layer = config
        .log
        .loggers
        .contains("console")
        .then(tracing_subscriber::fmt::layer);
    let file_layer = config.log.loggers.contains("file").then(|| {
        let appender = tracing_appender::rolling::never(&ctx.log_dir, "crucible.log");
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
    });
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
