use clap::{Parser, Subcommand};
use omc_lib::commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "omc-team")]
#[command(about = "Orchestrate teams of interactive AI agent CLIs inside tmux panes")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler runtime: JSON start request on stdin, final
    /// JSON summary on stdout
    Run,

    /// Serve the background job supervisor over stdio (MCP)
    Serve,

    /// Show a point-in-time snapshot of a team
    Status {
        /// Team name
        name: String,
    },

    /// Shut a team down: sentinel, bounded ack wait, pane kills, cleanup
    Shutdown {
        /// Team name
        name: String,
        /// Milliseconds to wait for worker acknowledgements
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr; stdout is a protocol channel for
    // `run` and `serve`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run => commands::run::execute().await,
        Commands::Serve => commands::serve::execute().await,
        Commands::Status { name } => commands::status::execute(&name).await,
        Commands::Shutdown { name, timeout_ms } => {
            commands::shutdown::execute(&name, timeout_ms).await
        }
    };

    std::process::exit(code);
}
