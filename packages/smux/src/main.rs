use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use session_mux::{ConnectionConfig, FileConfig, MuxConfig, SessionId, load_config};

mod attach;
mod terminal;
mod ws_transport;

#[derive(Parser)]
#[command(name = "smux")]
#[command(about = "Attach to several remote terminal sessions over one connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./smux.toml; missing is fine)
    #[arg(long, global = true, default_value = "smux.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to one or more sessions (Ctrl-^ cycles, Ctrl-] detaches)
    Attach(AttachArgs),

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Parser)]
struct AttachArgs {
    /// Session ids, in the order Ctrl-^ cycles through them
    #[arg(required = true)]
    sessions: Vec<String>,

    /// Server WebSocket URL (overrides [connection] url)
    #[arg(long)]
    url: Option<String>,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "smux=debug,session_mux=debug,warn"
    } else {
        "smux=warn,session_mux=warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    // stderr, so log lines never land in the session transcript
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&file_config)?);
            Ok(())
        }
        Commands::Attach(args) => {
            let conn_config = ConnectionConfig::from_file(&file_config.connection);
            let url = args
                .url
                .or_else(|| conn_config.url.clone())
                .context("no server URL: pass --url or set [connection] url")?;
            let sessions = args.sessions.into_iter().map(SessionId::from).collect();

            attach::attach(
                url,
                MuxConfig::from_file(&file_config),
                conn_config,
                sessions,
            )
            .await
            .map(|_| ())
        }
    }
}
