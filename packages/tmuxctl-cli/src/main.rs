mod tools;

use anyhow::Context;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tmuxctl_core::{ClientConfig, TmuxControlClient};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tmuxctl",
    version,
    about = "Drive tmux through control mode: run commands, read panes, wait for output"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Session to attach to (a new session is created when omitted)
    #[arg(short, long, global = true)]
    session: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List session names
    Sessions,

    /// List panes as `id<TAB>command<TAB>path`
    Panes {
        /// Session, window or pane to list (all panes when omitted)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Run a raw tmux command and print its output
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Send keys to a pane; newlines become Enter
    SendKeys {
        /// Pane ID (e.g., %5)
        pane_id: String,
        keys: String,
    },

    /// Print pane content without escape sequences
    Capture {
        /// Pane ID (e.g., %5)
        pane_id: String,

        /// Include this many lines of history
        #[arg(short, long)]
        lines: Option<u32>,
    },

    /// Wait until a regex matches new output of a pane
    Wait {
        /// Pane ID (e.g., %5)
        pane_id: String,
        pattern: String,

        /// Defaults to wait_timeout_ms from the config
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Answer JSON-lines tool calls on stdin
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => {
            tracing::info!("Using config file: {:?}", path);
            ClientConfig::load(path)?
        }
        None => ClientConfig::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let client = TmuxControlClient::new(config);

    if let Commands::Serve = cli.command {
        tracing::info!("tmuxctl tool host running");
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        return tools::serve(&client, stdin, tokio::io::stdout()).await;
    }

    client
        .connect(cli.session.as_deref())
        .await
        .context("could not connect to tmux")?;
    let outcome = run(&client, cli.command).await;
    client.disconnect().await;
    outcome
}

async fn run(client: &TmuxControlClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Sessions => {
            for session in client.list_sessions().await? {
                println!("{}", session);
            }
        }
        Commands::Panes { target } => {
            for pane in client.list_panes(target.as_deref()).await? {
                println!("{}", tools::format_pane(&pane));
            }
        }
        Commands::Run { command } => {
            let result = client.run_command(&command.join(" ")).await?;
            for line in result.lines {
                println!("{}", line);
            }
        }
        Commands::SendKeys { pane_id, keys } => {
            client.send_keys(&pane_id, &keys).await?;
        }
        Commands::Capture { pane_id, lines } => {
            println!("{}", client.capture_pane(&pane_id, lines).await?);
        }
        Commands::Wait {
            pane_id,
            pattern,
            timeout_ms,
        } => {
            let pattern = Regex::new(&pattern).with_context(|| format!("invalid pattern `{}`", pattern))?;
            let output = client
                .wait_for_output(&pane_id, &pattern, timeout_ms.map(Duration::from_millis))
                .await?;
            println!("{}", output);
        }
        Commands::Serve => anyhow::bail!("serve runs without a one-shot connection"),
    }
    Ok(())
}
