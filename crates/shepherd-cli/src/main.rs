mod commands;

use clap::{Parser, Subcommand};
use commands::DoneOutcome;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shepherd", version, about = "Run a team of coding agents in tmux panes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "shepherd.toml", global = true)]
    config: PathBuf,

    /// Directory holding team state (overrides config)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a team and supervise it until every task is done
    Run {
        /// Team definition file
        team_file: PathBuf,
        /// Private tmux server socket
        #[arg(long)]
        socket: Option<String>,
    },
    /// Worker daemon that claims tasks and runs the agent on them
    Bridge {
        #[arg(long)]
        team: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        provider: String,
        /// Directory the agent works in
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
    /// Print a snapshot of a team's tasks and workers
    Monitor {
        #[arg(long)]
        team: String,
        #[arg(long)]
        socket: Option<String>,
    },
    /// Ask a running team to stop
    Shutdown {
        #[arg(long)]
        team: String,
        /// Let bridge workers finish their current task first
        #[arg(long)]
        drain: bool,
        #[arg(long, default_value = "requested by operator")]
        reason: String,
    },
    /// Queue a message for a worker's next prompt
    Send {
        #[arg(long)]
        team: String,
        #[arg(long)]
        worker: String,
        text: String,
    },
    /// Report the end of a task (run by interactive workers)
    Done {
        #[arg(long)]
        team: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        task: u64,
        /// One-line summary of the work
        #[arg(long, conflicts_with = "failed")]
        summary: Option<String>,
        /// Why the task could not be completed
        #[arg(long)]
        failed: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = commands::load_config(&cli.config, cli.data_root).await?;

    match cli.command {
        Commands::Run { team_file, socket } => {
            let result = commands::run(config, &cli.config, &team_file, socket).await?;
            print_json(&result)?;
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Bridge {
            team,
            worker,
            provider,
            cwd,
        } => {
            let cwd = std::path::absolute(cwd)?;
            commands::bridge(&config, &team, &worker, &provider, cwd).await?;
        }
        Commands::Monitor { team, socket } => {
            let snapshot = commands::monitor(&config, &team, socket).await?;
            print_json(&snapshot)?;
        }
        Commands::Shutdown {
            team,
            drain,
            reason,
        } => {
            let requested = commands::shutdown(&config, &team, drain, &reason).await?;
            print_json(&requested)?;
        }
        Commands::Send { team, worker, text } => {
            commands::send(&config, &team, &worker, &text).await?;
        }
        Commands::Done {
            team,
            worker,
            task,
            summary,
            failed,
        } => {
            let outcome = match failed {
                Some(reason) => DoneOutcome::Failed(reason),
                None => DoneOutcome::Completed(summary.unwrap_or_else(|| "done".into())),
            };
            commands::done(&config, &team, &worker, task, outcome).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
