mod cmd;
mod config_path;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "timekeeper",
    about = "Natural-language timers, delayed action sequences and alarm escalation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest timekeeper.yaml, walking up from cwd)
    #[arg(long, global = true, env = "TIMEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a phrase and print the plan without starting anything
    Parse {
        /// The utterance, e.g. "turn on the porch light for 10 minutes"
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Room the utterance came from
        #[arg(long)]
        room: Option<String>,
    },

    /// Interactive console against simulated countdowns
    Run {
        /// Room the utterances come from
        #[arg(long)]
        room: Option<String>,
        /// Who is speaking
        #[arg(long)]
        speaker: Option<String>,
        /// Print lifecycle events as they happen
        #[arg(long)]
        events: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "3150", env = "TIMEKEEPER_PORT")]
        port: u16,
    },

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_file = config_path::resolve_config_path(cli.config.as_deref());

    let result = match cli.command {
        Commands::Parse { text, room } => {
            cmd::parse::run(&config_file, &text.join(" "), room.as_deref(), cli.json)
        }
        Commands::Run {
            room,
            speaker,
            events,
        } => cmd::run::run(&config_file, room, speaker, events, cli.json),
        Commands::Serve { port } => cmd::serve::run(&config_file, port),
        Commands::Config { subcommand } => cmd::config::run(&config_file, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
