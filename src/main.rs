//! leadbot command line: drive the funnel from a terminal, inspect
//! sessions, and work the human task queue.

mod cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use leadbot::config::{get_config_path, load_config, Config};

#[derive(Parser)]
#[command(name = "leadbot", about = "leadbot - lead qualification chatbot", version)]
struct Cli {
    /// Config file (default: $LEADBOT_CONFIG or ~/.leadbot/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the outcome as JSON.
    Chat {
        /// External session id.
        #[arg(short, long)]
        session: String,
        /// Message text.
        #[arg(short, long)]
        message: String,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Batch window in seconds (0 answers immediately).
        #[arg(long)]
        batch_wait: Option<u64>,
    },
    /// Interactive conversation on stdin.
    Talk {
        #[arg(short, long, default_value = "cli:default")]
        session: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Show a session's stage, counters and collected info.
    Session { id: String },
    /// Print a session transcript.
    History {
        id: String,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// List recently active sessions.
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List human tasks.
    Tasks {
        /// Include completed tasks.
        #[arg(long)]
        all: bool,
    },
    /// Update a human task (closing it resumes the bot).
    CloseTask {
        id: i64,
        #[arg(long, default_value = "closed")]
        status: String,
        #[arg(long)]
        assignee: Option<String>,
    },
    /// Rate or comment an assistant message.
    Review {
        message_id: i64,
        /// 1 to 5.
        #[arg(short, long)]
        rating: Option<u8>,
        #[arg(short, long)]
        note: String,
        #[arg(long)]
        author: Option<String>,
    },
    /// Add an operator note to a session (without text: list its notes).
    Note {
        session: String,
        text: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Print the stage catalog.
    Stages,
    /// Show configuration and provider health.
    Status,
    /// Write a default config file.
    Init,
}

fn init_logging(config: &Config, json: bool) {
    // RUST_LOG wins; otherwise the configured level. HTTP internals stay quiet.
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| config.app.log_level.clone());
    let env_filter = EnvFilter::try_new(format!("{},hyper=warn,reqwest=warn", base))
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    // stderr keeps stdout clean for JSON output.
    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    }
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(get_config_path);
    let config = load_config(Some(&config_path));
    init_logging(&config, cli.json_logs);

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "leadbot started"
    );

    let result = match cli.command {
        Commands::Chat {
            session,
            message,
            model,
            batch_wait,
        } => cli::cmd_chat(&config, &session, &message, model, batch_wait),
        Commands::Talk { session, model } => cli::cmd_talk(&config, &session, model),
        Commands::Session { id } => cli::cmd_session(&config, &id),
        Commands::History { id, limit } => cli::cmd_history(&config, &id, limit),
        Commands::Sessions { limit } => cli::cmd_sessions(&config, limit),
        Commands::Tasks { all } => cli::cmd_tasks(&config, all),
        Commands::CloseTask {
            id,
            status,
            assignee,
        } => cli::cmd_close_task(&config, id, &status, assignee.as_deref()),
        Commands::Review {
            message_id,
            rating,
            note,
            author,
        } => cli::cmd_review(&config, message_id, rating, &note, author.as_deref()),
        Commands::Note {
            session,
            text,
            author,
        } => cli::cmd_note(&config, &session, text.as_deref(), author.as_deref()),
        Commands::Stages => cli::cmd_stages(&config),
        Commands::Status => cli::cmd_status(&config, &config_path),
        Commands::Init => cli::cmd_init(&config_path),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
