//! CLI argument definitions for `clqy`.

use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "clqy", about = "Colloquy agent runtime server", version)]
pub struct Cli {
    /// Increase log verbosity (-v: info, -vv: trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API and event stream server
    Serve {
        #[arg(long, default_value_t = 3010, env = "COLLOQUY_PORT")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1", env = "COLLOQUY_HOST")]
        host: String,

        /// Bridge tracing spans to OpenTelemetry (stdout exporter)
        #[arg(long)]
        otel: bool,
    },

    /// Follow a session's event stream from the terminal
    Tail {
        /// Session id to follow
        #[arg(long, conflicts_with = "operation")]
        session: Option<String>,

        /// Operation id to follow
        #[arg(long)]
        operation: Option<String>,

        /// Resume cursor (timestamp of the last seen event)
        #[arg(long, default_value = "0")]
        last_event_id: String,

        /// Replay recent history before live events
        #[arg(long)]
        include_history: bool,

        #[arg(long, default_value = "http://127.0.0.1:3010", env = "COLLOQUY_BASE_URL")]
        base_url: String,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
