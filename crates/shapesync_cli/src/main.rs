//! shapesync CLI
//!
//! Command-line tools for shape logs.
//!
//! # Commands
//!
//! - `tail` - Follow a shape and print every event
//! - `version` - Show version information

mod commands;
mod error;

use clap::{Parser, Subcommand};
use commands::tail::{OutputFormat, TailArgs};
use tracing_subscriber::EnvFilter;

/// Follow shape logs from the command line.
#[derive(Parser)]
#[command(name = "shapesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a shape and print one line per event
    Tail {
        /// Shape endpoint
        #[arg(long, env = "SHAPESYNC_URL")]
        url: String,

        /// Table to follow
        #[arg(short, long)]
        table: String,

        /// Row filter, forwarded to the server verbatim
        #[arg(short, long = "where")]
        where_clause: Option<String>,

        /// Comma-separated column selection
        #[arg(short, long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Extra query parameter as name=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Extra request header as name=value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Exit once the shape is up to date instead of long-polling
        #[arg(long)]
        no_live: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only events.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Tail {
            url,
            table,
            where_clause,
            columns,
            params,
            headers,
            no_live,
            format,
        } => {
            let args = TailArgs {
                url,
                table,
                where_clause,
                columns,
                params,
                headers,
                live: !no_live,
                format,
            };
            commands::tail::run(args).await?;
        }
        Commands::Version => {
            println!("shapesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("params version {}", shapesync_protocol::PARAMS_VERSION);
        }
    }

    Ok(())
}
