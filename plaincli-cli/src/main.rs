//! plaincli-cli - runs one command on a plaincli server.
//!
//! Local stdin is streamed to the command, its output is written to the
//! local stdout/stderr, and the process exits with the command's status.

use clap::Parser;
use colored::Colorize;
use plaincli_client::{Client, ConnectionConfig, Outcome, Request, DEFAULT_PING_INTERVAL};
use plaincli_protocol::CloseReason;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Status used when the session ends without an EXIT frame.
const NO_STATUS: i32 = 255;

#[derive(Parser)]
#[command(name = "plaincli-cli")]
#[command(about = "Run a command on a plaincli server")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "PLAINCLI_SERVER", default_value = "127.0.0.1:7420")]
    server: SocketAddr,

    /// Locale sent to the server (defaults to LC_ALL / LANG)
    #[arg(long)]
    locale: Option<String>,

    /// Character encoding sent to the server
    #[arg(long, default_value = "UTF-8")]
    encoding: String,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Keepalive interval in seconds while the command runs (0 = off)
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL.as_secs())]
    ping_interval: u64,

    /// Command name followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn request(&self) -> Request {
        let mut request = Request::from_env(self.command.iter().cloned())
            .with_encoding(self.encoding.clone());
        if let Some(locale) = &self.locale {
            request = request.with_locale(locale.clone());
        }
        request
    }

    fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.server)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout));
        if self.ping_interval > 0 {
            config = config.with_ping_interval(Duration::from_secs(self.ping_interval));
        }
        config
    }
}

fn exit_status(outcome: &Outcome) -> i32 {
    match outcome.exit_code {
        Some(code) => code,
        None => {
            match &outcome.close {
                CloseReason::Corrupt(corruption) => {
                    eprintln!("{}: {}", "Error".red(), corruption);
                }
                reason => {
                    eprintln!(
                        "{}: connection ended without an exit status ({})",
                        "Error".red(),
                        reason
                    );
                }
            }
            NO_STATUS
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new(cli.connection_config());

    let result = client
        .run(
            &cli.request(),
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await;

    let status = match result {
        Ok(outcome) => exit_status(&outcome),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            NO_STATUS
        }
    };
    std::process::exit(status);
}
