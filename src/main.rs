//! echo-server: A concurrent TCP echo server
//!
//! Accepts TCP connections (default `0.0.0.0:1234`) and echoes every byte
//! received on a connection back to the same peer, unchanged and in order,
//! until the peer disconnects.
//!
//! Features:
//! - One independently spawned session per connection
//! - Single-threaded cooperative runtime by default, multi-threaded on request
//! - Optional read/write timeouts, connection ceiling and bind retry
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;
mod server;
mod session;

use config::Config;
use runtime::ShutdownTrigger;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging: failures to stderr, everything else to stdout
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr.with_max_level(Level::WARN).or_else(std::io::stdout))
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = ?config.max_connections,
        buffer_size = config.buffer_size,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        "Starting echo server"
    );

    let rt = runtime::build(config.workers)?;

    // Never fired: the process runs until it is killed.
    let trigger = ShutdownTrigger::new();

    let result = rt.block_on(server::serve(&config, rt.handle().clone(), trigger.subscribe()));
    if let Err(e) = result {
        error!(error = %e, kind = ?e.io_error().kind(), "TCP listener stopped");
    }

    Ok(())
}
