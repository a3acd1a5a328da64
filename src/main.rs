//! Presence Chat Server - Entry Point
//!
//! Resolves configuration, installs logging, binds the listener and runs
//! the event loop on a current-thread runtime.

use clap::Parser;
use tracing::{error, info, info_span};

use presence_chat::{logging, Cli, Config, ConfigError, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // Use RUST_LOG env var to override the level
    // e.g., RUST_LOG=presence_chat=trace
    logging::init(&cli.log_level, cli.log_file.as_deref())?;

    let server = match start(&cli) {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };

    let addr = server.local_addr()?;
    info!("Chat server listening on {}", addr);

    server.with_span(info_span!("server", %addr)).run().await;
    Ok(())
}

/// Everything that must succeed before serving
fn start(cli: &Cli) -> Result<Server, ConfigError> {
    let config = Config::resolve(cli)?;
    let settings = config.validate()?;
    let schemas = config.load_schemas()?;
    Server::bind(&settings, schemas)
}
