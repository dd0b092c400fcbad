//! Tandem relay server
//!
//! # Usage
//!
//! ```bash
//! tandem-relay --port 6789
//! ```

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_signal::{RelayServer, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(about = "Signaling relay for tandem sessions")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TANDEM_RELAY_PORT")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    info!("Starting tandem relay");
    RelayServer::new().serve(addr).await?;

    Ok(())
}
