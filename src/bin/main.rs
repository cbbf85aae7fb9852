//! dnsmapper binary entry point.

use clap::Parser;
use dnsmapper::{telemetry, Config, MapperServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS and HTTP probe server mapping clients to resolvers.
#[derive(Parser, Debug)]
#[command(name = "dnsmapper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Optional; environment variables
    /// prefixed with DNSMAPPER__ override it (`DNSMAPPER__ZONE__BASE_DOMAIN`).
    #[arg(short, long, default_value = "dnsmapper.toml")]
    config: PathBuf,
}

/// `DNSMAPPER__SECTION__KEY` overrides; list keys split on commas.
fn environment() -> config::Environment {
    config::Environment::with_prefix("DNSMAPPER")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("zone.nameservers")
        .with_list_parse_key("http.trusted_proxies")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(environment())
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        dns_addr = %config.dns.listen_addr,
        http_addr = %config.http.listen_addr,
        base_domain = %config.zone.base_domain,
        "Starting dnsmapper"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => {
                error!("unable to listen for interrupt: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    let result = match MapperServer::new(config) {
        Ok(server) => server.run(shutdown).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("dnsmapper error: {}", e);
        return Err(e.into());
    }

    info!("dnsmapper shutdown complete");
    Ok(())
}
