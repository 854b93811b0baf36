//! Standalone relay binary.
//!
//! Reads `Server.cfg` from the working directory. A missing file is
//! generated from the commented template and the process exits cleanly so
//! the operator can fill in the AuthKey; an empty AuthKey is fatal.
//!
//! Exit codes: 0 on clean shutdown or generated config, -1 on fatal
//! configuration errors or backend rejection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_server::heartbeat;
use relay_server::identity::BackendIdentity;
use relay_server::server::{Relay, RelayOptions};
use relay_shared::config::{ConfigError, ServerConfig};
use tracing::{debug, error, info};

/// Pause before exiting so a double-click operator can read the message.
const OPERATOR_PAUSE: Duration = Duration::from_secs(3);

fn load_config(path: &Path) -> ServerConfig {
    match ServerConfig::load(path) {
        Ok(config) => config,
        Err(ConfigError::Missing) => {
            eprintln!("configuration not found, generating {}", path.display());
            if let Err(e) = ServerConfig::write_default(path) {
                eprintln!("could not write default configuration: {e}");
            }
            eprintln!("fill in the AuthKey, then start the server again");
            std::thread::sleep(OPERATOR_PAUSE);
            std::process::exit(0);
        }
        Err(ConfigError::EmptyAuthKey) => {
            eprintln!("no AuthKey was found in {}", path.display());
            std::thread::sleep(OPERATOR_PAUSE);
            std::process::exit(-1);
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::thread::sleep(OPERATOR_PAUSE);
            std::process::exit(-1);
        }
    }
}

#[tokio::main]
async fn main() {
    let config = load_config(Path::new("Server.cfg"));

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if config.debug {
        debug!(
            port = config.port,
            max_cars = config.max_cars,
            max_players = config.max_players,
            map = %config.map,
            name = %config.name,
            resource_dir = %config.resource_dir,
            key_len = config.auth_key.len(),
            "effective configuration"
        );
    }

    let options = RelayOptions::new(config, Arc::new(BackendIdentity::new()));
    let relay = match Relay::bind(options).await {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "could not start the relay");
            std::process::exit(-1);
        }
    };
    info!(addr = %relay.local_addr().expect("bound listener"), "relay starting");

    let beat = tokio::spawn(heartbeat::run(relay.clone()));
    tokio::select! {
        served = relay.serve() => {
            if let Err(e) = served {
                error!(error = %e, "relay stopped");
                std::process::exit(-1);
            }
        }
        refused = beat => {
            match refused {
                Ok(Err(e)) => error!(error = %e, "heartbeat stopped"),
                Ok(Ok(())) => {}
                Err(e) => error!(error = %e, "heartbeat task failed"),
            }
            std::process::exit(-1);
        }
    }
}
