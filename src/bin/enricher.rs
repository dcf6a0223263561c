use clap::Parser;
use std::process::exit;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use petal::config::EnricherArgs;
use petal::db::Database;
use petal::eve::{Enricher, EveReader};

/// Window around an event's flow start when matching it to a stored flow.
const MATCH_WINDOW_SECS: i64 = 60;

#[tokio::main]
async fn main() {
    let args = EnricherArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("petal=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt::fmt().with_env_filter(filter).init();

    match std::fs::metadata(&args.eve) {
        Ok(stat) if stat.is_file() => {}
        Ok(_) => {
            error!("{} is not a file", args.eve.display());
            exit(1);
        }
        Err(e) => {
            error!("Failed to open eve file {}: {}", args.eve.display(), e);
            exit(1);
        }
    }

    let db = match Database::connect(&args.timescale).await {
        Ok(db) => db,
        Err(e) => {
            error!("Database unreachable: {:#}", e);
            exit(1);
        }
    };
    if let Err(e) = db.configure().await {
        error!("Failed to configure database: {:#}", e);
        exit(1);
    }

    let mut enricher = Enricher {
        db,
        reader: EveReader::new(args.eve.clone()),
        window: chrono::Duration::seconds(MATCH_WINDOW_SECS),
        flowbits: args.flowbits,
    };

    info!("Monitoring eve file {}", args.eve.display());
    let period = Duration::from_secs(args.rescan_period.max(1));

    loop {
        match enricher.scan().await {
            Ok(0) => {}
            Ok(updated) => info!("Attached signatures to {} flows", updated),
            Err(e) => warn!("Eve scan failed: {:#}", e),
        }

        tokio::select! {
            _ = sleep(period) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Unable to listen for shutdown signal: {}", e);
                }
                info!("Bye!");
                exit(0)
            }
        }
    }
}
