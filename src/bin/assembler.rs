use clap::Parser;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use petal::config::{AssemblerArgs, Settings};
use petal::db::{Database, FlowStore};
use petal::pipeline::Pipeline;
use petal::source::CaptureService;

const FLOW_CHANNEL_LIMIT: usize = 256;
const DRAIN_GRACE: Duration = Duration::from_secs(7);

#[tokio::main]
async fn main() {
    let args = AssemblerArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("petal=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt::fmt().with_env_filter(filter).init();

    let settings = match Settings::resolve(args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            exit(1);
        }
    };

    if settings.watch_dir.is_none()
        && settings.pcap_over_ip.is_empty()
        && settings.pcap_files.is_empty()
    {
        error!("Nothing to capture: pass pcap files, -dir or -pcap-over-ip");
        exit(1);
    }

    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(lim) => info!(soft = lim, "Raised NOFILE limits"),
        Err(e) => warn!("Failed to raise NOFILE limits: {}", e),
    }

    let db = match Database::connect(&settings.db_url).await {
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

    let store = FlowStore::new(db.clone());
    let shutdown = Arc::new(AtomicBool::new(false));
    let (flows_tx, flows_rx) = mpsc::channel(FLOW_CHANNEL_LIMIT);

    let service = match CaptureService::new(db.clone(), flows_tx, &settings, shutdown.clone()) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start capture service: {:#}", e);
            exit(1);
        }
    };

    let pcap_files = settings.pcap_files.clone();
    let watch_dir = settings.watch_dir.clone();
    let pcap_over_ip = settings.pcap_over_ip.clone();
    let flush_interval = settings.flush_interval;

    let pipeline = match Pipeline::start(db.clone(), store.clone(), settings, flows_rx) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to start flow pipeline: {:#}", e);
            exit(1);
        }
    };

    // Sweep the reassembly pools even when no packets arrive; this is what
    // completes idle UDP pseudo-flows on quiet links.
    {
        let service = service.clone();
        tokio::task::spawn_blocking(move || {
            while !service.is_shutdown() {
                std::thread::sleep(Duration::from_secs(1).min(flush_interval));
                service.flush_connections();
            }
        });
    }

    // Positional files first, in order
    for path in pcap_files {
        let service = service.clone();
        let done = tokio::task::spawn_blocking(move || service.process_file(&path)).await;
        if let Err(e) = done {
            warn!("Capture task failed: {}", e);
        }
    }

    let mut sources = vec![];
    if !pcap_over_ip.is_empty() {
        // Live capture takes precedence over the watch dir
        for endpoint in pcap_over_ip {
            sources.push(tokio::spawn(service.clone().pcap_over_ip(endpoint)));
        }
    } else if let Some(dir) = watch_dir {
        let service = service.clone();
        sources.push(tokio::spawn(async move {
            if let Err(e) = service.watch_dir(dir).await {
                error!("Watcher failed: {:#}", e);
            }
        }));
    }

    if sources.is_empty() {
        info!("All pcap files processed");
    } else {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Caught interrupt, shutting down"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    }

    shutdown.store(true, Ordering::Release);
    for source in &sources {
        source.abort();
    }

    // Hand the last in-flight conversations to the workers
    {
        let service = service.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            service.drain();
            service.close_dump();
        })
        .await
        {
            warn!("Drain failed: {}", e);
        }
    }
    drop(service);

    match tokio::time::timeout(Duration::from_secs(30), pipeline.join()).await {
        Ok(()) => info!("Pipeline drained"),
        Err(_) => warn!("Pipeline did not drain in time"),
    }

    // Give the batchers their timeout to commit the final partial batch
    tokio::time::sleep(DRAIN_GRACE).await;
    info!("Bye!");
    exit(0)
}
