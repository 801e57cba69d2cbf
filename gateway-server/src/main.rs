//! Process entry point. Boots the SQLite-backed data plane, spawns its
//! background maintenance loops on the tokio runtime, and runs the pingora
//! HTTP proxy server on its own thread -- the same split the teacher uses
//! in `router-core/src/main.rs`, where `system::server::init()` blocks a
//! dedicated thread while the async main loop handles control flow.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gateway_core::config_store::SqliteConfigStore;
use gateway_core::dataplane::DataPlane;
use gateway_core::logsink::LogSinkConfig;
use log::info;
use pingora::prelude::Opt;
use pingora::server::{RunArgs, Server};

/// Host-routed HTTP reverse proxy data plane.
#[derive(Parser, Debug)]
#[command(name = "gateway-server")]
struct Args {
    /// Address the proxy listens on for client traffic.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path to the SQLite configuration/log database.
    #[arg(long, default_value = "./data/gateway.db")]
    db_path: String,

    /// Log-sink batch threshold, overrides LOG_BATCH_SIZE if set.
    #[arg(long)]
    log_batch_size: Option<usize>,

    /// Log-sink flush interval in seconds, overrides LOG_FLUSH_TIME if set.
    #[arg(long)]
    log_flush_seconds: Option<u64>,
}

fn log_sink_config(args: &Args) -> LogSinkConfig {
    let batch_size = args
        .log_batch_size
        .or_else(|| std::env::var("LOG_BATCH_SIZE").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(50);
    let flush_seconds = args
        .log_flush_seconds
        .or_else(|| std::env::var("LOG_FLUSH_TIME").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(5);
    LogSinkConfig {
        batch_size,
        flush_interval: Duration::from_secs(flush_seconds),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("starting data plane, db at {}", args.db_path);
    let store = Arc::new(
        SqliteConfigStore::open(&args.db_path).expect("failed to open configuration database"),
    );
    let data_plane = Arc::new(DataPlane::new(store, log_sink_config(&args)));
    data_plane.run_background_loops().await;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown_requested.clone();
        ctrlc::set_handler(move || {
            log::info!("SIGINT received, shutting down");
            flag.store(true, Ordering::SeqCst);
        })
        .expect("failed to install SIGINT handler");
    }

    info!("starting proxy listener on {}", args.listen);
    let listen_addr = args.listen.to_string();
    let pipeline = data_plane.pipeline();
    std::thread::spawn(move || {
        let mut server = Server::new(Some(Opt::default())).expect("failed to create pingora server");
        server.bootstrap();
        let mut proxy_service = pingora::proxy::http_proxy_service(&server.configuration, pipeline);
        proxy_service.add_tcp(&listen_addr);
        server.add_service(proxy_service);
        server.run(RunArgs::default());
    });

    while !shutdown_requested.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    data_plane.shutdown();
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("shutdown complete");
}
