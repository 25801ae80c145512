use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use docdb::document::ddl::DdlConfig;
use docdb::document::Store;
use docdb::storage::log_cask::LogCask;
use docdb_server::config::ServerConfig;
use docdb_server::{rpc, trace};

#[derive(Debug, Parser)]
#[command(author, version, about = "docdb RPC server")]
struct Args {
    /// Configuration file path; falls back to built-in defaults if absent.
    #[clap(short = 'c', long = "config")]
    config: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Starts the RPC server, serving until Ctrl-C.
    Start,
    /// Prints the effective configuration and exits.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg: ServerConfig = match &args.config {
        Some(path) => confy::load_path(path)?,
        None => ServerConfig::load("docdb-server")?,
    };

    trace::init_logging(&format!("{}/log", cfg.data_dir), &cfg.log_level)?;
    info!("docdb-server starting with config: {:?}", cfg);

    match args.cmd {
        Command::Status => {
            println!("{:#?}", cfg);
            Ok(())
        }
        Command::Start => run_server(cfg).await,
    }
}

async fn run_server(cfg: ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)?;
    let engine = LogCask::new(std::path::PathBuf::from(&cfg.data_dir).join("docdb.log"))?;

    let ddl_config = DdlConfig {
        lease: cfg.lease(),
        worker_max_tick_interval: cfg.worker_max_tick_interval(),
    };
    let store = Store::open(engine, ddl_config)?;
    store.spawn_reloader(cfg.reload_max_tick_interval());

    let engine_handle = store.engine();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr.as_str()).await?;
    info!("listening on {}", cfg.bind_addr);

    rpc::serve(listener, engine_handle, shutdown_signal()).await?;
    drop(store);
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C, shutting down"),
        Err(e) => log::warn!("failed to listen for shutdown signal: {}", e),
    }
}
