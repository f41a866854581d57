pub mod catalog;
pub mod channels;
pub mod config;
pub mod datalog_writer;
pub mod derived;
pub mod error;
pub mod options;
pub mod planner;
pub mod prelude;
pub mod register;
pub mod scheduler;
pub mod solarman;
pub mod value;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::datalog_writer::DatalogWriter;
use crate::scheduler::Scheduler;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_logging(level: &str) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
}

/// Main application entry point
///
/// Starts one session per enabled inverter plus the datalog writer, then
/// runs until `shutdown_rx` fires or the `--time` limit passes.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let options = Options::new();

    // RUST_LOG wins over the config file
    let config = ConfigWrapper::new(options.config_file.clone()).map_err(|err| {
        let _ = init_logging("info");
        error!("Failed to load config {}: {:?}", options.config_file, err);
        err
    })?;
    if let Err(e) = init_logging(&config.loglevel()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    info!("solarman-bridge {} starting with config file {}", CARGO_PKG_VERSION, options.config_file);

    let catalog = Arc::new(catalog::load(config.catalog_file())?);
    catalog.validate()?;

    let channels = Channels::new();
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    if let Some(path) = config.datalog_file() {
        let writer = DatalogWriter::new(&path)?;
        let channels = channels.clone();
        let settings = config.derived();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = writer.start(channels, settings, shutdown).await {
                error!("Datalog writer failed: {}", e);
            }
        }));
    }

    let scheduler = Scheduler::new(config.clone(), channels.clone(), catalog);
    handles.extend(scheduler.start(shutdown.clone())?);

    let runtime = options.runtime.map(Duration::from_secs);
    tokio::select! {
        _ = shutdown_rx.recv() => info!("Shutdown signal received"),
        _ = async {
            match runtime {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        } => info!("Runtime limit reached"),
    }

    info!("Stopping all components...");
    shutdown.cancel();
    let _ = channels.from_inverter.send(ChannelData::Shutdown);

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Error waiting for task: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
