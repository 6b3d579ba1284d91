//! SDR payload controller entry point: parses CLI flags, loads configuration,
//! wires the Record Store, Calibration Store, Telemetry Source, Analyzer
//! Registry, Mode Switcher, Mission Executor and MAVLink link together, and
//! runs until a termination signal tears the whole tree down through one
//! shared `CancellationToken`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sdr_server::analyzer::AnalyzerRegistry;
use sdr_server::calibration_store::CalibrationStore;
use sdr_server::config::Config;
use sdr_server::mavlink_link::{self, LinkContext};
use sdr_server::mission_executor::MissionExecutor;
use sdr_server::record_store::RecordStore;
use sdr_server::switcher_actor::Switcher;
use sdr_server::telemetry::TelemetrySource;

#[derive(Parser, Clone, Debug)]
#[command(name = "sdr-server", about = "SDR payload controller: MAVLink link, record store, calibration engine and mission executor")]
struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// MAVLink connection string, e.g. `udpin:0.0.0.0:14550` or `tcpout:127.0.0.1:5760`.
    #[arg(short, long, default_value = "udpin:0.0.0.0:14550")]
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    log::info!("sdr-server {} starting", sdr_server::VERSION);

    let config = Arc::new(Config::load(&cli.config)?);
    let record_store = RecordStore::open(&config.sdr_record_store_folder, config.file_cache_time_ms)?;
    let calibration = CalibrationStore::open(&config.calibration_folder)?;
    let telemetry = Arc::new(TelemetrySource::new(config.device_timeout_ms));
    let registry = Arc::new(AnalyzerRegistry::with_reference_analyzers());

    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(64);

    let switcher = Switcher::new(
        registry,
        config.clone(),
        calibration.clone(),
        record_store.clone(),
        telemetry.clone(),
        outbound_tx,
        shutdown.child_token(),
    );
    let mission = MissionExecutor::new(switcher.clone(), telemetry.clone(), shutdown.child_token());

    let link_ctx = LinkContext {
        switcher: switcher.clone(),
        mission: mission.clone(),
        calibration,
        record_store,
        telemetry,
        config,
    };

    let address = cli.address.clone();
    let link_shutdown = shutdown.clone();
    let link_task = tokio::spawn(async move {
        if let Err(e) = mavlink_link::run(&address, link_ctx, outbound_rx, link_shutdown).await {
            log::error!("mavlink link exited: {e}");
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("failed to listen for ctrl-c: {e}");
            }
            log::info!("shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }

    switcher.shutdown().await;
    shutdown.cancel();
    let _ = link_task.await;

    log::info!("sdr-server shut down cleanly");
    Ok(())
}
