use std::{
    process,
    sync::{atomic::AtomicUsize, Arc},
};

use cloudlink::{
    config::Config,
    core::{
        dispatcher::{LogSink, MessageDispatcher},
        link::LinkEventHandler,
        session::IotHubLibrary,
        signal::ConnectivitySignal,
        station::HostStation,
        worker::SessionWorker,
    },
    logger::LoggerManager,
    print_error,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting cloudlink version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.network);
    debug!("{:#?}", cfg.session);

    let descriptor = cfg.session.descriptor().unwrap_or_else(|e| {
        error!("Invalid connection string: {}", e);
        process::exit(1);
    });

    let signal = ConnectivitySignal::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let station = Arc::new(HostStation::new(
        cfg.network.ssid.clone(),
        cfg.network.passphrase.clone(),
        events_tx,
    ));
    let handler = LinkEventHandler::new(station.clone(), signal.clone());
    let link_task = tokio::spawn(handler.run(events_rx));

    if let Err(e) = station.start() {
        error!("Failed to start station: {}", e);
        process::exit(1);
    }

    let received = Arc::new(AtomicUsize::new(0));
    let dispatcher = MessageDispatcher::new(cfg.session.disposition_policy, Arc::new(LogSink))
        .with_counter(received.clone());
    info!("Disposition policy: {:?}", dispatcher.policy());

    let worker = SessionWorker::new(
        Arc::new(IotHubLibrary::new(cfg.session.session_options())),
        descriptor,
        cfg.session.transport,
        cfg.session.pump_interval(),
        signal,
        Arc::new(dispatcher),
    );
    let cancel = worker.cancel_token();
    let mut worker_task = tokio::spawn(worker.run());

    info!("Starting session worker...");

    tokio::select! {
        result = &mut worker_task => {
            match result {
                Ok(state) => warn!("Session worker finished: {}", state),
                Err(e) => error!("Session worker task failed: {}", e),
            }
            // No restart: stay up with the link handler until stopped.
            warn!("No active cloud session. Waiting for Ctrl+C...");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            cancel.cancel();
            if let Err(e) = worker_task.await {
                error!("Session worker task failed: {}", e);
            }
        }
    }

    link_task.abort();
    info!(
        "Shutdown complete ({} message(s) received)",
        received.load(std::sync::atomic::Ordering::Relaxed)
    );
}
