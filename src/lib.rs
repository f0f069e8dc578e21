//! MemsFCR - Rover MEMS 1.6 fault code reader and data logger
//!
//! Polls a MEMS 1.6 ECU over a serial link, streams live data and command
//! results to a web interface over a websocket and logs frames to CSV.

pub mod config;
pub mod connection;
pub mod constants;
pub mod dataframe;
pub mod datalog;
pub mod dispatcher;
pub mod emulator;
pub mod error;
pub mod mems;
pub mod publisher;
pub mod serial;
pub mod session;
pub mod websocket;

mod integration_tests;

use anyhow::Result;
use config::Config;
use constants::limits;
use datalog::DataLogger;
use dispatcher::CommandDispatcher;
use publisher::Publisher;
use serial::SerialConnector;
use session::{Session, SessionOutcome, SessionRequest};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use websocket::Bridge;

/// Start every task and run until the session ends or Ctrl-C
pub async fn run(config: Config) -> Result<SessionOutcome> {
    let (ui_tx, ui_rx) = mpsc::channel(limits::UI_QUEUE_DEPTH);

    let (log_tx, logger_task) = if config.logging {
        let logger = DataLogger::create(&config)?;
        let (tx, rx) = mpsc::channel(limits::LOG_QUEUE_DEPTH);
        (Some(tx), Some(datalog::spawn(logger, rx)))
    } else {
        (None, None)
    };

    let publisher = Publisher::new(ui_tx, log_tx);
    let (session, handle) = Session::new(config.clone(), Arc::new(SerialConnector), publisher.clone());
    let requests = handle.requests.clone();

    let (intake_tx, intake_rx) = mpsc::channel(limits::COMMAND_QUEUE_DEPTH);
    let (outbound_tx, _) = broadcast::channel(limits::UI_QUEUE_DEPTH);
    let bridge = Bridge {
        intake: intake_tx,
        outbound: outbound_tx.clone(),
        config: handle.config.clone(),
    };

    let forwarder = tokio::spawn(websocket::forward_outbound(ui_rx, outbound_tx));
    let mut server = tokio::spawn(websocket::run_server(config.ws_port, bridge));
    let dispatcher = tokio::spawn(CommandDispatcher::new(handle, publisher).run(intake_rx));
    let mut session_task = tokio::spawn(session.run());

    let outcome = tokio::select! {
        outcome = &mut session_task => outcome?,
        result = &mut server => {
            if let Err(e) = result? {
                error!("WebSocket server failed: {}", e);
            }
            let _ = requests.send(SessionRequest::Shutdown).await;
            session_task.await?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            let _ = requests.send(SessionRequest::Shutdown).await;
            session_task.await?
        }
    };

    info!("Session ended: {:?}", outcome);

    // Drop the remaining publishers so the logger sees the end of the stream
    dispatcher.abort();
    server.abort();
    forwarder.abort();
    drop(requests);
    if let Some(task) = logger_task {
        task.await?;
    }

    Ok(outcome)
}
