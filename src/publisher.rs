//! Fan-out Publisher
//!
//! Hands results to the web interface and the data logger without ever
//! blocking the session. Frames and command results are dropped when a
//! consumer falls behind; connection status is always delivered.

use crate::config::Config;
use crate::dataframe::DataFrame;
use crate::mems::{CommandResult, EcuId};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Payload of the `connection-status` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub initialised: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecu_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn connected(ecu_id: EcuId) -> Self {
        Self {
            connected: true,
            initialised: true,
            ecu_id: Some(ecu_id.to_string()),
            error: None,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            initialised: false,
            ecu_id: None,
            error: None,
        }
    }

    /// Connection attempt failed
    pub fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::disconnected()
        }
    }

    /// An established link stopped answering
    pub fn lost(error: String) -> Self {
        Self::failed(error)
    }
}

/// Envelope sent to the web interface: `{"action": ..., "data": ...}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Config(Config),
    ConnectionStatus(ConnectionStatus),
    Data(DataFrame),
    EcuResponse(CommandResult),
}

#[derive(Clone)]
pub struct Publisher {
    ui: mpsc::Sender<OutboundMessage>,
    logger: Option<mpsc::Sender<DataFrame>>,
}

impl Publisher {
    pub fn new(ui: mpsc::Sender<OutboundMessage>, logger: Option<mpsc::Sender<DataFrame>>) -> Self {
        Self { ui, logger }
    }

    /// Send a frame to the UI and, when enabled, the data logger
    pub fn publish_frame(&self, frame: &DataFrame) {
        if let Some(logger) = &self.logger {
            match logger.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("Data logger behind, frame not logged"),
                Err(TrySendError::Closed(_)) => debug!("Data logger stopped"),
            }
        }
        self.deliver(OutboundMessage::Data(frame.clone()));
    }

    pub fn publish_result(&self, result: CommandResult) {
        self.deliver(OutboundMessage::EcuResponse(result));
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        self.deliver_always(OutboundMessage::ConnectionStatus(status));
    }

    pub fn publish_config(&self, config: &Config) {
        self.deliver_always(OutboundMessage::Config(config.clone()));
    }

    /// Best effort: dropped when the UI queue is full
    fn deliver(&self, message: OutboundMessage) {
        match self.ui.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!("UI queue full, dropping {}", message.kind());
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Never dropped; a full queue hands the message to a background send
    fn deliver_always(&self, message: OutboundMessage) {
        match self.ui.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!("UI queue full, deferring {}", message.kind());
                let ui = self.ui.clone();
                tokio::spawn(async move {
                    let _ = ui.send(message).await;
                });
            }
            Err(TrySendError::Closed(_)) => debug!("UI channel closed"),
        }
    }
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Config(_) => "config",
            OutboundMessage::ConnectionStatus(_) => "connection-status",
            OutboundMessage::Data(_) => "data",
            OutboundMessage::EcuResponse(_) => "ecu-response",
        }
    }
}
