//! Connection Manager
//!
//! Owns the physical link: opening the endpoint, the initialisation
//! handshake, bounded single transactions and liveness. Blocking serial I/O
//! runs on the blocking pool so the async tasks never stall on the wire.

use crate::config::Config;
use crate::constants::opcodes;
use crate::error::{ConnectError, TransactionError};
use crate::mems::{Command, EcuId, EcuResponse, EcuTransport};
use crate::publisher::{ConnectionStatus, Publisher};
use crate::session::{SessionControl, SessionState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Opens a transport for the configured endpoint
pub trait Connector: Send + Sync {
    fn open(&self, config: &Config) -> Result<Box<dyn EcuTransport>, ConnectError>;
}

/// An initialised link to the ECU
pub struct EcuHandle {
    transport: Option<Box<dyn EcuTransport>>,
    port: String,
    ecu_id: EcuId,
    last_success: Instant,
}

impl EcuHandle {
    pub fn ecu_id(&self) -> EcuId {
        self.ecu_id
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    control: Arc<SessionControl>,
    publisher: Publisher,
    response_timeout: Duration,
    liveness_timeout: Duration,
    /// Blocking exchange given up on after a timeout; it still owns the port
    abandoned: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        control: Arc<SessionControl>,
        publisher: Publisher,
        config: &Config,
    ) -> Self {
        if config.liveness_timeout() < config.heartbeat_interval() + config.response_timeout() {
            warn!(
                "Liveness timeout {:?} is shorter than a heartbeat period plus its reply",
                config.liveness_timeout()
            );
        }

        Self {
            connector,
            control,
            publisher,
            response_timeout: config.response_timeout(),
            liveness_timeout: config.liveness_timeout(),
            abandoned: None,
        }
    }

    /// Keep track of a blocking task that outlived its timeout
    fn abandon<T: Send + 'static>(&mut self, task: JoinHandle<T>) {
        self.abandoned = Some(tokio::spawn(async move {
            let _ = task.await;
        }));
    }

    /// Wait for an abandoned exchange to release the port.
    ///
    /// Bounded by the serial read timeout of the stuck exchange.
    async fn settle(&mut self) {
        if let Some(task) = self.abandoned.take() {
            debug!("Waiting for the previous exchange to finish");
            let _ = task.await;
        }
    }

    /// Open the configured port and initialise the ECU.
    ///
    /// Moves the session through Connecting and Initialising; on success the
    /// state becomes Connected and a connection-status is published. A
    /// failed attempt leaves the session Disconnected and is also published.
    /// There is no retry here.
    pub async fn connect(&mut self, config: &Config) -> Result<EcuHandle, ConnectError> {
        info!("Connecting to ECU on '{}'...", config.port);
        self.control.set_state(SessionState::Connecting);
        self.settle().await;

        let connector = Arc::clone(&self.connector);
        let control = Arc::clone(&self.control);
        let task_config = config.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut transport = connector.open(&task_config)?;
            control.set_state(SessionState::Initialising);
            let ecu_id = transport.initialise()?;
            Ok::<_, ConnectError>((transport, ecu_id))
        });

        let result = match timeout(config.handshake_timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ConnectError::PortUnavailable {
                port: config.port.clone(),
                reason: join_error.to_string(),
            }),
            Err(_) => {
                self.abandon(task);
                Err(ConnectError::HandshakeTimeout {
                    step: opcodes::INIT_A,
                })
            }
        };

        match result {
            Ok((transport, ecu_id)) => {
                info!("Connected to ECU {} on {}", ecu_id, config.port);
                self.control.set_state(SessionState::Connected);
                self.publisher
                    .publish_status(ConnectionStatus::connected(ecu_id));
                Ok(EcuHandle {
                    transport: Some(transport),
                    port: config.port.clone(),
                    ecu_id,
                    last_success: Instant::now(),
                })
            }
            Err(e) => {
                let e = match e {
                    ConnectError::PortUnavailable { port, reason } if port.is_empty() => {
                        ConnectError::PortUnavailable {
                            port: config.port.clone(),
                            reason,
                        }
                    }
                    other => other,
                };
                error!("Connection failed: {}", e);
                self.control.set_state(SessionState::Disconnected);
                self.publisher
                    .publish_status(ConnectionStatus::failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Whether the last successful exchange is recent enough
    pub fn is_alive(&self, handle: &EcuHandle) -> bool {
        handle.is_open() && handle.last_success.elapsed() <= self.liveness_timeout
    }

    /// Release the transport. Safe to call more than once.
    pub fn close(&self, handle: &mut EcuHandle) {
        if handle.transport.take().is_some() {
            info!("Closed connection to {}", handle.port);
        }
    }

    /// Run one command/response exchange, bounded by the response timeout.
    ///
    /// On timeout the transport stays with the blocking task and is dropped
    /// when it returns; the handle is closed and the next `connect` waits
    /// for that task. A reply that arrives after the liveness window has
    /// run out does not revive the link.
    pub async fn transact(
        &mut self,
        handle: &mut EcuHandle,
        command: Command,
    ) -> Result<EcuResponse, TransactionError> {
        let mut transport = handle
            .transport
            .take()
            .ok_or_else(|| TransactionError::TransportIo("connection closed".to_string()))?;

        debug!("Sending {} to ECU", command);
        let mut task = tokio::task::spawn_blocking(move || {
            let result = transport.transact(command);
            (transport, result)
        });

        match timeout(self.response_timeout, &mut task).await {
            Ok(Ok((transport, result))) => {
                handle.transport = Some(transport);
                let expired = handle.last_success.elapsed() > self.liveness_timeout;
                match &result {
                    Ok(_) if expired => {
                        warn!("{} answered after the liveness window ran out", command);
                    }
                    Ok(_) => handle.last_success = Instant::now(),
                    // The ECU answered, so the link is alive
                    Err(e) if !e.is_fatal() => {
                        warn!("{} rejected: {}", command, e);
                        if !expired {
                            handle.last_success = Instant::now();
                        }
                    }
                    Err(_) => {}
                }
                result
            }
            Ok(Err(join_error)) => Err(TransactionError::TransportIo(join_error.to_string())),
            Err(_) => {
                warn!("No reply to {} within {:?}", command, self.response_timeout);
                self.abandon(task);
                Err(TransactionError::Timeout {
                    opcode: command.opcode(),
                })
            }
        }
    }
}
