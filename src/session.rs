//! Session Orchestrator
//!
//! Owns the ECU handle and runs the command/response cycle. Queued requests
//! from the web interface are served before the scheduled action; the
//! scheduled action is a data poll while running and a heartbeat while
//! paused. Only this task ever touches the transport, so at most one
//! command is on the wire at any time.

use crate::config::Config;
use crate::connection::{ConnectionManager, Connector, EcuHandle};
use crate::constants::limits;
use crate::error::TransactionError;
use crate::mems::{Command, CommandResult, EcuResponse};
use crate::publisher::{ConnectionStatus, Publisher};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Initialising = 2,
    Connected = 3,
    Paused = 4,
    Lost = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Initialising,
            3 => SessionState::Connected,
            4 => SessionState::Paused,
            5 => SessionState::Lost,
            _ => SessionState::Disconnected,
        }
    }

    /// ECU traffic is only allowed in these states
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Initialising => "initialising",
            SessionState::Connected => "connected",
            SessionState::Paused => "paused",
            SessionState::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// State shared between the orchestrator and the intake listener.
///
/// The orchestrator is the only writer of the state; the pause flag is
/// written by the listener and read at cycle boundaries.
#[derive(Debug)]
pub struct SessionControl {
    state: AtomicU8,
    paused: AtomicBool,
    wake: Notify,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Work queued for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Command(Command),
    /// (Re)connect, optionally to a different port
    Connect { port: Option<String> },
    Shutdown,
}

/// Why `Session::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The configured number of data frames was read
    Completed,
    Shutdown,
    /// Every request sender was dropped
    Closed,
}

/// Cloneable handle used to reach a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub requests: mpsc::Sender<SessionRequest>,
    pub control: Arc<SessionControl>,
    pub config: watch::Receiver<Config>,
}

enum CycleEnd {
    Completed,
    Shutdown,
    /// Link lost or closed; wait for a connect request
    Stopped,
}

pub struct Session {
    config: Config,
    config_tx: watch::Sender<Config>,
    manager: ConnectionManager,
    control: Arc<SessionControl>,
    publisher: Publisher,
    requests: mpsc::Receiver<SessionRequest>,
    intake_open: bool,
    handle: Option<EcuHandle>,
    iterations: u64,
    last_transaction: Option<Instant>,
}

impl Session {
    pub fn new(config: Config, connector: Arc<dyn Connector>, publisher: Publisher) -> (Self, SessionHandle) {
        let (request_tx, request_rx) = mpsc::channel(limits::COMMAND_QUEUE_DEPTH);
        let (config_tx, config_rx) = watch::channel(config.clone());
        let control = Arc::new(SessionControl::new());
        let manager = ConnectionManager::new(connector, Arc::clone(&control), publisher.clone(), &config);

        let session = Self {
            config,
            config_tx,
            manager,
            control: Arc::clone(&control),
            publisher,
            requests: request_rx,
            intake_open: true,
            handle: None,
            iterations: 0,
            last_transaction: None,
        };
        let handle = SessionHandle {
            requests: request_tx,
            control,
            config: config_rx,
        };
        (session, handle)
    }

    /// Run until shutdown, loop completion, or every sender is gone
    pub async fn run(mut self) -> SessionOutcome {
        if self.config.connect_on_start {
            self.connect(None).await;
        }

        loop {
            if self.is_connected() {
                match self.cycle().await {
                    CycleEnd::Completed => return SessionOutcome::Completed,
                    CycleEnd::Shutdown => return SessionOutcome::Shutdown,
                    CycleEnd::Stopped => {}
                }
            }

            match self.requests.recv().await {
                None => {
                    info!("Request channel closed, session ending");
                    return SessionOutcome::Closed;
                }
                Some(SessionRequest::Shutdown) => {
                    info!("Session shutdown requested");
                    return SessionOutcome::Shutdown;
                }
                Some(SessionRequest::Connect { port }) => {
                    self.connect(port).await;
                }
                Some(SessionRequest::Command(command)) => {
                    warn!("{} requested while {}", command, self.control.state());
                    self.publisher
                        .publish_result(CommandResult::failed(command, "not connected"));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(EcuHandle::is_open) && self.control.state().is_connected()
    }

    async fn connect(&mut self, port: Option<String>) {
        if let Some(port) = port {
            if port != self.config.port {
                info!("Switching port from '{}' to '{}'", self.config.port, port);
                self.config.port = port;
                self.config_tx.send_replace(self.config.clone());
            }
        }

        if let Some(mut handle) = self.handle.take() {
            self.manager.close(&mut handle);
        }

        self.iterations = 0;
        self.last_transaction = None;
        self.handle = self.manager.connect(&self.config).await.ok();
    }

    /// The command/response cycle while Connected or Paused
    async fn cycle(&mut self) -> CycleEnd {
        info!("Starting ECU cycle (loop: {})", self.config.loop_count);

        loop {
            // Queued requests take priority over the scheduled action
            loop {
                match self.requests.try_recv() {
                    Ok(request) => {
                        if let Some(end) = self.serve(request).await {
                            return end;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.intake_open = false;
                        break;
                    }
                }
            }

            let paused = self.control.is_paused();
            self.control.set_state(if paused {
                SessionState::Paused
            } else {
                SessionState::Connected
            });

            if let Some(handle) = self.handle.as_ref() {
                if !self.manager.is_alive(handle) {
                    return self.lose("no reply from ECU within the liveness timeout");
                }
            }

            let interval = if paused {
                self.config.heartbeat_interval()
            } else {
                self.config.data_interval()
            };
            let due = match self.last_transaction {
                Some(at) => at + interval,
                None => Instant::now(),
            };

            if Instant::now() < due {
                tokio::select! {
                    _ = sleep_until(due) => {}
                    request = self.requests.recv(), if self.intake_open => {
                        match request {
                            Some(request) => {
                                if let Some(end) = self.serve(request).await {
                                    return end;
                                }
                            }
                            None => self.intake_open = false,
                        }
                        continue;
                    }
                    _ = self.control.wake.notified() => continue,
                }
            }

            let end = if paused {
                self.heartbeat().await
            } else {
                self.poll().await
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    /// Scheduled data poll; the only place the loop counter advances
    async fn poll(&mut self) -> Option<CycleEnd> {
        match self.execute(Command::ReadDataFrame).await {
            Ok(EcuResponse::Frame(frame)) => {
                self.publisher.publish_frame(&frame);
                self.iterations += 1;
                if self.iterations >= self.config.loop_count.get() {
                    return Some(self.finish());
                }
                None
            }
            Ok(EcuResponse::Ack(result)) => {
                error!("Data poll answered with an acknowledgement: {:?}", result);
                Some(self.lose("malformed data frame"))
            }
            Err(e) => Some(self.lose(e)),
        }
    }

    async fn heartbeat(&mut self) -> Option<CycleEnd> {
        match self.execute(Command::Heartbeat).await {
            Ok(_) => {
                debug!("Heartbeat acknowledged");
                None
            }
            Err(e) => Some(self.lose(e)),
        }
    }

    /// Serve one queued request while connected
    async fn serve(&mut self, request: SessionRequest) -> Option<CycleEnd> {
        match request {
            SessionRequest::Shutdown => {
                info!("Session shutdown requested");
                self.close_session();
                Some(CycleEnd::Shutdown)
            }
            SessionRequest::Connect { port } => {
                let switching = port.as_ref().is_some_and(|p| *p != self.config.port);
                if !switching {
                    debug!("Already connected, re-sending status");
                    if let Some(handle) = self.handle.as_ref() {
                        self.publisher
                            .publish_status(ConnectionStatus::connected(handle.ecu_id()));
                    }
                    return None;
                }
                self.connect(port).await;
                if self.is_connected() {
                    None
                } else {
                    Some(CycleEnd::Stopped)
                }
            }
            SessionRequest::Command(command) => match self.execute(command).await {
                Ok(EcuResponse::Frame(frame)) => {
                    // On-demand frame, does not count towards the loop
                    self.publisher.publish_frame(&frame);
                    None
                }
                Ok(EcuResponse::Ack(result)) => {
                    info!("{} -> {:?}", command, result.value);
                    self.publisher.publish_result(result);
                    None
                }
                Err(e) if !e.is_fatal() => {
                    self.publisher.publish_result(CommandResult::failed(command, &e));
                    None
                }
                Err(e) => Some(self.lose(e)),
            },
        }
    }

    async fn execute(&mut self, command: Command) -> Result<EcuResponse, TransactionError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| TransactionError::TransportIo("not connected".to_string()))?;
        let result = self.manager.transact(handle, command).await;
        self.last_transaction = Some(Instant::now());
        result
    }

    /// Transaction failure: Lost, then Disconnected with one status message
    /// until a connect request arrives
    fn lose(&mut self, reason: impl fmt::Display) -> CycleEnd {
        error!("Lost connection to ECU: {}", reason);
        self.control.set_state(SessionState::Lost);
        if let Some(mut handle) = self.handle.take() {
            self.manager.close(&mut handle);
        }
        self.control.set_state(SessionState::Disconnected);
        self.publisher
            .publish_status(ConnectionStatus::lost(reason.to_string()));
        CycleEnd::Stopped
    }

    /// Loop count reached
    fn finish(&mut self) -> CycleEnd {
        info!("Read {} data frames, closing session", self.iterations);
        self.close_session();
        CycleEnd::Completed
    }

    fn close_session(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.manager.close(&mut handle);
        }
        self.control.set_state(SessionState::Disconnected);
        self.publisher
            .publish_status(ConnectionStatus::disconnected());
    }
}
