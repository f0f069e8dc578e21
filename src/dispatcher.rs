//! Command Dispatcher
//!
//! Turns actions from the web interface into ECU commands or session
//! controls. Commands are queued for the session; controls are applied
//! straight away so a pause never waits behind a queued command.

use crate::mems::{Command, CommandResult};
use crate::publisher::Publisher;
use crate::session::{SessionHandle, SessionRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Every action the web interface can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ReadConfig,
    Connect,
    RequestDataFrame,
    Pause,
    Resume,
    ResetEcu,
    ClearFaults,
    ResetAdjustments,
    IncreaseIdleSpeed,
    DecreaseIdleSpeed,
    IncreaseIdleHot,
    DecreaseIdleHot,
    IncreaseFuelTrim,
    DecreaseFuelTrim,
    IncreaseIgnitionAdvance,
    DecreaseIgnitionAdvance,
}

impl ActionKind {
    pub const ALL: [ActionKind; 16] = [
        ActionKind::ReadConfig,
        ActionKind::Connect,
        ActionKind::RequestDataFrame,
        ActionKind::Pause,
        ActionKind::Resume,
        ActionKind::ResetEcu,
        ActionKind::ClearFaults,
        ActionKind::ResetAdjustments,
        ActionKind::IncreaseIdleSpeed,
        ActionKind::DecreaseIdleSpeed,
        ActionKind::IncreaseIdleHot,
        ActionKind::DecreaseIdleHot,
        ActionKind::IncreaseFuelTrim,
        ActionKind::DecreaseFuelTrim,
        ActionKind::IncreaseIgnitionAdvance,
        ActionKind::DecreaseIgnitionAdvance,
    ];

    /// Wire name of the action
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ReadConfig => "read-config",
            ActionKind::Connect => "connect",
            ActionKind::RequestDataFrame => "request-data-frame",
            ActionKind::Pause => "pause",
            ActionKind::Resume => "resume",
            ActionKind::ResetEcu => "reset-ecu",
            ActionKind::ClearFaults => "clear-faults",
            ActionKind::ResetAdjustments => "reset-adjustments",
            ActionKind::IncreaseIdleSpeed => "increase-idle-speed",
            ActionKind::DecreaseIdleSpeed => "decrease-idle-speed",
            ActionKind::IncreaseIdleHot => "increase-idle-hot",
            ActionKind::DecreaseIdleHot => "decrease-idle-hot",
            ActionKind::IncreaseFuelTrim => "increase-fuel-trim",
            ActionKind::DecreaseFuelTrim => "decrease-fuel-trim",
            ActionKind::IncreaseIgnitionAdvance => "increase-ignition-advance",
            ActionKind::DecreaseIgnitionAdvance => "decrease-ignition-advance",
        }
    }

    /// Session controls, as opposed to ECU commands
    pub fn is_control(self) -> bool {
        matches!(
            self,
            ActionKind::ReadConfig | ActionKind::Connect | ActionKind::Pause | ActionKind::Resume
        )
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// Inbound envelope: `{"action": "...", "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl UiAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: None,
        }
    }

    pub fn with_data(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data: Some(data),
        }
    }

    pub fn kind(&self) -> Option<ActionKind> {
        ActionKind::parse(&self.action)
    }

    /// Port named in a `connect` payload
    pub fn port(&self) -> Option<String> {
        self.data
            .as_ref()?
            .get("port")?
            .as_str()
            .filter(|port| !port.is_empty())
            .map(str::to_string)
    }
}

/// Non-ECU actions handled by the session controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Connect,
    ReadConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Command(Command),
    Control(ControlSignal),
}

/// Map an action to its command or control. Unknown actions map to nothing.
pub fn evaluate(action: &UiAction) -> Option<Dispatch> {
    let Some(kind) = action.kind() else {
        debug!("Ignoring unknown action '{}'", action.action);
        return None;
    };

    let dispatch = match kind {
        ActionKind::ReadConfig => Dispatch::Control(ControlSignal::ReadConfig),
        ActionKind::Connect => Dispatch::Control(ControlSignal::Connect),
        ActionKind::Pause => Dispatch::Control(ControlSignal::Pause),
        ActionKind::Resume => Dispatch::Control(ControlSignal::Resume),
        ActionKind::RequestDataFrame => Dispatch::Command(Command::ReadDataFrame),
        ActionKind::ResetEcu => Dispatch::Command(Command::ResetEcu),
        ActionKind::ClearFaults => Dispatch::Command(Command::ClearFaults),
        ActionKind::ResetAdjustments => Dispatch::Command(Command::ResetAdjustments),
        ActionKind::IncreaseIdleSpeed => Dispatch::Command(Command::IncreaseIdleSpeed),
        ActionKind::DecreaseIdleSpeed => Dispatch::Command(Command::DecreaseIdleSpeed),
        ActionKind::IncreaseIdleHot => Dispatch::Command(Command::IncreaseIdleDecay),
        ActionKind::DecreaseIdleHot => Dispatch::Command(Command::DecreaseIdleDecay),
        ActionKind::IncreaseFuelTrim => Dispatch::Command(Command::IncreaseFuelTrim),
        ActionKind::DecreaseFuelTrim => Dispatch::Command(Command::DecreaseFuelTrim),
        ActionKind::IncreaseIgnitionAdvance => Dispatch::Command(Command::IncreaseIgnitionAdvance),
        ActionKind::DecreaseIgnitionAdvance => Dispatch::Command(Command::DecreaseIgnitionAdvance),
    };

    debug!("Action '{}' -> {:?}", action.action, dispatch);
    Some(dispatch)
}

/// Applies evaluated actions to the running session
pub struct CommandDispatcher {
    session: SessionHandle,
    publisher: Publisher,
}

impl CommandDispatcher {
    pub fn new(session: SessionHandle, publisher: Publisher) -> Self {
        Self { session, publisher }
    }

    /// Command-intake listener: runs until the intake channel closes
    pub async fn run(self, mut intake: mpsc::Receiver<UiAction>) {
        while let Some(action) = intake.recv().await {
            self.apply(&action);
        }
        debug!("Command intake closed");
    }

    pub fn apply(&self, action: &UiAction) {
        match evaluate(action) {
            Some(Dispatch::Command(command)) => {
                info!("Queueing {}", command);
                match self.session.requests.try_send(SessionRequest::Command(command)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Command queue full, dropping {}", command);
                        self.publisher
                            .publish_result(CommandResult::failed(command, "command queue full"));
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.publisher
                            .publish_result(CommandResult::failed(command, "session stopped"));
                    }
                }
            }
            Some(Dispatch::Control(ControlSignal::Pause)) => {
                info!("Pausing data polling");
                self.session.control.pause();
            }
            Some(Dispatch::Control(ControlSignal::Resume)) => {
                info!("Resuming data polling");
                self.session.control.resume();
            }
            Some(Dispatch::Control(ControlSignal::Connect)) => {
                let request = SessionRequest::Connect { port: action.port() };
                if let Err(e) = self.session.requests.try_send(request) {
                    warn!("Connect request not queued: {}", e);
                }
            }
            Some(Dispatch::Control(ControlSignal::ReadConfig)) => {
                let config = self.session.config.borrow().clone();
                self.publisher.publish_config(&config);
            }
            None => {}
        }
    }
}
