//! MEMS 1.6 Protocol Codec
//!
//! Translates commands into single-byte requests and decodes the replies.
//! Every request is answered by an echo of the opcode followed by a fixed
//! number of bytes, so the reply length is known before reading.

use crate::constants::{frames, opcodes};
use crate::dataframe::DataFrame;
use crate::error::{ConnectError, TransactionError};
use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

/// The fixed set of operations the ECU understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    ReadDataFrame,
    Heartbeat,
    ResetEcu,
    ClearFaults,
    ResetAdjustments,
    IncreaseIdleSpeed,
    DecreaseIdleSpeed,
    IncreaseIdleDecay,
    DecreaseIdleDecay,
    IncreaseFuelTrim,
    DecreaseFuelTrim,
    IncreaseIgnitionAdvance,
    DecreaseIgnitionAdvance,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::ReadDataFrame,
        Command::Heartbeat,
        Command::ResetEcu,
        Command::ClearFaults,
        Command::ResetAdjustments,
        Command::IncreaseIdleSpeed,
        Command::DecreaseIdleSpeed,
        Command::IncreaseIdleDecay,
        Command::DecreaseIdleDecay,
        Command::IncreaseFuelTrim,
        Command::DecreaseFuelTrim,
        Command::IncreaseIgnitionAdvance,
        Command::DecreaseIgnitionAdvance,
    ];

    /// First opcode sent for this command
    pub fn opcode(self) -> u8 {
        match self {
            Command::ReadDataFrame => opcodes::DATA_80,
            Command::Heartbeat => opcodes::HEARTBEAT,
            Command::ResetEcu => opcodes::RESET_ECU,
            Command::ClearFaults => opcodes::CLEAR_FAULTS,
            Command::ResetAdjustments => opcodes::RESET_ADJUSTMENTS,
            Command::IncreaseIdleSpeed => opcodes::IDLE_SPEED_INCREMENT,
            Command::DecreaseIdleSpeed => opcodes::IDLE_SPEED_DECREMENT,
            Command::IncreaseIdleDecay => opcodes::IDLE_DECAY_INCREMENT,
            Command::DecreaseIdleDecay => opcodes::IDLE_DECAY_DECREMENT,
            Command::IncreaseFuelTrim => opcodes::LTFT_INCREMENT,
            Command::DecreaseFuelTrim => opcodes::LTFT_DECREMENT,
            Command::IncreaseIgnitionAdvance => opcodes::IGNITION_ADVANCE_INCREMENT,
            Command::DecreaseIgnitionAdvance => opcodes::IGNITION_ADVANCE_DECREMENT,
        }
    }

    pub fn is_data_poll(self) -> bool {
        self == Command::ReadDataFrame
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::ReadDataFrame => "Read Data Frame",
            Command::Heartbeat => "Heartbeat",
            Command::ResetEcu => "Reset ECU",
            Command::ClearFaults => "Clear Faults",
            Command::ResetAdjustments => "Reset Adjustments",
            Command::IncreaseIdleSpeed => "Increase Idle Speed",
            Command::DecreaseIdleSpeed => "Decrease Idle Speed",
            Command::IncreaseIdleDecay => "Increase Idle Decay (Hot)",
            Command::DecreaseIdleDecay => "Decrease Idle Decay (Hot)",
            Command::IncreaseFuelTrim => "Increase Fuel Trim (LTFT)",
            Command::DecreaseFuelTrim => "Decrease Fuel Trim (LTFT)",
            Command::IncreaseIgnitionAdvance => "Increase Ignition Advance",
            Command::DecreaseIgnitionAdvance => "Decrease Ignition Advance",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a non-data command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: Command,
    pub opcode: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(command: Command, value: u8) -> Self {
        Self {
            command,
            opcode: format!("0x{:02X}", command.opcode()),
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(command: Command, error: impl fmt::Display) -> Self {
        Self {
            command,
            opcode: format!("0x{:02X}", command.opcode()),
            success: false,
            value: None,
            error: Some(error.to_string()),
        }
    }
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq)]
pub enum EcuResponse {
    Frame(DataFrame),
    Ack(CommandResult),
}

/// Identification bytes returned at the end of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuId(pub [u8; 4]);

impl fmt::Display for EcuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{:02X}{:02X}{:02X}{:02X}", a, b, c, d)
    }
}

/// A link to an ECU able to run the handshake and single exchanges.
///
/// Implementations block for at most their own read timeout.
pub trait EcuTransport: Send {
    /// Run the initialisation handshake
    fn initialise(&mut self) -> Result<EcuId, ConnectError>;

    /// Send one command and wait for its complete reply
    fn transact(&mut self, command: Command) -> Result<EcuResponse, TransactionError>;
}

/// MEMS 1.6 codec over any byte stream (serial port, emulator)
pub struct MemsCodec<S> {
    stream: S,
}

impl<S: Read + Write + Send> MemsCodec<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write one opcode and read a reply of `len` bytes
    fn exchange(&mut self, opcode: u8, len: usize) -> io::Result<Vec<u8>> {
        debug!("TX: {:02X}", opcode);
        self.stream.write_all(&[opcode])?;
        self.stream.flush()?;

        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply)?;
        debug!("RX: {:02X?}", reply);
        Ok(reply)
    }

    /// One handshake step: the reply must start with `expected`
    fn handshake_step(&mut self, opcode: u8, expected: &[u8], len: usize) -> Result<Vec<u8>, ConnectError> {
        let reply = self.exchange(opcode, len).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
                ConnectError::HandshakeTimeout { step: opcode }
            }
            _ => ConnectError::PortUnavailable {
                port: String::new(),
                reason: e.to_string(),
            },
        })?;

        if !reply.starts_with(expected) {
            warn!("Handshake step 0x{:02X}: unexpected reply {:02X?}", opcode, reply);
            return Err(ConnectError::HandshakeRejected {
                sent: opcode,
                received: reply,
            });
        }
        Ok(reply)
    }

    fn read_data_frame(&mut self) -> Result<DataFrame, TransactionError> {
        let d80 = self
            .exchange(opcodes::DATA_80, frames::DATA_80_LEN)
            .map_err(|e| TransactionError::from_io(opcodes::DATA_80, e))?;
        let d7d = self
            .exchange(opcodes::DATA_7D, frames::DATA_7D_LEN)
            .map_err(|e| TransactionError::from_io(opcodes::DATA_7D, e))?;
        DataFrame::decode(&d80, &d7d)
    }
}

impl<S: Read + Write + Send> EcuTransport for MemsCodec<S> {
    fn initialise(&mut self) -> Result<EcuId, ConnectError> {
        info!("Initialising ECU...");

        self.handshake_step(opcodes::INIT_A, &[opcodes::INIT_A], 1)?;
        self.handshake_step(opcodes::INIT_B, &[opcodes::INIT_B], 1)?;
        self.handshake_step(opcodes::HEARTBEAT, &[opcodes::HEARTBEAT], frames::ACK_LEN)?;
        let id = self.handshake_step(opcodes::ECU_ID, &[opcodes::ECU_ID], frames::ECU_ID_LEN)?;

        let ecu_id = EcuId([id[1], id[2], id[3], id[4]]);
        info!("ECU initialised, id {}", ecu_id);
        Ok(ecu_id)
    }

    fn transact(&mut self, command: Command) -> Result<EcuResponse, TransactionError> {
        if command.is_data_poll() {
            return self.read_data_frame().map(EcuResponse::Frame);
        }

        let opcode = command.opcode();
        let reply = self
            .exchange(opcode, frames::ACK_LEN)
            .map_err(|e| TransactionError::from_io(opcode, e))?;

        if reply[0] != opcode {
            if command == Command::Heartbeat {
                return Err(TransactionError::MalformedResponse {
                    opcode,
                    detail: format!("unexpected heartbeat reply {:02X?}", reply),
                });
            }
            return Err(TransactionError::CommandRejected { opcode, reply });
        }

        Ok(EcuResponse::Ack(CommandResult::ok(command, reply[1])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatedEcu;

    #[test]
    fn test_opcodes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for cmd in Command::ALL {
            assert!(seen.insert(cmd.opcode()), "duplicate opcode for {}", cmd);
        }
    }

    #[test]
    fn test_handshake_with_emulator() {
        let mut codec = MemsCodec::new(EmulatedEcu::new());
        let id = codec.initialise().unwrap();
        assert_eq!(id.to_string(), "99000203");
    }

    #[test]
    fn test_handshake_timeout_when_ecu_silent() {
        let mut codec = MemsCodec::new(EmulatedEcu::silent());
        let err = codec.initialise().unwrap_err();
        assert_eq!(err, ConnectError::HandshakeTimeout { step: opcodes::INIT_A });
    }

    #[test]
    fn test_read_data_frame() {
        let mut codec = MemsCodec::new(EmulatedEcu::new());
        codec.initialise().unwrap();

        match codec.transact(Command::ReadDataFrame).unwrap() {
            EcuResponse::Frame(frame) => {
                assert!(frame.engine_rpm > 0);
                assert_eq!(frame.dataframe_80.len(), frames::DATA_80_LEN * 2);
                assert_eq!(frame.dataframe_7d.len(), frames::DATA_7D_LEN * 2);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_clear_faults_ack() {
        let mut codec = MemsCodec::new(EmulatedEcu::new());
        codec.initialise().unwrap();

        let response = codec.transact(Command::ClearFaults).unwrap();
        assert_eq!(response, EcuResponse::Ack(CommandResult::ok(Command::ClearFaults, 0x00)));
    }

    #[test]
    fn test_adjustment_returns_new_value() {
        let mut codec = MemsCodec::new(EmulatedEcu::new());
        codec.initialise().unwrap();

        let first = codec.transact(Command::IncreaseIdleSpeed).unwrap();
        let second = codec.transact(Command::IncreaseIdleSpeed).unwrap();
        match (first, second) {
            (EcuResponse::Ack(a), EcuResponse::Ack(b)) => {
                assert_eq!(b.value.unwrap(), a.value.unwrap() + 1);
            }
            other => panic!("expected acks, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_command() {
        let mut ecu = EmulatedEcu::new();
        ecu.reject(opcodes::RESET_ECU);
        let mut codec = MemsCodec::new(ecu);
        codec.initialise().unwrap();

        let err = codec.transact(Command::ResetEcu).unwrap_err();
        assert!(matches!(err, TransactionError::CommandRejected { opcode: 0xFA, .. }));
        assert!(!err.is_fatal());

        // Link stays usable after a rejection
        assert!(codec.transact(Command::Heartbeat).is_ok());
    }

    #[test]
    fn test_timeout_after_ecu_goes_quiet() {
        let mut ecu = EmulatedEcu::new();
        ecu.go_silent_after(4);
        let mut codec = MemsCodec::new(ecu);
        codec.initialise().unwrap();

        let err = codec.transact(Command::Heartbeat).unwrap_err();
        assert_eq!(err, TransactionError::Timeout { opcode: opcodes::HEARTBEAT });
    }
}
