//! Error types for connection, transaction and configuration failures

use std::io;

/// Failure to bring up a session with the ECU
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The serial endpoint could not be opened
    #[error("Serial port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    /// The ECU did not answer the initialisation handshake in time
    #[error("ECU did not respond to initialisation (step 0x{step:02X})")]
    HandshakeTimeout { step: u8 },
    /// The ECU answered the handshake with something unexpected
    #[error("ECU rejected initialisation: sent 0x{sent:02X}, received {received:02X?}")]
    HandshakeRejected { sent: u8, received: Vec<u8> },
}

/// Failure of a single command/response exchange
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// No (complete) reply within the response timeout
    #[error("ECU did not respond to 0x{opcode:02X} (timeout)")]
    Timeout { opcode: u8 },
    /// The serial link itself failed
    #[error("Serial transport error: {0}")]
    TransportIo(String),
    /// A reply arrived but could not be understood
    #[error("Malformed response to 0x{opcode:02X}: {detail}")]
    MalformedResponse { opcode: u8, detail: String },
    /// The ECU answered but declined the operation
    #[error("ECU rejected command 0x{opcode:02X} (reply {reply:02X?})")]
    CommandRejected { opcode: u8, reply: Vec<u8> },
}

impl TransactionError {
    /// Whether this failure ends the session (everything except a rejection)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransactionError::CommandRejected { .. })
    }

    /// Map an I/O error raised while talking to `opcode`
    pub fn from_io(opcode: u8, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
                TransactionError::Timeout { opcode }
            }
            _ => TransactionError::TransportIo(err.to_string()),
        }
    }
}

/// Failure to load or parse the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid loop count '{0}': expected a number or 'inf'")]
    InvalidLoopCount(String),
    #[error("Invalid output '{0}': expected 'stdout' or 'file'")]
    InvalidOutput(String),
}
