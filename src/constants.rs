//! Centralized constants for MEMS 1.6 diagnostic communication
//!
//! This module contains the protocol opcodes, frame sizes and default timings
//! used throughout the application.

// ============================================================================
// SERIAL LINK
// ============================================================================

pub mod serial {
    /// MEMS 1.6 diagnostic link runs at 9600 baud, 8N1
    pub const BAUD_RATE: u32 = 9600;

    /// Port name that selects the built-in emulated ECU instead of hardware
    pub const EMULATOR_PORT: &str = "emulator";
}

// ============================================================================
// MEMS 1.6 OPCODES
// ============================================================================

pub mod opcodes {
    // Initialisation handshake
    pub const INIT_A: u8 = 0xCA;
    pub const INIT_B: u8 = 0x75;
    pub const ECU_ID: u8 = 0xD0;

    // Data
    pub const DATA_80: u8 = 0x80;
    pub const DATA_7D: u8 = 0x7D;

    // Keep-alive
    pub const HEARTBEAT: u8 = 0xF4;

    // Maintenance
    pub const RESET_ECU: u8 = 0xFA;
    pub const CLEAR_FAULTS: u8 = 0xCC;
    pub const RESET_ADJUSTMENTS: u8 = 0x0F;

    // Adjustments
    pub const LTFT_INCREMENT: u8 = 0x79;
    pub const LTFT_DECREMENT: u8 = 0x7A;
    pub const IDLE_DECAY_INCREMENT: u8 = 0x89;
    pub const IDLE_DECAY_DECREMENT: u8 = 0x8A;
    pub const IDLE_SPEED_INCREMENT: u8 = 0x91;
    pub const IDLE_SPEED_DECREMENT: u8 = 0x92;
    pub const IGNITION_ADVANCE_INCREMENT: u8 = 0x93;
    pub const IGNITION_ADVANCE_DECREMENT: u8 = 0x94;
}

// ============================================================================
// FRAME SIZES
// ============================================================================

pub mod frames {
    /// 0x80 reply: echo + 28 bytes (size byte included)
    pub const DATA_80_LEN: usize = 29;

    /// 0x7D reply: echo + 32 bytes (size byte included)
    pub const DATA_7D_LEN: usize = 33;

    /// Command acknowledgement: echo + one value byte
    pub const ACK_LEN: usize = 2;

    /// ECU id reply: echo + 4 id bytes
    pub const ECU_ID_LEN: usize = 5;
}

// ============================================================================
// TIMING (milliseconds)
// ============================================================================

pub mod timing {
    /// Pause between data frame requests
    pub const DATA_INTERVAL_MS: u64 = 500;

    /// Keep-alive interval while polling is paused
    pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

    /// Upper bound for one command/response exchange
    pub const RESPONSE_TIMEOUT_MS: u64 = 1000;

    /// Upper bound for the whole initialisation handshake
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

    /// Link is considered dead without a successful exchange for this long
    pub const LIVENESS_TIMEOUT_MS: u64 = 5000;

    /// Serial read timeout applied to the port itself. Two of these (one
    /// data poll) must fit inside `RESPONSE_TIMEOUT_MS`.
    pub const SERIAL_READ_TIMEOUT_MS: u64 = 400;
}

// ============================================================================
// LIMITS
// ============================================================================

pub mod limits {
    /// Loop count used for "inf"
    pub const INFINITE_LOOPS: u64 = u64::MAX;

    /// Queued ECU commands awaiting the orchestrator
    pub const COMMAND_QUEUE_DEPTH: usize = 16;

    /// Outbound UI messages awaiting the websocket bridge
    pub const UI_QUEUE_DEPTH: usize = 32;

    /// Frames awaiting the data logger
    pub const LOG_QUEUE_DEPTH: usize = 256;

    /// Maximum concurrent WebSocket connections
    pub const MAX_CONNECTIONS: usize = 5;

    /// Default WebSocket port
    pub const WS_PORT: u16 = 8081;
}
