//! Emulated MEMS 1.6 ECU
//!
//! Speaks the same byte-level protocol as a real ECU so the codec and the
//! session can run without hardware. Selected with `--port emulator`.

use crate::constants::{frames, opcodes};
use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use tracing::debug;

/// Neutral value of every adjustable trim
const TRIM_CENTRE: u8 = 0x80;

pub struct EmulatedEcu {
    pending: VecDeque<u8>,
    /// Requests still answered before the ECU falls silent
    answers_left: Option<usize>,
    rejected: HashSet<u8>,
    frames_sent: u32,
    dtc0: u8,
    dtc1: u8,
    idle_speed_offset: u8,
    idle_decay: u8,
    fuel_trim: u8,
    ignition_offset: u8,
}

impl Default for EmulatedEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedEcu {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            answers_left: None,
            rejected: HashSet::new(),
            frames_sent: 0,
            dtc0: 0,
            dtc1: 0,
            idle_speed_offset: TRIM_CENTRE,
            idle_decay: TRIM_CENTRE,
            fuel_trim: TRIM_CENTRE,
            ignition_offset: TRIM_CENTRE,
        }
    }

    /// An ECU that never answers (ignition off, wrong port)
    pub fn silent() -> Self {
        let mut ecu = Self::new();
        ecu.answers_left = Some(0);
        ecu
    }

    /// Answer `count` more requests, then stop responding
    pub fn go_silent_after(&mut self, count: usize) {
        self.answers_left = Some(count);
    }

    /// Reply to `opcode` with a non-acknowledgement
    pub fn reject(&mut self, opcode: u8) {
        self.rejected.insert(opcode);
    }

    /// Set the stored fault bytes (dtc0, dtc1)
    pub fn set_faults(&mut self, dtc0: u8, dtc1: u8) {
        self.dtc0 = dtc0;
        self.dtc1 = dtc1;
    }

    fn frame_80(&self) -> Vec<u8> {
        // Idle wanders a little so the stream looks alive
        let rpm = 850 + (self.frames_sent % 8) as u16 * 5;
        let mut d = vec![0u8; frames::DATA_80_LEN];
        d[0] = opcodes::DATA_80;
        d[1] = (frames::DATA_80_LEN - 1) as u8;
        d[2] = (rpm >> 8) as u8;
        d[3] = rpm as u8;
        d[4] = 0x8C; // coolant 85 C
        d[5] = 0xFF;
        d[6] = 0x50; // intake 25 C
        d[7] = 0xFF;
        d[8] = 0x23;
        d[9] = 0x8A;
        d[10] = 0x24;
        d[11] = 0x10;
        d[14] = self.dtc0;
        d[15] = self.dtc1;
        d[16] = 0x20;
        d[17] = self.idle_decay;
        d[19] = 0x32;
        d[22] = self.ignition_offset;
        d[23] = 0x44;
        d[24] = 0x04;
        d
    }

    fn frame_7d(&self) -> Vec<u8> {
        let mut d = vec![0u8; frames::DATA_7D_LEN];
        d[0] = opcodes::DATA_7D;
        d[1] = (frames::DATA_7D_LEN - 1) as u8;
        d[2] = 0x01;
        d[3] = 0x0A;
        d[5] = 0x93;
        d[7] = 0x5A;
        d[11] = 0x01;
        d[12] = self.fuel_trim;
        d[13] = 0x64;
        d[19] = self.ignition_offset;
        d[20] = self.idle_speed_offset;
        d
    }

    fn respond(&mut self, opcode: u8) -> Vec<u8> {
        if self.rejected.contains(&opcode) {
            return vec![0x00, 0x00];
        }

        match opcode {
            opcodes::INIT_A | opcodes::INIT_B => vec![opcode],
            opcodes::ECU_ID => vec![opcode, 0x99, 0x00, 0x02, 0x03],
            opcodes::DATA_80 => {
                self.frames_sent = self.frames_sent.wrapping_add(1);
                self.frame_80()
            }
            opcodes::DATA_7D => self.frame_7d(),
            opcodes::CLEAR_FAULTS => {
                self.dtc0 = 0;
                self.dtc1 = 0;
                vec![opcode, 0x00]
            }
            opcodes::RESET_ADJUSTMENTS => {
                self.idle_speed_offset = TRIM_CENTRE;
                self.idle_decay = TRIM_CENTRE;
                self.fuel_trim = TRIM_CENTRE;
                self.ignition_offset = TRIM_CENTRE;
                vec![opcode, 0x00]
            }
            opcodes::IDLE_SPEED_INCREMENT => vec![opcode, bump(&mut self.idle_speed_offset, 1)],
            opcodes::IDLE_SPEED_DECREMENT => vec![opcode, bump(&mut self.idle_speed_offset, -1)],
            opcodes::IDLE_DECAY_INCREMENT => vec![opcode, bump(&mut self.idle_decay, 1)],
            opcodes::IDLE_DECAY_DECREMENT => vec![opcode, bump(&mut self.idle_decay, -1)],
            opcodes::LTFT_INCREMENT => vec![opcode, bump(&mut self.fuel_trim, 1)],
            opcodes::LTFT_DECREMENT => vec![opcode, bump(&mut self.fuel_trim, -1)],
            opcodes::IGNITION_ADVANCE_INCREMENT => vec![opcode, bump(&mut self.ignition_offset, 1)],
            opcodes::IGNITION_ADVANCE_DECREMENT => vec![opcode, bump(&mut self.ignition_offset, -1)],
            // Heartbeat, reset and anything unknown: plain acknowledgement
            _ => vec![opcode, 0x00],
        }
    }
}

fn bump(value: &mut u8, step: i8) -> u8 {
    *value = value.saturating_add_signed(step);
    *value
}

impl Write for EmulatedEcu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &opcode in buf {
            match self.answers_left {
                Some(0) => {
                    debug!("Emulator: ignoring 0x{:02X}", opcode);
                    continue;
                }
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            let reply = self.respond(opcode);
            self.pending.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for EmulatedEcu {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
