//! MEMS 1.6 live data frame
//!
//! A data frame is assembled from the replies to the `0x80` and `0x7D`
//! requests. Values are converted to engineering units here so consumers
//! (web interface, CSV logger) never deal with raw offsets.

use crate::constants::{frames, opcodes};
use crate::error::TransactionError;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Decoded snapshot of the ECU sensor and actuator state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataFrame {
    pub time: DateTime<Local>,

    // 0x80 frame
    pub engine_rpm: u16,
    pub coolant_temp: i16,
    pub ambient_temp: i16,
    pub intake_air_temp: i16,
    pub fuel_temp: i16,
    pub map_kpa: u8,
    pub battery_voltage: f32,
    pub throttle_pot_voltage: f32,
    pub idle_switch: bool,
    pub aircon_switch: bool,
    pub park_neutral_switch: bool,
    pub dtc0: u8,
    pub dtc1: u8,
    pub idle_set_point: u8,
    pub idle_hot: u8,
    pub iac_position: u8,
    pub idle_speed_deviation: u16,
    pub ignition_advance_offset_80: u8,
    pub ignition_advance: f32,
    pub coil_time_ms: f32,
    pub crankshaft_position_sensor: u8,

    // 0x7D frame
    pub ignition_switch: bool,
    pub throttle_angle: f32,
    pub air_fuel_ratio: f32,
    pub dtc2: u8,
    pub lambda_voltage_mv: u16,
    pub lambda_frequency: u8,
    pub lambda_duty_cycle: u8,
    pub lambda_status: u8,
    pub closed_loop: bool,
    pub long_term_fuel_trim: u8,
    pub short_term_fuel_trim: u8,
    pub carbon_canister_purge_valve: u8,
    pub dtc3: u8,
    pub idle_base_position: u8,
    pub dtc4: u8,
    pub ignition_advance_offset_7d: u8,
    pub idle_speed_offset: u8,

    // Fault flags derived from dtc0/dtc1
    pub coolant_temp_sensor_fault: bool,
    pub air_intake_temp_sensor_fault: bool,
    pub fuel_pump_circuit_fault: bool,
    pub throttle_pot_circuit_fault: bool,

    /// Raw replies as hex, kept for offline analysis
    pub dataframe_80: String,
    pub dataframe_7d: String,
}

/// Temperatures are sent with a +55 offset
fn temperature(raw: u8) -> i16 {
    raw as i16 - 55
}

fn word(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn check_frame(raw: &[u8], opcode: u8, len: usize) -> Result<(), TransactionError> {
    if raw.len() != len {
        return Err(TransactionError::MalformedResponse {
            opcode,
            detail: format!("expected {} bytes, got {}", len, raw.len()),
        });
    }
    if raw[0] != opcode {
        return Err(TransactionError::MalformedResponse {
            opcode,
            detail: format!("echo mismatch 0x{:02X}", raw[0]),
        });
    }
    Ok(())
}

impl DataFrame {
    /// Decode the two raw replies (echo byte included) into a frame
    pub fn decode(d80: &[u8], d7d: &[u8]) -> Result<Self, TransactionError> {
        check_frame(d80, opcodes::DATA_80, frames::DATA_80_LEN)?;
        check_frame(d7d, opcodes::DATA_7D, frames::DATA_7D_LEN)?;

        let dtc0 = d80[14];
        let dtc1 = d80[15];

        Ok(Self {
            time: Local::now(),

            engine_rpm: word(d80[2], d80[3]),
            coolant_temp: temperature(d80[4]),
            ambient_temp: temperature(d80[5]),
            intake_air_temp: temperature(d80[6]),
            fuel_temp: temperature(d80[7]),
            map_kpa: d80[8],
            battery_voltage: d80[9] as f32 / 10.0,
            throttle_pot_voltage: d80[10] as f32 * 0.02,
            idle_switch: d80[11] & 0x10 != 0,
            aircon_switch: d80[12] != 0,
            park_neutral_switch: d80[13] != 0,
            dtc0,
            dtc1,
            idle_set_point: d80[16],
            idle_hot: d80[17],
            iac_position: d80[19],
            idle_speed_deviation: word(d80[20], d80[21]),
            ignition_advance_offset_80: d80[22],
            ignition_advance: d80[23] as f32 / 2.0 - 24.0,
            coil_time_ms: word(d80[24], d80[25]) as f32 * 0.002,
            crankshaft_position_sensor: d80[26],

            ignition_switch: d7d[2] != 0,
            throttle_angle: d7d[3] as f32 * 0.6,
            air_fuel_ratio: d7d[5] as f32 / 10.0,
            dtc2: d7d[6],
            lambda_voltage_mv: d7d[7] as u16 * 5,
            lambda_frequency: d7d[8],
            lambda_duty_cycle: d7d[9],
            lambda_status: d7d[10],
            closed_loop: d7d[11] != 0,
            long_term_fuel_trim: d7d[12],
            short_term_fuel_trim: d7d[13],
            carbon_canister_purge_valve: d7d[14],
            dtc3: d7d[15],
            idle_base_position: d7d[16],
            dtc4: d7d[18],
            ignition_advance_offset_7d: d7d[19],
            idle_speed_offset: d7d[20],

            coolant_temp_sensor_fault: dtc0 & 0x01 != 0,
            air_intake_temp_sensor_fault: dtc0 & 0x02 != 0,
            fuel_pump_circuit_fault: dtc1 & 0x02 != 0,
            throttle_pot_circuit_fault: dtc1 & 0x80 != 0,

            dataframe_80: to_hex(d80),
            dataframe_7d: to_hex(d7d),
        })
    }

    /// Column names for the CSV log, in `csv_row` order
    pub fn csv_header() -> &'static str {
        "time,engine_rpm,coolant_temp,ambient_temp,intake_air_temp,fuel_temp,map_kpa,\
battery_voltage,throttle_pot_voltage,idle_switch,aircon_switch,park_neutral_switch,\
dtc0,dtc1,idle_set_point,idle_hot,iac_position,idle_speed_deviation,\
ignition_advance_offset_80,ignition_advance,coil_time_ms,crankshaft_position_sensor,\
ignition_switch,throttle_angle,air_fuel_ratio,dtc2,lambda_voltage_mv,lambda_frequency,\
lambda_duty_cycle,lambda_status,closed_loop,long_term_fuel_trim,short_term_fuel_trim,\
carbon_canister_purge_valve,dtc3,idle_base_position,dtc4,ignition_advance_offset_7d,\
idle_speed_offset,coolant_temp_sensor_fault,air_intake_temp_sensor_fault,\
fuel_pump_circuit_fault,throttle_pot_circuit_fault,dataframe_80,dataframe_7d"
    }

    /// One CSV line (no trailing newline)
    pub fn csv_row(&self) -> String {
        let fields: Vec<String> = vec![
            self.time.format("%H:%M:%S%.3f").to_string(),
            self.engine_rpm.to_string(),
            self.coolant_temp.to_string(),
            self.ambient_temp.to_string(),
            self.intake_air_temp.to_string(),
            self.fuel_temp.to_string(),
            self.map_kpa.to_string(),
            format!("{:.1}", self.battery_voltage),
            format!("{:.2}", self.throttle_pot_voltage),
            self.idle_switch.to_string(),
            self.aircon_switch.to_string(),
            self.park_neutral_switch.to_string(),
            self.dtc0.to_string(),
            self.dtc1.to_string(),
            self.idle_set_point.to_string(),
            self.idle_hot.to_string(),
            self.iac_position.to_string(),
            self.idle_speed_deviation.to_string(),
            self.ignition_advance_offset_80.to_string(),
            format!("{:.1}", self.ignition_advance),
            format!("{:.3}", self.coil_time_ms),
            self.crankshaft_position_sensor.to_string(),
            self.ignition_switch.to_string(),
            format!("{:.1}", self.throttle_angle),
            format!("{:.1}", self.air_fuel_ratio),
            self.dtc2.to_string(),
            self.lambda_voltage_mv.to_string(),
            self.lambda_frequency.to_string(),
            self.lambda_duty_cycle.to_string(),
            self.lambda_status.to_string(),
            self.closed_loop.to_string(),
            self.long_term_fuel_trim.to_string(),
            self.short_term_fuel_trim.to_string(),
            self.carbon_canister_purge_valve.to_string(),
            self.dtc3.to_string(),
            self.idle_base_position.to_string(),
            self.dtc4.to_string(),
            self.ignition_advance_offset_7d.to_string(),
            self.idle_speed_offset.to_string(),
            self.coolant_temp_sensor_fault.to_string(),
            self.air_intake_temp_sensor_fault.to_string(),
            self.fuel_pump_circuit_fault.to_string(),
            self.throttle_pot_circuit_fault.to_string(),
            self.dataframe_80.clone(),
            self.dataframe_7d.clone(),
        ];
        fields.join(",")
    }
}
