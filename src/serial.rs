//! Serial port discovery and the hardware connector

use crate::config::Config;
use crate::connection::Connector;
use crate::constants::{serial, timing};
use crate::emulator::EmulatedEcu;
use crate::error::ConnectError;
use crate::mems::{EcuTransport, MemsCodec};
use serde::Serialize;
use serialport::{available_ports, SerialPort, SerialPortType};
use std::time::Duration;
use tracing::{info, warn};

/// Information about a serial port
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub is_ftdi: bool,
}

/// List all available serial ports
pub fn list_ports() -> Vec<PortInfo> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Error enumerating serial ports: {}", e);
            return Vec::new();
        }
    };

    if ports.is_empty() {
        warn!("Unable to find any serial ports");
    }

    ports
        .into_iter()
        .map(|p| {
            let (port_type, manufacturer, product, is_ftdi) = match &p.port_type {
                // FTDI VID is 0x0403
                SerialPortType::UsbPort(usb) => (
                    "USB".to_string(),
                    usb.manufacturer.clone(),
                    usb.product.clone(),
                    usb.vid == 0x0403,
                ),
                SerialPortType::PciPort => ("PCI".to_string(), None, None, false),
                SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, false),
                SerialPortType::Unknown => ("Unknown".to_string(), None, None, false),
            };

            info!("Found serial port {} ({})", p.port_name, port_type);

            PortInfo {
                name: p.port_name,
                port_type,
                manufacturer,
                product,
                is_ftdi,
            }
        })
        .collect()
}

/// Open a port configured for the MEMS diagnostic link (9600 8N1)
pub fn open_port(port_name: &str) -> Result<Box<dyn SerialPort>, ConnectError> {
    let port = serialport::new(port_name, serial::BAUD_RATE)
        .timeout(Duration::from_millis(timing::SERIAL_READ_TIMEOUT_MS))
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| ConnectError::PortUnavailable {
            port: port_name.to_string(),
            reason: e.to_string(),
        })?;

    // Stale bytes would shift every reply
    if let Err(e) = port.clear(serialport::ClearBuffer::All) {
        warn!("Failed to clear buffers on {}: {}", port_name, e);
    }

    info!("Opened {} at {} baud", port_name, serial::BAUD_RATE);
    Ok(port)
}

/// Opens real serial ports, or the emulated ECU for the `emulator` port
#[derive(Debug, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, config: &Config) -> Result<Box<dyn EcuTransport>, ConnectError> {
        if config.is_emulated() {
            info!("Using emulated ECU");
            return Ok(Box::new(MemsCodec::new(EmulatedEcu::new())));
        }

        if config.port.is_empty() {
            return Err(ConnectError::PortUnavailable {
                port: String::new(),
                reason: "no serial port configured".to_string(),
            });
        }

        let port = open_port(&config.port)?;
        Ok(Box::new(MemsCodec::new(port)))
    }
}
