//! Serial port access for the reader.
//!
//! Key design goals:
//! - **Async stream**: the port is opened with `tokio-serial` and split into
//!   buffered read and write halves for the link manager
//! - **Enumeration**: `list_ports()` wraps `serialport::available_ports()`,
//!   both for the `list-ports` subcommand and to help diagnose a wrong
//!   device path on the first failed open

use serde::Serialize;
use std::io;
use tokio::io::BufReader;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::link::{Connector, LinkReader, LinkWriter};

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// A serial port visible on this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl From<&serialport::SerialPortInfo> for PortInfo {
    fn from(p: &serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            name: p.port_name.clone(),
            port_type: "unknown",
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        match &p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.port_type = "usb";
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer.clone();
                info.product = usb.product.clone();
                info.serial_number = usb.serial_number.clone();
            }
            serialport::SerialPortType::BluetoothPort => info.port_type = "bluetooth",
            serialport::SerialPortType::PciPort => info.port_type = "pci",
            serialport::SerialPortType::Unknown => {}
        }
        info
    }
}

/// List available serial ports on this system.
pub fn list_ports() -> Result<Vec<PortInfo>, serialport::Error> {
    Ok(serialport::available_ports()?
        .iter()
        .map(PortInfo::from)
        .collect())
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens the configured serial device.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port_name: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)> {
        let stream = tokio_serial::new(&self.port_name, self.baud_rate)
            .open_native_async()
            .map_err(io::Error::from)?;
        info!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }

    fn on_first_failure(&self) {
        match list_ports() {
            Ok(ports) if ports.is_empty() => {
                warn!(port = %self.port_name, "No serial ports found on this system");
            }
            Ok(ports) => {
                let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
                warn!(port = %self.port_name, available = ?names, "Configured serial port not usable");
            }
            Err(e) => warn!(error = %e, "Failed to list serial ports"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
