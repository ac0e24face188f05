//! Device discovery
//!
//! Finds the serial port a Limonata board is attached to by matching USB
//! vendor/product IDs against a table of known Arduino-class boards.

use serialport::{SerialPortInfo, SerialPortType};

/// A located device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatch {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub port: String,
    /// Human-readable board kind
    pub device: String,
}

/// Resolves a port for the driver
pub trait Discovery: Send {
    /// Find a device whose port name contains `filter`. An empty filter matches any port.
    fn locate(&self, filter: &str) -> Option<DeviceMatch>;
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name
    pub name: String,
    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,
    /// USB product ID (if USB device)
    pub pid: Option<u16>,
    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Known boards: vendor ID, optional product ID, label.
/// Checked in order, so the catch-all entry must stay last.
const KNOWN_BOARDS: &[(Option<u16>, Option<u16>, &str)] = &[
    (Some(0x16D0), Some(0x0613), "Arduino Uno"),
    (Some(0x1A86), Some(0x7523), "NHduino"),
    (Some(0x2341), Some(0x8036), "Arduino Leonardo"),
    (Some(0x2A03), None, "Arduino.org device"),
    (None, None, "unknown device"),
];

/// Label for a USB device, or `None` for non-USB ports
pub fn identify(vid: Option<u16>, pid: Option<u16>) -> Option<&'static str> {
    let (vid, pid) = (vid?, pid?);
    KNOWN_BOARDS
        .iter()
        .find(|(known_vid, known_pid, _)| {
            known_vid.map_or(true, |v| v == vid) && known_pid.map_or(true, |p| p == pid)
        })
        .map(|(_, _, label)| *label)
}

/// Pick the first USB port whose name contains `filter`
pub fn find_device(ports: &[PortInfo], filter: &str) -> Option<DeviceMatch> {
    ports
        .iter()
        .filter(|p| p.name.contains(filter))
        .find_map(|p| {
            identify(p.vid, p.pid).map(|label| DeviceMatch {
                port: p.name.clone(),
                device: label.to_string(),
            })
        })
}

/// List all serial ports the OS reports
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// Discovery over the ports reported by the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbDiscovery;

impl Discovery for UsbDiscovery {
    fn locate(&self, filter: &str) -> Option<DeviceMatch> {
        let ports = list_ports();
        let found = find_device(&ports, filter);

        if found.is_none() {
            tracing::info!("--- Serial Ports ---");
            for port in &ports {
                tracing::info!(
                    "{} {} {}",
                    port.name,
                    port.product.as_deref().unwrap_or("n/a"),
                    match (port.vid, port.pid) {
                        (Some(vid), Some(pid)) => format!("USB VID:PID={:04X}:{:04X}", vid, pid),
                        _ => "n/a".to_string(),
                    }
                );
            }
        }

        found
    }
}
