use crate::models::{HardwareHint, SerialPort};
use log::{debug, warn};

/// Vendor ids of the USB-UART bridges found on ESP32 boards
/// (CP210x, CH34x, Espressif native USB, FTDI).
pub const ESP_BRIDGE_VIDS: [u16; 4] = [0x10C4, 0x1A86, 0x303A, 0x0403];
const ESPRESSIF_VID: u16 = 0x303A;

/// Where port names come from. The station asks again on every discovery.
pub trait PortSource: Send + Sync {
    fn scan(&self) -> Vec<String>;

    /// Explains an empty scan, if the bus can tell us anything.
    fn diagnose(&self) -> Option<HardwareHint> {
        None
    }
}

/// Ports reported by the operating system.
pub struct SystemPorts;

impl PortSource for SystemPorts {
    fn scan(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| p.port_name)
                .filter(|name| is_candidate(name))
                .collect(),
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    fn diagnose(&self) -> Option<HardwareHint> {
        diagnose_usb()
    }
}

/// A fixed set of ports, for scripted stations and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedPorts(pub Vec<String>);

impl PortSource for FixedPorts {
    fn scan(&self) -> Vec<String> {
        self.0.clone()
    }
}

#[cfg(target_os = "linux")]
fn is_candidate(name: &str) -> bool {
    name.starts_with("/dev/ttyUSB") || name.starts_with("/dev/ttyACM")
}

#[cfg(not(target_os = "linux"))]
fn is_candidate(_name: &str) -> bool {
    true
}

/// Fresh, sorted candidate list. An empty result just means nothing is
/// plugged in.
pub fn list_ports(source: &dyn PortSource) -> Vec<SerialPort> {
    let ports = order_ports(source.scan());
    debug!(
        "Found {} candidate port(s): {:?}",
        ports.len(),
        ports.iter().map(|p| p.path.as_str()).collect::<Vec<_>>()
    );
    ports
}

pub fn order_ports(mut names: Vec<String>) -> Vec<SerialPort> {
    names.sort();
    names.dedup();
    names
        .into_iter()
        .enumerate()
        .map(|(discovered_at, path)| SerialPort {
            path,
            discovered_at,
        })
        .collect()
}

/// Highest-sorting path, i.e. the most recently attached device.
pub fn default_port(ports: &[SerialPort]) -> Option<&SerialPort> {
    ports.last()
}

/// Operator override first, then the last port that worked, then the default.
/// Paths that are no longer enumerated are skipped.
pub fn select_port<'a>(
    ports: &'a [SerialPort],
    port_override: Option<&str>,
    last_used: Option<&str>,
) -> Option<&'a SerialPort> {
    let find = |wanted: Option<&str>| wanted.and_then(|w| ports.iter().find(|p| p.path == w));
    find(port_override)
        .or_else(|| find(last_used))
        .or_else(|| default_port(ports))
}

/// The port after `current` in sorted order, wrapping around.
pub fn next_port<'a>(ports: &'a [SerialPort], current: Option<&str>) -> Option<&'a SerialPort> {
    let first = ports.first()?;
    let Some(current) = current else {
        return Some(first);
    };
    Some(
        ports
            .iter()
            .find(|p| p.path.as_str() > current)
            .unwrap_or(first),
    )
}

/// Looks for an ESP32 bridge on the USB bus. Finding one when there is no
/// serial port means the driver is missing.
pub fn diagnose_usb() -> Option<HardwareHint> {
    let devices = match nusb::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            debug!("USB bus scan failed: {}", e);
            return None;
        }
    };
    for dev in devices {
        let vid = dev.vendor_id();
        if ESP_BRIDGE_VIDS.contains(&vid) {
            return Some(HardwareHint {
                vid_pid: format!("{:04X}:{:04X}", vid, dev.product_id()),
                product_name: dev.product_string().map(|s| s.to_string()),
                connection_type: connection_type(vid).to_string(),
            });
        }
    }
    None
}

pub fn connection_type(vid: u16) -> &'static str {
    if vid == ESPRESSIF_VID {
        "native_usb"
    } else {
        "uart_bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths(ports: &[SerialPort]) -> Vec<&str> {
        ports.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn listing_is_sorted_and_indexed() {
        let source = FixedPorts(vec![
            "/dev/ttyUSB1".into(),
            "/dev/ttyACM0".into(),
            "/dev/ttyUSB0".into(),
            "/dev/ttyUSB1".into(),
        ]);
        let ports = list_ports(&source);
        assert_eq!(
            paths(&ports),
            vec!["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyUSB1"]
        );
        assert_eq!(
            ports.iter().map(|p| p.discovered_at).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(list_ports(&source), ports);
    }

    #[test]
    fn no_hardware_is_an_empty_list() {
        let ports = list_ports(&FixedPorts::default());
        assert!(ports.is_empty());
        assert!(default_port(&ports).is_none());
        assert!(select_port(&ports, Some("/dev/ttyUSB0"), None).is_none());
    }

    #[test]
    fn selection_prefers_override_then_last_used() {
        let ports = order_ports(vec![
            "/dev/ttyUSB0".into(),
            "/dev/ttyUSB1".into(),
            "/dev/ttyUSB2".into(),
        ]);
        let pick = |o, l| select_port(&ports, o, l).map(|p| p.path.as_str());
        assert_eq!(pick(None, None), Some("/dev/ttyUSB2"));
        assert_eq!(pick(None, Some("/dev/ttyUSB0")), Some("/dev/ttyUSB0"));
        assert_eq!(
            pick(Some("/dev/ttyUSB1"), Some("/dev/ttyUSB0")),
            Some("/dev/ttyUSB1")
        );
        // Stale entries are re-validated against the live list.
        assert_eq!(pick(Some("/dev/ttyUSB9"), Some("/dev/ttyUSB8")), Some("/dev/ttyUSB2"));
    }

    #[test]
    fn cycling_wraps_around() {
        let ports = order_ports(vec!["/dev/ttyACM0".into(), "/dev/ttyUSB0".into()]);
        let next = |c| next_port(&ports, c).map(|p| p.path.as_str());
        assert_eq!(next(None), Some("/dev/ttyACM0"));
        assert_eq!(next(Some("/dev/ttyACM0")), Some("/dev/ttyUSB0"));
        assert_eq!(next(Some("/dev/ttyUSB0")), Some("/dev/ttyACM0"));
        // A port that vanished still advances to its sorted successor.
        assert_eq!(next(Some("/dev/ttyACM5")), Some("/dev/ttyUSB0"));
        assert_eq!(next_port(&[], Some("/dev/ttyUSB0")), None);
    }

    #[test]
    fn espressif_vid_is_native_usb() {
        assert_eq!(connection_type(0x303A), "native_usb");
        assert_eq!(connection_type(0x10C4), "uart_bridge");
    }
}
