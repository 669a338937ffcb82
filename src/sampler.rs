//! ==============================================================================
//! sampler.rs - point-in-time telemetry observations
//! ==============================================================================
//!
//! purpose:
//!     answers two questions about the machine the gateway runs on:
//!     - which ip addresses do the local interfaces have right now?
//!     - how hot is the cpu right now?
//!
//!     nothing here keeps state between calls. diffing and aggregation live
//!     in scheduler.rs.
//!
//! design:
//!     TelemetrySource is the seam. SystemSource talks to the os (getifaddrs,
//!     sysfs thermal zone, sysinfo components), tests plug in scripted sources.
//!
//! relationships:
//!     - used by: scheduler.rs
//!     - uses: nix (getifaddrs), sysinfo (component temperatures)
//!
//! ==============================================================================

use crate::error::SensorError;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

pub const DEFAULT_THERMAL_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// interface key -> address text
pub type IpMap = BTreeMap<String, String>;

/// how an interface + address family becomes a reading key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKeying {
    /// first letter of the interface name + family ("e4", "w6").
    /// interfaces sharing a first letter collide, the last one enumerated wins.
    #[default]
    Legacy,
    /// whole interface name + family ("eth04", "wlan06")
    FullName,
}

pub trait TelemetrySource: Send + Sync {
    fn network_snapshot(&self) -> IpMap;
    fn cpu_temperature(&self) -> Result<f64, SensorError>;
}

/// reading key for one interface address, None for an unnamed interface
pub fn interface_key(name: &str, addr: &IpAddr, keying: InterfaceKeying) -> Option<String> {
    let family = if addr.is_ipv4() { '4' } else { '6' };
    match keying {
        InterfaceKeying::Legacy => name.chars().next().map(|c| format!("{}{}", c, family)),
        InterfaceKeying::FullName if name.is_empty() => None,
        InterfaceKeying::FullName => Some(format!("{}{}", name, family)),
    }
}

/// fold enumerated (interface, address) pairs into a snapshot, in order
pub fn build_ip_map<I>(entries: I, keying: InterfaceKeying) -> IpMap
where
    I: IntoIterator<Item = (String, IpAddr)>,
{
    let mut map = IpMap::new();
    for (name, addr) in entries {
        if let Some(key) = interface_key(&name, &addr, keying) {
            map.insert(key, addr.to_string());
        }
    }
    map
}

/// parse the thermal zone contents (integer millidegrees celsius)
pub fn parse_millidegrees(contents: &str) -> Result<f64, SensorError> {
    let trimmed = contents.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .map(|t| t / 1000.0)
        .ok_or_else(|| SensorError::Unparseable(trimmed.to_string()))
}

// ==============================================================================
// real os source
// ==============================================================================

pub struct SystemSource {
    thermal_path: PathBuf,
    keying: InterfaceKeying,
    component_fallback: bool,
}

impl SystemSource {
    pub fn new(
        thermal_path: impl Into<PathBuf>,
        keying: InterfaceKeying,
        component_fallback: bool,
    ) -> Self {
        tracing::info!("Using system telemetry source");
        Self { thermal_path: thermal_path.into(), keying, component_fallback }
    }
}

impl TelemetrySource for SystemSource {
    fn network_snapshot(&self) -> IpMap {
        build_ip_map(enumerate_interfaces(), self.keying)
    }

    fn cpu_temperature(&self) -> Result<f64, SensorError> {
        match std::fs::read_to_string(&self.thermal_path) {
            Ok(contents) => parse_millidegrees(&contents),
            Err(e) => {
                tracing::debug!(
                    "Unable to open temperature file {}: {}",
                    self.thermal_path.display(),
                    e
                );
                if self.component_fallback {
                    hottest_cpu_component().ok_or(SensorError::Unavailable)
                } else {
                    Err(SensorError::Unavailable)
                }
            }
        }
    }
}

/// ipv4 and ipv6 addresses of every interface, in getifaddrs order
fn enumerate_interfaces() -> Vec<(String, IpAddr)> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("Couldn't enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter_map(|ifa| {
            let address = ifa.address?;
            let ip = if let Some(sin) = address.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*sin).ip())
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
            } else {
                return None;
            };
            Some((ifa.interface_name, ip))
        })
        .collect()
}

/// highest temperature among hardware components that look like the cpu
fn hottest_cpu_component() -> Option<f64> {
    const CPU_LABELS: [&str; 5] = ["cpu", "package", "core", "tctl", "soc"];

    let components = sysinfo::Components::new_with_refreshed_list();
    components
        .list()
        .iter()
        .filter(|c| {
            let label = c.label().to_lowercase();
            CPU_LABELS.iter().any(|needle| label.contains(needle))
        })
        .map(|c| c.temperature() as f64)
        .filter(|t| t.is_finite())
        .fold(None, |hottest: Option<f64>, t| Some(hottest.map_or(t, |h| h.max(t))))
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_legacy_keys() {
        let key = interface_key("eth0", &v4(10, 0, 0, 2), InterfaceKeying::Legacy);
        assert_eq!(key.as_deref(), Some("e4"));
        let loopback = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let key = interface_key("wlan0", &loopback, InterfaceKeying::Legacy);
        assert_eq!(key.as_deref(), Some("w6"));
        assert_eq!(interface_key("", &v4(1, 1, 1, 1), InterfaceKeying::Legacy), None);
    }

    #[test]
    fn test_legacy_collision_last_wins() {
        let entries = vec![
            ("eth0".to_string(), v4(10, 0, 0, 2)),
            ("enp3s0".to_string(), v4(192, 168, 1, 20)),
            ("lo".to_string(), v4(127, 0, 0, 1)),
        ];
        let map = build_ip_map(entries, InterfaceKeying::Legacy);
        assert_eq!(map.len(), 2);
        assert_eq!(map["e4"], "192.168.1.20");
        assert_eq!(map["l4"], "127.0.0.1");
    }

    #[test]
    fn test_full_name_keys_do_not_collide() {
        let entries = vec![
            ("eth0".to_string(), v4(10, 0, 0, 2)),
            ("enp3s0".to_string(), v4(192, 168, 1, 20)),
        ];
        let map = build_ip_map(entries, InterfaceKeying::FullName);
        assert_eq!(map["eth04"], "10.0.0.2");
        assert_eq!(map["enp3s04"], "192.168.1.20");
    }

    #[test]
    fn test_parse_millidegrees() {
        assert_eq!(parse_millidegrees("45000\n").unwrap(), 45.0);
        assert_eq!(parse_millidegrees("0").unwrap(), 0.0);
        assert!(matches!(parse_millidegrees("hot"), Err(SensorError::Unparseable(_))));
    }

    #[test]
    fn test_thermal_file_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "52312\n").unwrap();

        let source = SystemSource::new(&path, InterfaceKeying::Legacy, false);
        assert!((source.cpu_temperature().unwrap() - 52.312).abs() < 1e-9);
    }

    #[test]
    fn test_missing_sensor_is_unavailable_not_zero() {
        let dir = tempfile::tempdir().unwrap();
        let source = SystemSource::new(dir.path().join("absent"), InterfaceKeying::Legacy, false);
        assert!(matches!(source.cpu_temperature(), Err(SensorError::Unavailable)));
    }
}
