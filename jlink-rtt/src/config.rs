//! Configuration of a J-Link session.
//!
//! All types in this module can be deserialized, so that tools can load them
//! from configuration files. Durations are given in milliseconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::WireProtocol;

/// How the host reaches the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    /// A probe attached over USB, selected by its enumeration index.
    Usb {
        #[serde(default)]
        index: u32,
    },
    /// A networked probe (or a J-Link remote server).
    Ip {
        host: String,
        #[serde(default = "Transport::default_ip_port")]
        port: u16,
    },
}

impl Transport {
    /// The port J-Link remote servers listen on by default.
    pub const DEFAULT_IP_PORT: u16 = 19020;

    /// The first probe on USB.
    pub fn usb() -> Self {
        Transport::Usb { index: 0 }
    }

    /// A networked probe on the default port.
    pub fn ip(host: impl Into<String>) -> Self {
        Transport::Ip {
            host: host.into(),
            port: Self::DEFAULT_IP_PORT,
        }
    }

    fn default_ip_port() -> u16 {
        Self::DEFAULT_IP_PORT
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::usb()
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb { index } => write!(f, "USB #{index}"),
            Transport::Ip { host, port } => write!(f, "IP {host}:{port}"),
        }
    }
}

/// The attempt budget of a polling loop.
///
/// The loop checks its condition at most `attempts` times and waits
/// `interval` between two consecutive checks. There is no wait after the
/// last check, so an exhausted budget has waited `attempts - 1` intervals
/// (see [`PollBudget::max_wait`]). These values encode timing
/// assumptions about the hardware handshake and may need tuning for slow
/// targets or remote probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollBudget {
    pub attempts: usize,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl PollBudget {
    /// Budget for the target to report a connection: 10 × 100 ms.
    pub const CONNECT: PollBudget = PollBudget {
        attempts: 10,
        interval: Duration::from_millis(100),
    };

    /// Budget for RTT to report the requested up-buffers: 100 × 10 ms.
    pub const RTT: PollBudget = PollBudget {
        attempts: 100,
        interval: Duration::from_millis(10),
    };

    /// Upper bound of the time spent waiting between attempts.
    pub fn max_wait(&self) -> Duration {
        self.interval
            .saturating_mul(self.attempts.saturating_sub(1) as u32)
    }
}

/// Where RTT finds its control block in target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlBlock {
    /// Let the driver search target RAM for the control block.
    #[default]
    Auto,
    /// Use the control block at this exact address.
    Exact(u32),
}

impl ControlBlock {
    /// The address handed to the driver, where 0 requests auto-discovery.
    pub fn address(self) -> u32 {
        match self {
            ControlBlock::Auto => 0,
            ControlBlock::Exact(address) => address,
        }
    }
}

impl From<u32> for ControlBlock {
    fn from(address: u32) -> Self {
        match address {
            0 => ControlBlock::Auto,
            address => ControlBlock::Exact(address),
        }
    }
}

impl fmt::Display for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlBlock::Auto => write!(f, "auto"),
            ControlBlock::Exact(address) => write!(f, "{address:#010x}"),
        }
    }
}

/// Everything needed to open and connect a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Target device name as known to the J-Link driver, e.g. `nRF52840_xxAA`.
    pub device: String,
    /// Interface clock in kHz.
    #[serde(default = "SessionConfig::default_speed")]
    pub speed_khz: u32,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub protocol: WireProtocol,
    #[serde(default = "SessionConfig::default_connect")]
    pub connect: PollBudget,
    #[serde(default = "SessionConfig::default_rtt")]
    pub rtt: PollBudget,
    /// Tear the session down when a pending driver error is detected during
    /// connect or RTT start.
    #[serde(default = "SessionConfig::default_close_on_error")]
    pub close_on_error: bool,
}

impl SessionConfig {
    pub const DEFAULT_SPEED_KHZ: u32 = 4000;

    pub fn new(device: impl Into<String>, speed_khz: u32, transport: Transport) -> Self {
        Self {
            device: device.into(),
            speed_khz,
            transport,
            protocol: WireProtocol::default(),
            connect: PollBudget::CONNECT,
            rtt: PollBudget::RTT,
            close_on_error: true,
        }
    }

    fn default_speed() -> u32 {
        Self::DEFAULT_SPEED_KHZ
    }

    fn default_connect() -> PollBudget {
        PollBudget::CONNECT
    }

    fn default_rtt() -> PollBudget {
        PollBudget::RTT
    }

    fn default_close_on_error() -> bool {
        true
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{ "device": "STM32F407VG" }"#).unwrap();

        assert_eq!(
            config,
            SessionConfig::new("STM32F407VG", 4000, Transport::Usb { index: 0 })
        );
        assert_eq!(config.protocol, WireProtocol::Swd);
        assert!(config.close_on_error);
    }

    #[test]
    fn ip_transport_defaults_to_remote_server_port() {
        let transport: Transport =
            serde_json::from_str(r#"{ "kind": "ip", "host": "192.168.1.20" }"#).unwrap();

        assert_eq!(transport, Transport::ip("192.168.1.20"));
        assert_eq!(transport.to_string(), "IP 192.168.1.20:19020");
    }

    #[test]
    fn budgets_are_read_in_milliseconds() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "device": "nRF52840_xxAA",
                "connect": { "attempts": 20, "interval": 50 },
                "rtt": { "attempts": 5, "interval": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.connect,
            PollBudget {
                attempts: 20,
                interval: Duration::from_millis(50)
            }
        );
        assert_eq!(config.rtt.interval, Duration::from_millis(1));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<SessionConfig, _> =
            serde_json::from_str(r#"{ "device": "x", "sped_khz": 100 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn zero_address_means_auto_discovery() {
        assert_eq!(ControlBlock::from(0), ControlBlock::Auto);
        assert_eq!(
            ControlBlock::from(0x2000_0400),
            ControlBlock::Exact(0x2000_0400)
        );
        assert_eq!(ControlBlock::Auto.address(), 0);
        assert_eq!(ControlBlock::Exact(0x2000_0400).to_string(), "0x20000400");
    }

    #[test]
    fn default_budgets_match_handshake_timing() {
        assert_eq!(PollBudget::CONNECT.max_wait(), Duration::from_millis(900));
        assert_eq!(PollBudget::RTT.max_wait(), Duration::from_millis(990));
    }
}
