use std::path::{Path, PathBuf};

use anyhow::bail;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment, Provider,
};
use jlink_rtt::{ControlBlock, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::logging::LevelFilter;

/// Prefix of environment variables overriding config values, e.g.
/// `RTTHOST_SESSION__DEVICE=nRF52840_xxAA`.
const ENV_PREFIX: &str = "RTTHOST_";

/// The layered configuration sources.
#[derive(Debug, Clone)]
pub struct Configs {
    figment: Figment,
}

/// All options of the host.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: General,
    pub session: SessionConfig,
    pub flashing: Flashing,
    pub reset: Reset,
    pub rtt: Rtt,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    pub log_level: Option<LevelFilter>,
    pub log_file: Option<PathBuf>,
    /// The J-Link driver library. Searched on the platform's library path if unset.
    pub library: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Flashing {
    /// Image to download before starting RTT.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Reset {
    /// Reset and resume the target before starting RTT.
    pub enabled: bool,
    /// Reset type as understood by the driver: 0=Normal, 1=Core, 2=ResetPin.
    pub kind: u8,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Rtt {
    /// Number of up-buffers the firmware sets up.
    pub up_buffers: u32,
    /// The up-buffer streamed to stdout.
    pub channel: u32,
    pub control_block: ControlBlock,
}

impl Configs {
    pub fn new(conf_dir: &Path) -> Configs {
        let mut figment = Figment::new().merge(Toml::string(include_str!("default.toml")));

        // Project settings first, personal settings may override them.
        for name in ["RttHost", ".rtthost", "RttHost.local", ".rtthost.local"] {
            let file = |extension: &str| conf_dir.join(format!("{name}.{extension}"));

            figment = figment
                .merge(Toml::file(file("toml")))
                .merge(Json::file(file("json")))
                .merge(Yaml::file(file("yaml")))
                .merge(Yaml::file(file("yml")));
        }

        Configs { figment }
    }

    /// Adds a config file given on the command line.
    pub fn merge(&mut self, conf_file: &Path) -> anyhow::Result<()> {
        let figment = self.figment.clone();
        self.figment = match conf_file.extension().and_then(|e| e.to_str()) {
            Some("toml") => figment.merge(Toml::file(conf_file)),
            Some("json") => figment.merge(Json::file(conf_file)),
            Some("yml" | "yaml") => figment.merge(Yaml::file(conf_file)),
            _ => bail!(
                "File format not recognized from extension (supported: .toml, .json, .yaml / .yml)"
            ),
        };
        Ok(())
    }

    /// Applies environment variables, then `overrides`, and extracts the config.
    pub fn extract(self, overrides: impl Provider) -> anyhow::Result<Config> {
        let figment = self
            .figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(overrides);

        match figment.extract::<Config>() {
            Ok(config) => Ok(config),
            Err(errors) => bail!(
                "Failed to parse supplied configuration:\n{}",
                errors
                    .into_iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<String>>()
                    .join("\n")
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use figment::providers::Serialized;
    use jlink_rtt::{Transport, WireProtocol};
    use pretty_assertions::assert_eq;

    fn device(name: &str) -> Serialized<&str> {
        Serialized::default("session.device", name)
    }

    fn empty_dir() -> PathBuf {
        PathBuf::from("/nonexistent-rtthost-config-dir")
    }

    #[test]
    fn defaults_need_only_a_device() {
        let config = Configs::new(&empty_dir())
            .extract(device("nRF52840_xxAA"))
            .unwrap();

        assert_eq!(config.session.device, "nRF52840_xxAA");
        assert_eq!(config.session.speed_khz, 4000);
        assert_eq!(config.session.transport, Transport::usb());
        assert_eq!(config.session.protocol, WireProtocol::Swd);
        assert_eq!(config.rtt.up_buffers, 1);
        assert_eq!(config.rtt.control_block, ControlBlock::Auto);
        assert!(!config.reset.enabled);
    }

    #[test]
    fn missing_device_is_an_error() {
        let error = Configs::new(&empty_dir())
            .extract(Figment::new())
            .unwrap_err();

        assert!(error.to_string().contains("device"), "{error}");
    }

    #[test]
    fn unknown_config_items_fail() {
        let overrides = Figment::new()
            .merge(device("nRF52840_xxAA"))
            .merge(Toml::string("[rtt]\nbogus_item = 1"));

        assert!(Configs::new(&empty_dir()).extract(overrides).is_err());
    }

    #[test]
    fn transport_and_control_block_from_toml() {
        let overrides = Toml::string(
            r#"
            [session]
            device = "STM32F407VG"
            transport = { kind = "ip", host = "10.0.0.7" }

            [rtt]
            control_block = { exact = 0x20000400 }
            "#,
        );

        let config = Configs::new(&empty_dir()).extract(overrides).unwrap();

        assert_eq!(config.session.transport, Transport::ip("10.0.0.7"));
        assert_eq!(config.rtt.control_block, ControlBlock::Exact(0x2000_0400));
    }

    #[test]
    fn session_config_survives_another_layer() {
        let config = Configs::new(&empty_dir())
            .extract(device("nRF52840_xxAA"))
            .unwrap();

        let layered: SessionConfig = Figment::from(Serialized::defaults(&config.session))
            .extract()
            .unwrap();

        assert_eq!(layered, config.session);
    }

    #[test]
    fn file_name_patterns() {
        // Existence of files is not tested here, so it is fine to use a file that does not exist
        Configs::new(&empty_dir())
            .merge(Path::new("nonexistent-file.yml"))
            .unwrap();
        Configs::new(&empty_dir())
            .merge(Path::new("nonexistent-file.unknown"))
            .unwrap_err();
    }
}
