mod config;
mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use figment::{providers::Serialized, Figment};
use jlink_rtt::{ControlBlock, JlinkDll, Session, Transport};
use signal_hook::consts::signal;

use crate::config::{Config, Configs};
use crate::logging::{setup_logging, LevelFilter};

/// Wait after a read that returned data; more is likely pending.
const BUSY_INTERVAL: Duration = Duration::from_millis(1);
/// Wait after a read that returned nothing.
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUFFER_SIZE: usize = 1024;

fn parse_u32(src: &str) -> Result<u32, std::num::ParseIntError> {
    let src = src.trim();
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => src.parse(),
    }
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "jlink-rtthost",
    about = "Streams RTT (real-time transfer) output of a target through a J-Link probe.",
    version
)]
struct Opts {
    /// Additional config file (.toml, .json, .yaml), applied over RttHost.* in the working directory.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Target device name as known to the J-Link software, e.g. nRF52840_xxAA.
    #[clap(short, long)]
    device: Option<String>,

    /// Interface clock in kHz.
    #[clap(short, long)]
    speed: Option<u32>,

    /// Use the USB probe with this index.
    #[clap(long, conflicts_with = "ip")]
    usb: Option<u32>,

    /// Use the networked probe at this host.
    #[clap(long)]
    ip: Option<String>,

    /// Port of the networked probe.
    #[clap(long, requires = "ip")]
    port: Option<u16>,

    /// Path of the J-Link driver library.
    #[clap(long, env = "JLINK_LIBRARY")]
    library: Option<PathBuf>,

    /// Number of up-buffers the firmware sets up.
    #[clap(short, long)]
    buffers: Option<u32>,

    /// Up-buffer to stream to stdout.
    #[clap(short, long)]
    channel: Option<u32>,

    /// Address of the RTT control block, hex (0x...) or decimal. 0 searches target RAM.
    #[clap(long, value_parser = parse_u32)]
    control_block: Option<u32>,

    /// Download this image before starting RTT.
    #[clap(long)]
    flash: Option<PathBuf>,

    /// Reset and resume the target before starting RTT.
    #[clap(long)]
    reset: bool,

    #[clap(long, value_enum)]
    log_level: Option<LevelFilter>,

    /// Also write a JSON log of everything, including driver messages, to this file.
    #[clap(long)]
    log_file: Option<PathBuf>,
}

impl Opts {
    /// The options given on the command line, as config overrides.
    fn overrides(&self) -> Figment {
        let mut figment = Figment::new();

        if let Some(device) = &self.device {
            figment = figment.merge(Serialized::default("session.device", device));
        }
        if let Some(speed) = self.speed {
            figment = figment.merge(Serialized::default("session.speed_khz", speed));
        }
        if let Some(host) = &self.ip {
            let transport = Transport::Ip {
                host: host.clone(),
                port: self.port.unwrap_or(Transport::DEFAULT_IP_PORT),
            };
            figment = figment.merge(Serialized::default("session.transport", transport));
        } else if let Some(index) = self.usb {
            let transport = Transport::Usb { index };
            figment = figment.merge(Serialized::default("session.transport", transport));
        }
        if let Some(library) = &self.library {
            figment = figment.merge(Serialized::default("general.library", library));
        }
        if let Some(buffers) = self.buffers {
            figment = figment.merge(Serialized::default("rtt.up_buffers", buffers));
        }
        if let Some(channel) = self.channel {
            figment = figment.merge(Serialized::default("rtt.channel", channel));
        }
        if let Some(address) = self.control_block {
            let control_block = ControlBlock::from(address);
            figment = figment.merge(Serialized::default("rtt.control_block", control_block));
        }
        if let Some(file) = &self.flash {
            figment = figment.merge(Serialized::default("flashing.file", file));
        }
        if self.reset {
            figment = figment.merge(Serialized::default("reset.enabled", true));
        }
        if let Some(level) = self.log_level {
            figment = figment.merge(Serialized::default("general.log_level", level));
        }
        if let Some(path) = &self.log_file {
            figment = figment.merge(Serialized::default("general.log_file", path));
        }

        figment
    }
}

fn main() -> ExitCode {
    match run(Opts::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let mut configs = Configs::new(&std::env::current_dir()?);
    if let Some(path) = &opts.config {
        configs.merge(path)?;
    }
    let config = configs.extract(opts.overrides())?;

    let _log_guard = setup_logging(
        config.general.log_file.as_deref(),
        config.general.log_level,
    )?;

    let mut session = open_session(&config)?;

    if let Some(file) = &config.flashing.file {
        session
            .flash(file)
            .with_context(|| format!("Failed to flash {}", file.display()))?;
    }

    if config.reset.enabled {
        session.set_reset_type(config.reset.kind)?;
        session.reset_target().context("Failed to reset the target")?;
        session.go()?;
    }

    session
        .start_rtt(config.rtt.up_buffers, config.rtt.control_block)
        .context("Failed to start RTT")?;
    tracing::info!(
        "RTT running, streaming up-buffer {} (control block: {})",
        config.rtt.channel,
        config.rtt.control_block
    );

    stream(&mut session, config.rtt.channel)?;

    session.close();
    Ok(())
}

fn open_session(config: &Config) -> anyhow::Result<Session> {
    let driver = match &config.general.library {
        Some(path) => JlinkDll::load_from(path),
        None => JlinkDll::load(),
    }
    .context("Failed to load the J-Link library")?;

    Session::builder(driver)
        .config(config.session.clone())
        .open()
        .with_context(|| {
            format!(
                "Failed to connect to {} via {}",
                config.session.device, config.session.transport
            )
        })
}

/// Copies the up-buffer `channel` to stdout until interrupted.
fn stream(session: &mut Session, channel: u32) -> anyhow::Result<()> {
    let exit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal::SIGINT, exit.clone())?;

    let mut stdout = std::io::stdout().lock();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !exit.load(Ordering::Relaxed) {
        let data = session
            .rtt_read(channel, &mut buf)
            .context("Failed to read from RTT")?;

        if data.is_empty() {
            thread::sleep(IDLE_INTERVAL);
            continue;
        }

        stdout.write_all(data).context("Failed to write to stdout")?;
        stdout.flush()?;
        thread::sleep(BUSY_INTERVAL);
    }

    tracing::info!("Interrupted, closing the session");
    Ok(())
}
