//! The operations a J-Link driver offers to a session.
//!
//! [`JlinkDriver`] mirrors the primitives of the vendor library one to one and
//! reports results as the raw status codes the library returns. Interpreting
//! those codes is the job of [`crate::status`], so that every driver
//! implementation (the vendor library in [`dll`], the fake driver used in
//! tests) is judged by the same rules.

pub mod dll;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::Error;

/// The wire protocol used between probe and target.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum WireProtocol {
    /// Serial wire debug.
    #[default]
    Swd,
    /// JTAG.
    Jtag,
}

impl WireProtocol {
    /// The interface code the J-Link driver uses for this protocol.
    pub fn interface_code(self) -> i32 {
        match self {
            WireProtocol::Jtag => 0,
            WireProtocol::Swd => 1,
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireProtocol::Swd => write!(f, "SWD"),
            WireProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

impl std::str::FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "swd" => Ok(WireProtocol::Swd),
            "jtag" => Ok(WireProtocol::Jtag),
            _ => Err(format!(
                "'{s}' is not a valid protocol. Choose from [swd, jtag]."
            )),
        }
    }
}

/// A control request for the driver's RTT transport.
#[derive(Debug)]
pub enum RttCommand<'a> {
    /// Start RTT with the control block at `address`, 0 to auto-discover it.
    Start { address: u32 },
    /// Stop RTT.
    Stop,
    /// Fill in the current transfer status.
    GetStatus(&'a mut RttStatus),
}

impl RttCommand<'_> {
    pub const START: u32 = 0;
    pub const STOP: u32 = 1;
    pub const GET_STATUS: u32 = 4;

    /// The command number understood by the driver.
    pub fn code(&self) -> u32 {
        match self {
            RttCommand::Start { .. } => Self::START,
            RttCommand::Stop => Self::STOP,
            RttCommand::GetStatus(_) => Self::GET_STATUS,
        }
    }
}

/// Payload of an RTT start request, as laid out by the driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RttStart {
    pub config_block_address: u32,
    padding: [u32; 3],
}

impl RttStart {
    pub fn new(config_block_address: u32) -> Self {
        Self {
            config_block_address,
            padding: [0; 3],
        }
    }
}

/// A point-in-time snapshot of the driver's RTT transport.
///
/// The layout matches the structure the driver fills in, so a snapshot can be
/// handed to the driver directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttStatus {
    pub num_bytes_transferred: u32,
    pub num_bytes_read: u32,
    pub host_overflow_count: i32,
    pub is_running: i32,
    pub num_up_buffers: i32,
    pub num_down_buffers: i32,
    pub overflow_mask: u32,
    padding: u32,
}

impl RttStatus {
    /// Returns true if the driver has located the control block and is transferring data.
    pub fn is_running(&self) -> bool {
        self.is_running != 0
    }

    /// Number of up (target to host) buffers in the control block.
    pub fn up_buffers(&self) -> i32 {
        self.num_up_buffers
    }

    /// Number of down (host to target) buffers in the control block.
    pub fn down_buffers(&self) -> i32 {
        self.num_down_buffers
    }

    pub fn bytes_transferred(&self) -> u32 {
        self.num_bytes_transferred
    }

    pub fn bytes_read(&self) -> u32 {
        self.num_bytes_read
    }

    pub fn host_overflow_count(&self) -> i32 {
        self.host_overflow_count
    }

    pub fn overflow_mask(&self) -> u32 {
        self.overflow_mask
    }

    /// Returns true if RTT runs with exactly `up_buffers` up-buffers.
    pub fn is_ready_with(&self, up_buffers: u32) -> bool {
        self.is_running() && i64::from(self.num_up_buffers) == i64::from(up_buffers)
    }
}

/// A message sink for driver output.
///
/// The driver may call sinks from its own threads at any time, so they must
/// be callable concurrently with the thread owning the session.
pub type Sink = Arc<dyn Fn(&str) + Send + Sync>;

/// The log and error sinks registered when the driver is opened.
#[derive(Clone)]
pub struct Sinks {
    log: Sink,
    error: Sink,
}

impl Sinks {
    pub fn new(log: Sink, error: Sink) -> Self {
        Self { log, error }
    }

    /// Replaces the sink for informational driver messages.
    pub fn with_log(self, log: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            log: Arc::new(log),
            ..self
        }
    }

    /// Replaces the sink for driver error messages.
    pub fn with_error(self, error: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            error: Arc::new(error),
            ..self
        }
    }

    pub fn log(&self, message: &str) {
        (self.log)(message)
    }

    pub fn error(&self, message: &str) {
        (self.error)(message)
    }
}

/// Forwards driver messages to `tracing`.
impl Default for Sinks {
    fn default() -> Self {
        Self {
            log: Arc::new(|message| tracing::debug!(target: "jlink", "{}", message.trim_end())),
            error: Arc::new(|message| tracing::error!(target: "jlink", "{}", message.trim_end())),
        }
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

/// Exclusive ownership of a driver handle.
///
/// The vendor library keeps a single global handle per process, so at most
/// one session may use it at a time. Sessions take the slot before opening
/// the driver and give it back when they are torn down.
#[derive(Clone, Debug, Default)]
pub struct HandleSlot {
    held: Arc<Mutex<bool>>,
}

impl HandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the slot, failing with [`Error::AlreadyOpen`] if it is held.
    pub fn acquire(&self) -> Result<HandleGuard, Error> {
        let mut held = self.held.lock();
        if *held {
            return Err(Error::AlreadyOpen);
        }
        *held = true;

        Ok(HandleGuard {
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// Releases its [`HandleSlot`] when dropped.
#[derive(Debug)]
pub struct HandleGuard {
    held: Arc<Mutex<bool>>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        *self.held.lock() = false;
    }
}

/// Blocks the calling thread between two polling attempts.
pub trait Delay: Send + fmt::Debug {
    fn delay(&self, duration: Duration);
}

/// Sleeps on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Delay for ThreadSleep {
    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// The primitives of a J-Link driver.
///
/// Methods return the driver's raw status codes. Unless noted otherwise,
/// 0 means success for `i32` results and negative values are errors.
pub trait JlinkDriver: Send + fmt::Debug {
    /// The slot guarding the handle this driver hands out.
    fn handle_slot(&self) -> HandleSlot;

    /// Returns true if the driver already has an open handle.
    fn is_open(&mut self) -> bool;

    /// Opens the driver handle and registers the message sinks.
    ///
    /// On failure, returns the message the driver reported.
    fn open(&mut self, sinks: Sinks) -> Result<(), String>;

    /// Selects a probe on USB by index.
    fn select_usb(&mut self, index: u32) -> i32;

    /// Selects a networked probe.
    fn select_ip(&mut self, host: &str, port: u16) -> i32;

    /// Selects the wire protocol to the target.
    fn select_interface(&mut self, protocol: WireProtocol) -> i32;

    fn set_speed(&mut self, khz: u32);

    /// 0 while not connected yet, 1 once connected, anything else is an error.
    fn is_connected(&mut self) -> i8;

    fn connect(&mut self) -> i32;

    /// 0 when running, positive when halted, negative on error.
    fn is_halted(&mut self) -> i8;

    fn halt(&mut self);

    fn go(&mut self);

    /// Clears all breakpoints matching `handle`, `0xFFFF_FFFF` for all of them.
    fn clear_breakpoints(&mut self, handle: u32) -> i32;

    /// Executes a textual command.
    ///
    /// A positive result is a failure and gives the number of message bytes
    /// written into `error`.
    fn exec_command(&mut self, command: &str, error: &mut [u8]) -> i32;

    /// A non-zero result reports a pending error.
    fn has_error(&mut self) -> i32;

    fn close(&mut self);

    fn reset(&mut self) -> i32;

    fn set_reset_type(&mut self, kind: u8) -> i32;

    fn download_file(&mut self, path: &Path, address: u32) -> i32;

    fn rtt_control(&mut self, command: RttCommand<'_>) -> i32;

    /// Reads from up-buffer `buffer_index`; returns the number of bytes read.
    fn rtt_read(&mut self, buffer_index: u32, data: &mut [u8]) -> i32;
}
