//! # Sessions and RTT streaming for SEGGER J-Link probes
//!
//! This crate drives a J-Link probe through the vendor's driver library. It
//! opens the driver, connects to a target, and streams data from the
//! target's RTT (Real-Time Transfer) up-buffers to the host.
//!
//! # Prerequisites
//!
//! - The J-Link software package, providing `libjlinkarm` (or
//!   `JLink_x64.dll` on Windows)
//!
//! # Examples
//!
//! ## Streaming RTT output
//!
//! ```no_run
//! use jlink_rtt::{JlinkDll, Session, SessionConfig, Transport};
//!
//! let driver = JlinkDll::load()?;
//! let mut session = Session::builder(driver)
//!     .config(SessionConfig::new("nRF52840_xxAA", 4000, Transport::usb()))
//!     .error_sink(|message| eprintln!("J-Link: {message}"))
//!     .open()?;
//!
//! // Let the driver search for the control block, expecting 3 up-buffers.
//! session.start_rtt(3, 0)?;
//!
//! let mut buf = [0u8; 1024];
//! loop {
//!     let data = session.rtt_read(0, &mut buf)?;
//!     print!("{}", String::from_utf8_lossy(data));
//! }
//! # Ok::<(), jlink_rtt::Error>(())
//! ```
//!
//! ## Flashing and resetting
//!
//! ```no_run
//! use jlink_rtt::{JlinkDll, Session};
//!
//! let mut session = Session::open_ip(JlinkDll::load()?, "STM32F407VG", 4000, "10.0.0.7", 19020)?;
//!
//! session.halt()?;
//! session.flash("firmware.hex")?;
//! session.set_reset_type(0)?;
//! session.reset_target()?;
//! session.go()?;
//! # Ok::<(), jlink_rtt::Error>(())
//! ```
//!
//! jlink-rtt is built around the [Session] struct, which owns a
//! [JlinkDriver]. The driver trait is what allows running the session logic
//! against the scripted driver behind the `test` feature.

#![cfg_attr(jlink_docsrs, feature(doc_cfg))]

pub mod command;
pub mod config;
pub mod driver;
mod error;
mod poll;
pub mod rtt;
mod session;
pub mod status;

#[cfg(any(test, feature = "test"))]
#[cfg_attr(jlink_docsrs, doc(cfg(feature = "test")))]
pub mod fake;

pub use crate::config::{ControlBlock, PollBudget, SessionConfig, Transport};
pub use crate::driver::dll::JlinkDll;
pub use crate::driver::{
    Delay, HandleSlot, JlinkDriver, RttStatus, Sink, Sinks, ThreadSleep, WireProtocol,
};
pub use crate::error::Error;
pub use crate::rtt::RttState;
pub use crate::session::{Session, SessionBuilder};
pub use crate::status::{ConnectionState, ResetType};
