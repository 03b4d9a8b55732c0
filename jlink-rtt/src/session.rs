use std::ffi::CString;
use std::path::Path;

use crate::command;
use crate::config::{ControlBlock, SessionConfig, Transport};
use crate::driver::{Delay, HandleGuard, JlinkDriver, RttStatus, Sinks, ThreadSleep};
use crate::poll::{poll_until, Polled};
use crate::rtt::{self, RttController, RttState};
use crate::status::{self, ConnectionState, ResetType};
use crate::Error;

/// Handle passed to [`JlinkDriver::clear_breakpoints`] to clear all breakpoints.
const ALL_BREAKPOINTS: u32 = 0xFFFF_FFFF;

/// A connected J-Link session.
///
/// A session exclusively owns the driver handle from a successful
/// [`open`](SessionBuilder::open) until it is closed or dropped. Whenever an
/// operation fails in a way that leaves the driver in an unknown state, the
/// session tears itself down before returning the error; later calls then
/// fail with [`Error::Closed`].
///
/// # Example
///
/// ```no_run
/// use jlink_rtt::{JlinkDll, Session};
///
/// let driver = JlinkDll::load()?;
/// let mut session = Session::open_usb(driver, "nRF52840_xxAA", 4000)?;
///
/// session.start_rtt(3, 0)?;
///
/// let mut buf = [0u8; 1024];
/// let data = session.rtt_read(0, &mut buf)?;
/// println!("{}", String::from_utf8_lossy(data));
/// # Ok::<(), jlink_rtt::Error>(())
/// ```
#[derive(Debug)]
pub struct Session {
    driver: Box<dyn JlinkDriver>,
    config: SessionConfig,
    delay: Box<dyn Delay>,
    rtt: RttController,
    guard: Option<HandleGuard>,
}

impl Session {
    /// Returns a builder for a session on `driver`.
    pub fn builder(driver: impl JlinkDriver + 'static) -> SessionBuilder {
        SessionBuilder {
            driver: Box::new(driver),
            config: None,
            sinks: Sinks::default(),
            delay: Box::new(ThreadSleep),
        }
    }

    /// Opens a session to `device` through the first probe on USB.
    pub fn open_usb(
        driver: impl JlinkDriver + 'static,
        device: &str,
        speed_khz: u32,
    ) -> Result<Session, Error> {
        Self::builder(driver)
            .config(SessionConfig::new(device, speed_khz, Transport::usb()))
            .open()
    }

    /// Opens a session to `device` through a networked probe.
    pub fn open_ip(
        driver: impl JlinkDriver + 'static,
        device: &str,
        speed_khz: u32,
        host: &str,
        port: u16,
    ) -> Result<Session, Error> {
        let transport = Transport::Ip {
            host: host.to_owned(),
            port,
        };
        Self::builder(driver)
            .config(SessionConfig::new(device, speed_khz, transport))
            .open()
    }

    fn open(
        mut driver: Box<dyn JlinkDriver>,
        config: SessionConfig,
        sinks: Sinks,
        delay: Box<dyn Delay>,
    ) -> Result<Session, Error> {
        let guard = driver.handle_slot().acquire()?;
        if driver.is_open() {
            return Err(Error::AlreadyOpen);
        }

        // The probe has to be chosen before the driver is opened.
        select_transport(driver.as_mut(), &config.transport)?;

        tracing::debug!("Opening J-Link driver");
        driver.open(sinks).map_err(Error::OpenFailed)?;

        // From here on, dropping the session on an early return closes the driver.
        let mut session = Session {
            driver,
            config,
            delay,
            rtt: RttController::new(),
            guard: Some(guard),
        };
        session.connect()?;

        tracing::info!(
            "Connected to {} via {}",
            session.config.device,
            session.config.transport
        );
        Ok(session)
    }

    fn connect(&mut self) -> Result<(), Error> {
        let protocol = self.config.protocol;
        let code = self.driver.select_interface(protocol);
        if code != 0 {
            self.teardown();
            return Err(Error::ProtocolSelectFailed { protocol, code });
        }

        self.driver.set_speed(self.config.speed_khz);

        for command in command::PRE_CONNECT {
            self.exec_command(command)?;
        }
        self.exec_command(&command::select_device(&self.config.device))?;

        if ConnectionState::from(self.driver.is_connected()) == ConnectionState::Pending {
            let code = self.driver.connect();
            if code != 0 {
                self.teardown();
                return Err(Error::ConnectFailed(code));
            }
        }

        // Forces the driver to establish the connection; the answer is irrelevant.
        self.driver.is_halted();

        self.wait_connected()?;

        self.exec_command(command::POST_CONNECT)?;
        self.check_error(true)
    }

    fn wait_connected(&mut self) -> Result<(), Error> {
        let budget = self.config.connect;
        let driver = &mut self.driver;

        let polled = poll_until(&budget, self.delay.as_ref(), |attempt| {
            match ConnectionState::from(driver.is_connected()) {
                ConnectionState::Connected => Ok(true),
                ConnectionState::Pending => {
                    tracing::trace!("Not connected yet (attempt {})", attempt);
                    Ok(false)
                }
                ConnectionState::Invalid(code) => Err(Error::DriverFault {
                    operation: "connection state",
                    code: code.into(),
                }),
            }
        });

        match polled {
            Ok(Polled::Ready(attempts)) => {
                tracing::debug!("Connected after {} attempts", attempts);
                Ok(())
            }
            Ok(Polled::Exhausted) => {
                self.teardown();
                Err(Error::ConnectTimeout(budget.attempts))
            }
            Err(error) => {
                self.teardown();
                Err(error)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Returns true until the session has been torn down.
    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Executes a textual driver command.
    ///
    /// A failing command tears the session down.
    pub fn exec_command(&mut self, command: &str) -> Result<(), Error> {
        self.ensure_open()?;

        command::execute(self.driver.as_mut(), command).inspect_err(|_| self.teardown())
    }

    /// Fails with [`Error::GlobalError`] if the driver reports a pending error.
    ///
    /// With `close_on_error`, the session is torn down before the error is
    /// returned.
    pub fn check_error(&mut self, close_on_error: bool) -> Result<(), Error> {
        self.ensure_open()?;

        let result = status::global_error(self.driver.has_error());
        if result.is_err() && close_on_error {
            self.teardown();
        }
        result
    }

    /// Fails unless the driver reports a pending-error-free, connected target.
    pub fn check_connected(&mut self) -> Result<(), Error> {
        self.check_error(false)?;

        match ConnectionState::from(self.driver.is_connected()) {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Pending => Err(Error::NotConnected),
            ConnectionState::Invalid(code) => Err(Error::DriverFault {
                operation: "connection state",
                code: code.into(),
            }),
        }
    }

    pub fn is_halted(&mut self) -> Result<bool, Error> {
        self.ensure_open()?;
        status::halted(self.driver.is_halted())
    }

    pub fn halt(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.driver.halt();
        Ok(())
    }

    /// Resumes the target.
    pub fn go(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.driver.go();
        Ok(())
    }

    pub fn clear_all_breakpoints(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let code = self.driver.clear_breakpoints(ALL_BREAKPOINTS);
        status::non_negative("clear breakpoints", code).map(drop)
    }

    /// Resets the target using the configured reset type.
    pub fn reset_target(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let code = self.driver.reset();
        status::non_negative("reset", code).map(drop)
    }

    /// Selects how [`reset_target`](Self::reset_target) resets the target.
    ///
    /// `kind` is validated before the driver is involved, see [`ResetType`].
    pub fn set_reset_type(&mut self, kind: u8) -> Result<(), Error> {
        let kind = ResetType::try_from(kind)?;
        self.ensure_open()?;

        let code = self.driver.set_reset_type(kind as u8);
        status::non_negative("set reset type", code).map(drop)
    }

    /// Downloads a firmware image to the target.
    ///
    /// The file is handed to the driver as is, which determines the format
    /// from its contents and extension.
    pub fn flash(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if CString::new(path.as_os_str().as_encoded_bytes()).is_err() {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        self.ensure_open()?;

        tracing::info!("Flashing {}", path.display());
        let code = self.driver.download_file(path, 0);
        status::non_negative("download", code).map(drop)
    }

    /// Reads a snapshot of the RTT transport status.
    pub fn read_status(&mut self) -> Result<RttStatus, Error> {
        self.ensure_open()?;
        rtt::read_status(self.driver.as_mut())
    }

    /// Starts RTT and waits until the driver reports `up_buffers` up-buffers.
    ///
    /// `control_block` is the address of the RTT control block, or 0 to let
    /// the driver search for it. A running transport is replaced. If the
    /// transport does not come up, it is stopped again before the error is
    /// returned; a pending driver error tears the session down if
    /// [`SessionConfig::close_on_error`] is set.
    pub fn start_rtt(
        &mut self,
        up_buffers: u32,
        control_block: impl Into<ControlBlock>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        let budget = self.config.rtt;
        let result = self.rtt.start(
            self.driver.as_mut(),
            up_buffers,
            control_block.into(),
            &budget,
            self.delay.as_ref(),
        );

        match result {
            Ok(()) => Ok(()),
            Err(error @ Error::GlobalError(_)) if self.config.close_on_error => {
                self.teardown();
                Err(error)
            }
            Err(error) => {
                self.stop_rtt_quietly();
                Err(error)
            }
        }
    }

    /// Reads available data of up-buffer `buffer_index` into `data`.
    ///
    /// Returns the filled part of `data`. An empty slice means that no data
    /// was available; this call never waits for data.
    pub fn rtt_read<'b>(
        &mut self,
        buffer_index: u32,
        data: &'b mut [u8],
    ) -> Result<&'b [u8], Error> {
        self.ensure_open()?;
        self.rtt.read(self.driver.as_mut(), buffer_index, data)
    }

    /// Stops RTT.
    pub fn stop_rtt(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.rtt.stop(self.driver.as_mut())
    }

    pub fn rtt_state(&self) -> RttState {
        self.rtt.state()
    }

    fn stop_rtt_quietly(&mut self) {
        if !self.rtt.is_active() {
            return;
        }
        if let Err(error) = self.rtt.stop(self.driver.as_mut()) {
            tracing::warn!("Failed to stop RTT: {}", error);
        }
    }

    /// Stops RTT if needed and releases the driver handle. Never fails.
    fn teardown(&mut self) {
        if self.guard.is_none() {
            return;
        }

        self.stop_rtt_quietly();

        tracing::debug!("Closing J-Link driver");
        self.driver.close();
        self.guard = None;
    }

    /// Closes the session, releasing the driver handle.
    pub fn close(mut self) {
        self.teardown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn select_transport(driver: &mut dyn JlinkDriver, transport: &Transport) -> Result<(), Error> {
    tracing::debug!("Selecting {}", transport);

    let code = match transport {
        Transport::Usb { index } => driver.select_usb(*index),
        Transport::Ip { host, port } => driver.select_ip(host, *port),
    };

    match code {
        0 => Ok(()),
        code => Err(Error::TransportSelectFailed {
            transport: transport.clone(),
            code,
        }),
    }
}

/// A builder for a [`Session`].
#[derive(Debug)]
pub struct SessionBuilder {
    driver: Box<dyn JlinkDriver>,
    config: Option<SessionConfig>,
    sinks: Sinks,
    delay: Box<dyn Delay>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the sinks receiving driver messages. By default they go to `tracing`.
    pub fn sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Routes informational driver messages to `sink`.
    ///
    /// The driver may call `sink` from its own threads.
    pub fn log_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sinks = self.sinks.with_log(sink);
        self
    }

    /// Routes driver error messages to `sink`.
    ///
    /// The driver may call `sink` from its own threads.
    pub fn error_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sinks = self.sinks.with_error(sink);
        self
    }

    /// Replaces how polling loops wait between attempts.
    pub fn delay(mut self, delay: impl Delay + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    /// Opens the driver and connects to the target.
    ///
    /// Any failure releases what was acquired so far before the error is
    /// returned.
    pub fn open(self) -> Result<Session, Error> {
        let config = self.config.ok_or(Error::OpenFailed(
            "no session configuration given".to_owned(),
        ))?;
        Session::open(self.driver, config, self.sinks, self.delay)
    }
}
