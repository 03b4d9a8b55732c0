//! Control of the driver's RTT (Real-Time Transfer) transport.
//!
//! RTT moves data between target and host through ring buffers in target
//! memory, described by a control block. The J-Link driver polls these
//! buffers on its own once RTT is started; the host only starts the
//! transport, waits until the driver has found the control block, and then
//! drains the up-buffers at its own pace.
//!
//! ## Starting
//!
//! [`RttController::start`] moves through
//! `Stopped -> Starting -> Polling -> Running`. The driver is told where the
//! control block lives; an explicit address is faster than letting the
//! driver scan target RAM, but it may be stale or point at memory the
//! firmware has not initialized yet. So if the driver does not report the
//! requested up-buffers in time with an explicit address, the start is
//! retried exactly once with auto-discovery before giving up with
//! [`Error::RttTimeout`].

use crate::config::{ControlBlock, PollBudget};
use crate::driver::{Delay, JlinkDriver, RttCommand, RttStatus};
use crate::poll::{poll_until, Polled};
use crate::status;
use crate::Error;

/// The state of the RTT transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RttState {
    #[default]
    Stopped,
    /// A start request is being sent to the driver.
    Starting,
    /// The driver accepted the start request, waiting for the control block.
    Polling,
    /// The driver reports the requested up-buffers.
    Running,
}

/// Drives the RTT transport of one session.
#[derive(Debug, Default)]
pub struct RttController {
    state: RttState,
    up_buffers: u32,
    control_block: ControlBlock,
}

impl RttController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RttState {
        self.state
    }

    /// Returns true if the driver's transport was started and not stopped since.
    pub fn is_active(&self) -> bool {
        matches!(self.state, RttState::Polling | RttState::Running)
    }

    /// The control block the transport was last started with.
    pub fn control_block(&self) -> ControlBlock {
        self.control_block
    }

    /// Starts RTT and waits for `up_buffers` up-buffers to be reported.
    ///
    /// A transport that is still active is stopped first. On error the
    /// transport may be left in [`RttState::Polling`]; the caller decides how
    /// to clean up.
    pub fn start(
        &mut self,
        driver: &mut dyn JlinkDriver,
        up_buffers: u32,
        control_block: ControlBlock,
        budget: &PollBudget,
        delay: &dyn Delay,
    ) -> Result<(), Error> {
        self.up_buffers = up_buffers;

        self.begin(driver, control_block)?;
        if self.wait_ready(driver, budget, delay)? {
            return Ok(());
        }

        let mut attempts = budget.attempts;

        if control_block != ControlBlock::Auto {
            tracing::warn!(
                "RTT did not come up with control block at {}, retrying with auto-discovery",
                control_block
            );

            self.begin(driver, ControlBlock::Auto)?;
            if self.wait_ready(driver, budget, delay)? {
                return Ok(());
            }
            attempts += budget.attempts;
        }

        Err(Error::RttTimeout {
            up_buffers,
            attempts,
        })
    }

    fn begin(
        &mut self,
        driver: &mut dyn JlinkDriver,
        control_block: ControlBlock,
    ) -> Result<(), Error> {
        if self.is_active() {
            self.stop(driver)?;
        }

        tracing::debug!("Starting RTT (control block: {})", control_block);

        self.state = RttState::Starting;
        self.control_block = control_block;

        let code = driver.rtt_control(RttCommand::Start {
            address: control_block.address(),
        });
        if let Err(error) = status::non_negative("RTT start", code) {
            self.state = RttState::Stopped;
            return Err(error);
        }

        self.state = RttState::Polling;
        Ok(())
    }

    fn wait_ready(
        &mut self,
        driver: &mut dyn JlinkDriver,
        budget: &PollBudget,
        delay: &dyn Delay,
    ) -> Result<bool, Error> {
        let up_buffers = self.up_buffers;

        let polled = poll_until(budget, delay, |attempt| {
            let snapshot = read_status(driver)?;
            status::global_error(driver.has_error())?;

            tracing::trace!(
                "RTT poll {}: running={} up-buffers={}",
                attempt,
                snapshot.is_running(),
                snapshot.up_buffers()
            );

            Ok(snapshot.is_ready_with(up_buffers))
        })?;

        match polled {
            Polled::Ready(attempts) => {
                tracing::debug!("RTT running after {} attempts", attempts);
                self.state = RttState::Running;
                Ok(true)
            }
            Polled::Exhausted => Ok(false),
        }
    }

    /// Stops the driver's RTT transport.
    pub fn stop(&mut self, driver: &mut dyn JlinkDriver) -> Result<(), Error> {
        let code = driver.rtt_control(RttCommand::Stop);
        status::non_negative("RTT stop", code)?;

        self.state = RttState::Stopped;
        Ok(())
    }

    /// Reads whatever up-buffer `buffer_index` holds into `data`.
    ///
    /// Returns the filled part of `data`, which is empty if no data is
    /// available. Never blocks.
    pub fn read<'b>(
        &mut self,
        driver: &mut dyn JlinkDriver,
        buffer_index: u32,
        data: &'b mut [u8],
    ) -> Result<&'b [u8], Error> {
        // The driver takes a 32 bit length.
        let len = data.len().min(u32::MAX as usize);
        let code = driver.rtt_read(buffer_index, &mut data[..len]);

        let count = status::non_negative("RTT read", code)? as usize;
        if count > len {
            return Err(Error::DriverFault {
                operation: "RTT read",
                code,
            });
        }

        Ok(&data[..count])
    }
}

/// Reads the current status of the driver's RTT transport.
pub(crate) fn read_status(driver: &mut dyn JlinkDriver) -> Result<RttStatus, Error> {
    let mut snapshot = RttStatus::default();
    let code = driver.rtt_control(RttCommand::GetStatus(&mut snapshot));
    status::non_negative("RTT status", code)?;

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fake::{Call, FakeDriver, RecordingDelay};
    use pretty_assertions::assert_eq;

    const BUDGET: PollBudget = PollBudget {
        attempts: 5,
        interval: Duration::from_millis(10),
    };

    fn start_calls(calls: &[Call]) -> Vec<u32> {
        calls
            .iter()
            .filter_map(|call| match call {
                Call::RttStart(address) => Some(*address),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_with_auto_discovery() {
        let mut driver = FakeDriver::new();
        driver.state().lock().rtt_ready_after.insert(0, 2);
        let delay = RecordingDelay::new();
        let mut rtt = RttController::new();

        rtt.start(&mut driver, 1, ControlBlock::Auto, &BUDGET, &delay)
            .unwrap();

        assert_eq!(rtt.state(), RttState::Running);
        assert_eq!(driver.state().lock().count(|c| *c == Call::RttGetStatus), 3);
        assert_eq!(delay.count(), 2);
    }

    #[test]
    fn waits_for_requested_buffer_count() {
        let mut driver = FakeDriver::new();
        {
            let state = driver.state();
            let mut state = state.lock();
            state.rtt_ready_after.insert(0, 0);
            state.rtt_up_buffers = 1;
        }
        let delay = RecordingDelay::new();
        let mut rtt = RttController::new();

        let result = rtt.start(&mut driver, 3, ControlBlock::Auto, &BUDGET, &delay);

        assert!(matches!(
            result,
            Err(Error::RttTimeout {
                up_buffers: 3,
                attempts: 5
            })
        ));
        assert_eq!(rtt.state(), RttState::Polling);
    }

    #[test]
    fn falls_back_to_auto_discovery_once() {
        let mut driver = FakeDriver::new();
        driver.state().lock().rtt_ready_after.insert(0, 0);
        let delay = RecordingDelay::new();
        let mut rtt = RttController::new();

        rtt.start(
            &mut driver,
            1,
            ControlBlock::Exact(0x2000_0000),
            &BUDGET,
            &delay,
        )
        .unwrap();

        let state = driver.state();
        let state = state.lock();
        assert_eq!(start_calls(&state.calls), [0x2000_0000, 0]);
        assert_eq!(state.count(|c| *c == Call::RttStop), 1);
        assert_eq!(rtt.control_block(), ControlBlock::Auto);
        assert_eq!(rtt.state(), RttState::Running);
    }

    #[test]
    fn start_failure_leaves_transport_stopped() {
        let mut driver = FakeDriver::new();
        driver.state().lock().rtt_start_code = -1;
        let mut rtt = RttController::new();

        let result = rtt.start(
            &mut driver,
            1,
            ControlBlock::Auto,
            &BUDGET,
            &RecordingDelay::new(),
        );

        assert!(matches!(
            result,
            Err(Error::DriverFault {
                operation: "RTT start",
                code: -1
            })
        ));
        assert_eq!(rtt.state(), RttState::Stopped);
    }

    #[test]
    fn pending_error_aborts_polling() {
        let mut driver = FakeDriver::new();
        driver.state().lock().has_error_code = -7;
        let delay = RecordingDelay::new();
        let mut rtt = RttController::new();

        let result = rtt.start(
            &mut driver,
            1,
            ControlBlock::Exact(0x2000_0000),
            &BUDGET,
            &delay,
        );

        assert!(matches!(result, Err(Error::GlobalError(-7))));
        assert_eq!(start_calls(&driver.state().lock().calls), [0x2000_0000]);
        assert_eq!(delay.count(), 0);
    }

    #[test]
    fn restart_stops_previous_transport() {
        let mut driver = FakeDriver::new();
        driver.state().lock().rtt_ready_after.insert(0, 0);
        let delay = RecordingDelay::new();
        let mut rtt = RttController::new();

        rtt.start(&mut driver, 1, ControlBlock::Auto, &BUDGET, &delay)
            .unwrap();
        rtt.start(&mut driver, 1, ControlBlock::Auto, &BUDGET, &delay)
            .unwrap();

        let state = driver.state();
        let state = state.lock();
        let rtt_calls: Vec<_> = state
            .calls
            .iter()
            .filter(|c| matches!(c, Call::RttStart(_) | Call::RttStop))
            .cloned()
            .collect();
        assert_eq!(
            rtt_calls,
            [Call::RttStart(0), Call::RttStop, Call::RttStart(0)]
        );
    }

    #[test]
    fn read_returns_available_bytes() {
        let mut driver = FakeDriver::new();
        driver.state().lock().push_rtt_data(0, b"hello");
        let mut rtt = RttController::new();
        let mut buf = [0u8; 3];

        assert_eq!(rtt.read(&mut driver, 0, &mut buf).unwrap(), b"hel");
        assert_eq!(rtt.read(&mut driver, 0, &mut buf).unwrap(), b"lo");
        assert!(rtt.read(&mut driver, 0, &mut buf).unwrap().is_empty());
    }

    #[test]
    fn read_rejects_bad_counts() {
        let mut driver = FakeDriver::new();
        let mut rtt = RttController::new();
        let mut buf = [0u8; 4];

        driver.state().lock().rtt_read_code = Some(-2);
        assert!(matches!(
            rtt.read(&mut driver, 0, &mut buf),
            Err(Error::DriverFault { code: -2, .. })
        ));

        driver.state().lock().rtt_read_code = Some(5);
        assert!(matches!(
            rtt.read(&mut driver, 0, &mut buf),
            Err(Error::DriverFault { code: 5, .. })
        ));
    }

    #[test]
    fn stop_failure_keeps_state() {
        let mut driver = FakeDriver::new();
        driver.state().lock().rtt_ready_after.insert(0, 0);
        let mut rtt = RttController::new();
        rtt.start(
            &mut driver,
            1,
            ControlBlock::Auto,
            &BUDGET,
            &RecordingDelay::new(),
        )
        .unwrap();

        driver.state().lock().rtt_stop_code = -1;
        assert!(rtt.stop(&mut driver).is_err());
        assert_eq!(rtt.state(), RttState::Running);
    }
}
