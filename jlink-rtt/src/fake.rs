#![allow(missing_docs)] // Don't require docs for test code
//! A scriptable in-memory driver for tests and dry runs.
//!
//! [`FakeDriver`] records every call it receives and answers from a
//! [`FakeState`] that tests set up beforehand. The state is shared, so it can
//! still be inspected after the driver was moved into a
//! [`Session`](crate::Session).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::driver::{Delay, HandleSlot, JlinkDriver, RttCommand, Sinks, WireProtocol};

/// A driver call, as recorded by [`FakeDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    IsOpen,
    Open,
    SelectUsb(u32),
    SelectIp(String, u16),
    SelectInterface(WireProtocol),
    SetSpeed(u32),
    IsConnected,
    Connect,
    IsHalted,
    Halt,
    Go,
    ClearBreakpoints(u32),
    ExecCommand(String),
    HasError,
    Close,
    Reset,
    SetResetType(u8),
    DownloadFile(PathBuf, u32),
    RttStart(u32),
    RttStop,
    RttGetStatus,
    RttRead(u32, usize),
}

/// Scripted answers and the call log of a [`FakeDriver`].
#[derive(Debug)]
pub struct FakeState {
    pub calls: Vec<Call>,

    /// Whether the fake holds an open handle.
    pub open: bool,
    pub open_error: Option<String>,
    pub select_usb_code: i32,
    pub select_ip_code: i32,
    pub select_interface_code: i32,

    /// Answers to connection state queries, front first. Once empty,
    /// `connected` is reported.
    pub connection_states: VecDeque<i8>,
    pub connected: i8,
    pub connect_code: i32,
    /// Answers to halt state queries.
    pub halted: i8,

    /// Commands that fail, with the driver code and the message bytes.
    pub failing_commands: HashMap<String, (i32, Vec<u8>)>,
    /// Answers to pending error queries, front first. Once empty,
    /// `has_error_code` is reported.
    pub has_error_codes: VecDeque<i32>,
    pub has_error_code: i32,

    pub reset_code: i32,
    pub set_reset_type_code: i32,
    pub download_code: i32,
    pub clear_breakpoints_code: i32,

    pub rtt_start_code: i32,
    pub rtt_stop_code: i32,
    pub rtt_status_code: i32,
    /// Number of status queries after a start with the given control block
    /// address before RTT reports running. Addresses without an entry never
    /// come up.
    pub rtt_ready_after: HashMap<u32, usize>,
    /// Up-buffers reported once running.
    pub rtt_up_buffers: i32,
    pub rtt_down_buffers: i32,
    /// Overrides the result of every RTT read.
    pub rtt_read_code: Option<i32>,
    pub rtt_data: HashMap<u32, VecDeque<u8>>,

    rtt_address: Option<u32>,
    rtt_polls: usize,
    sinks: Option<Sinks>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            open: false,
            open_error: None,
            select_usb_code: 0,
            select_ip_code: 0,
            select_interface_code: 0,
            connection_states: VecDeque::new(),
            connected: 1,
            connect_code: 0,
            halted: 0,
            failing_commands: HashMap::new(),
            has_error_codes: VecDeque::new(),
            has_error_code: 0,
            reset_code: 0,
            set_reset_type_code: 0,
            download_code: 0,
            clear_breakpoints_code: 0,
            rtt_start_code: 0,
            rtt_stop_code: 0,
            rtt_status_code: 0,
            rtt_ready_after: HashMap::new(),
            rtt_up_buffers: 1,
            rtt_down_buffers: 1,
            rtt_read_code: None,
            rtt_data: HashMap::new(),
            rtt_address: None,
            rtt_polls: 0,
            sinks: None,
        }
    }
}

impl FakeState {
    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    /// Position of the first recorded call equal to `call`.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls.iter().position(|c| c == call)
    }

    /// Makes `command` fail with `code`, leaving `message` in the error buffer.
    pub fn fail_command(&mut self, command: &str, code: i32, message: &[u8]) {
        self.failing_commands
            .insert(command.to_owned(), (code, message.to_vec()));
    }

    /// Queues bytes for the target to send on up-buffer `buffer_index`.
    pub fn push_rtt_data(&mut self, buffer_index: u32, data: &[u8]) {
        self.rtt_data
            .entry(buffer_index)
            .or_default()
            .extend(data.iter().copied());
    }

    /// The sinks registered by the last successful open.
    pub fn sinks(&self) -> Option<Sinks> {
        self.sinks.clone()
    }
}

/// A [`JlinkDriver`] answering from a shared [`FakeState`].
#[derive(Debug, Clone)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
    slot: HandleSlot,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    /// Creates a fake with its own handle slot.
    pub fn new() -> Self {
        Self::with_slot(HandleSlot::new())
    }

    /// Creates a fake sharing `slot` with other drivers.
    pub fn with_slot(slot: HandleSlot) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            slot,
        }
    }

    pub fn state(&self) -> Arc<Mutex<FakeState>> {
        self.state.clone()
    }

    fn record(&self, call: Call) -> parking_lot::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }
}

impl JlinkDriver for FakeDriver {
    fn handle_slot(&self) -> HandleSlot {
        self.slot.clone()
    }

    fn is_open(&mut self) -> bool {
        self.record(Call::IsOpen).open
    }

    fn open(&mut self, sinks: Sinks) -> Result<(), String> {
        let mut state = self.record(Call::Open);
        if let Some(error) = state.open_error.clone() {
            return Err(error);
        }

        sinks.log("fake driver opened");
        state.sinks = Some(sinks);
        state.open = true;
        Ok(())
    }

    fn select_usb(&mut self, index: u32) -> i32 {
        self.record(Call::SelectUsb(index)).select_usb_code
    }

    fn select_ip(&mut self, host: &str, port: u16) -> i32 {
        self.record(Call::SelectIp(host.to_owned(), port)).select_ip_code
    }

    fn select_interface(&mut self, protocol: WireProtocol) -> i32 {
        self.record(Call::SelectInterface(protocol)).select_interface_code
    }

    fn set_speed(&mut self, khz: u32) {
        drop(self.record(Call::SetSpeed(khz)));
    }

    fn is_connected(&mut self) -> i8 {
        let mut state = self.record(Call::IsConnected);
        let connected = state.connected;
        state.connection_states.pop_front().unwrap_or(connected)
    }

    fn connect(&mut self) -> i32 {
        self.record(Call::Connect).connect_code
    }

    fn is_halted(&mut self) -> i8 {
        self.record(Call::IsHalted).halted
    }

    fn halt(&mut self) {
        self.record(Call::Halt).halted = 1;
    }

    fn go(&mut self) {
        self.record(Call::Go).halted = 0;
    }

    fn clear_breakpoints(&mut self, handle: u32) -> i32 {
        self.record(Call::ClearBreakpoints(handle)).clear_breakpoints_code
    }

    fn exec_command(&mut self, command: &str, error: &mut [u8]) -> i32 {
        let state = self.record(Call::ExecCommand(command.to_owned()));
        match state.failing_commands.get(command) {
            Some((code, message)) => {
                let len = message.len().min(error.len());
                error[..len].copy_from_slice(&message[..len]);
                *code
            }
            None => 0,
        }
    }

    fn has_error(&mut self) -> i32 {
        let mut state = self.record(Call::HasError);
        let code = state.has_error_code;
        state.has_error_codes.pop_front().unwrap_or(code)
    }

    fn close(&mut self) {
        let mut state = self.record(Call::Close);
        state.open = false;
        state.sinks = None;
    }

    fn reset(&mut self) -> i32 {
        self.record(Call::Reset).reset_code
    }

    fn set_reset_type(&mut self, kind: u8) -> i32 {
        self.record(Call::SetResetType(kind)).set_reset_type_code
    }

    fn download_file(&mut self, path: &Path, address: u32) -> i32 {
        self.record(Call::DownloadFile(path.to_owned(), address)).download_code
    }

    fn rtt_control(&mut self, command: RttCommand<'_>) -> i32 {
        match command {
            RttCommand::Start { address } => {
                let mut state = self.record(Call::RttStart(address));
                if state.rtt_start_code >= 0 {
                    state.rtt_address = Some(address);
                    state.rtt_polls = 0;
                }
                state.rtt_start_code
            }
            RttCommand::Stop => {
                let mut state = self.record(Call::RttStop);
                if state.rtt_stop_code >= 0 {
                    state.rtt_address = None;
                }
                state.rtt_stop_code
            }
            RttCommand::GetStatus(status) => {
                let mut state = self.record(Call::RttGetStatus);
                if state.rtt_status_code < 0 {
                    return state.rtt_status_code;
                }

                let running = match state.rtt_address {
                    Some(address) => state
                        .rtt_ready_after
                        .get(&address)
                        .is_some_and(|&after| state.rtt_polls >= after),
                    None => false,
                };
                state.rtt_polls += 1;

                status.is_running = i32::from(running);
                if running {
                    status.num_up_buffers = state.rtt_up_buffers;
                    status.num_down_buffers = state.rtt_down_buffers;
                }
                status.num_bytes_transferred = state
                    .rtt_data
                    .values()
                    .map(|data| data.len() as u32)
                    .sum();
                state.rtt_status_code
            }
        }
    }

    fn rtt_read(&mut self, buffer_index: u32, data: &mut [u8]) -> i32 {
        let mut state = self.record(Call::RttRead(buffer_index, data.len()));
        if let Some(code) = state.rtt_read_code {
            return code;
        }

        let Some(pending) = state.rtt_data.get_mut(&buffer_index) else {
            return 0;
        };
        let count = pending.len().min(data.len());
        for (slot, byte) in data.iter_mut().zip(pending.drain(..count)) {
            *slot = byte;
        }
        count as i32
    }
}

/// A [`Delay`] that records requested waits instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waits requested.
    pub fn count(&self) -> usize {
        self.waits.lock().len()
    }

    /// Sum of all requested waits.
    pub fn total(&self) -> Duration {
        self.waits.lock().iter().sum()
    }
}

impl Delay for RecordingDelay {
    fn delay(&self, duration: Duration) {
        self.waits.lock().push(duration);
    }
}
