use std::time::Duration;

use jlink_rtt::fake::{Call, FakeDriver, RecordingDelay};
use jlink_rtt::{Error, RttState, Session, SessionConfig, Transport};
use pretty_assertions::assert_eq;

fn open_with(driver: &FakeDriver, delay: &RecordingDelay, close_on_error: bool) -> Session {
    let mut config = SessionConfig::new("STM32F407VG", 4000, Transport::usb());
    config.close_on_error = close_on_error;

    Session::builder(driver.clone())
        .config(config)
        .delay(delay.clone())
        .open()
        .unwrap()
}

fn open(driver: &FakeDriver, delay: &RecordingDelay) -> Session {
    open_with(driver, delay, true)
}

/// RTT related calls made since the session was opened.
fn rtt_calls(driver: &FakeDriver) -> Vec<Call> {
    driver
        .state()
        .lock()
        .calls
        .iter()
        .filter(|c| matches!(c, Call::RttStart(_) | Call::RttStop | Call::Close))
        .cloned()
        .collect()
}

fn status_polls(driver: &FakeDriver) -> usize {
    driver.state().lock().count(|c| *c == Call::RttGetStatus)
}

#[test]
fn starts_with_auto_discovery() {
    let driver = FakeDriver::new();
    {
        let state = driver.state();
        let mut state = state.lock();
        state.rtt_ready_after.insert(0, 4);
        state.rtt_up_buffers = 3;
    }
    let delay = RecordingDelay::new();
    let mut session = open(&driver, &delay);

    session.start_rtt(3, 0).unwrap();

    assert_eq!(session.rtt_state(), RttState::Running);
    assert_eq!(rtt_calls(&driver), [Call::RttStart(0)]);
    assert_eq!(status_polls(&driver), 5);
    assert_eq!(delay.total(), Duration::from_millis(40));
}

#[test]
fn stale_address_falls_back_to_auto_discovery() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0, 0);
    let mut session = open(&driver, &RecordingDelay::new());

    session.start_rtt(1, 0x2000_0000).unwrap();

    assert_eq!(session.rtt_state(), RttState::Running);
    assert_eq!(
        rtt_calls(&driver),
        [Call::RttStart(0x2000_0000), Call::RttStop, Call::RttStart(0)]
    );
    assert_eq!(status_polls(&driver), 101);
}

#[test]
fn valid_address_needs_no_fallback() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0x2000_0400, 1);
    let mut session = open(&driver, &RecordingDelay::new());

    session.start_rtt(1, 0x2000_0400).unwrap();

    assert_eq!(rtt_calls(&driver), [Call::RttStart(0x2000_0400)]);
}

#[test]
fn times_out_after_fallback_fails_too() {
    let driver = FakeDriver::new();
    let delay = RecordingDelay::new();
    let mut session = open(&driver, &delay);

    let result = session.start_rtt(2, 0x2000_0000);

    assert!(matches!(
        result,
        Err(Error::RttTimeout {
            up_buffers: 2,
            attempts: 200
        })
    ));
    assert_eq!(status_polls(&driver), 200);
    assert_eq!(delay.total(), Duration::from_millis(10) * 198);
    assert_eq!(
        rtt_calls(&driver),
        [
            Call::RttStart(0x2000_0000),
            Call::RttStop,
            Call::RttStart(0),
            Call::RttStop
        ]
    );
    assert_eq!(session.rtt_state(), RttState::Stopped);
    assert!(session.is_open());
}

#[test]
fn auto_discovery_timeout_is_not_retried() {
    let driver = FakeDriver::new();
    let mut session = open(&driver, &RecordingDelay::new());

    assert!(matches!(
        session.start_rtt(1, 0),
        Err(Error::RttTimeout { attempts: 100, .. })
    ));
    assert_eq!(status_polls(&driver), 100);
    assert_eq!(rtt_calls(&driver), [Call::RttStart(0), Call::RttStop]);
}

#[test]
fn wrong_buffer_count_times_out() {
    let driver = FakeDriver::new();
    {
        let state = driver.state();
        let mut state = state.lock();
        state.rtt_ready_after.insert(0, 0);
        state.rtt_up_buffers = 2;
    }
    let mut session = open(&driver, &RecordingDelay::new());

    let error = session.start_rtt(3, 0).unwrap_err();

    assert!(error.is_timeout());
}

#[test]
fn rejected_start_leaves_rtt_stopped() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_start_code = -1;
    let mut session = open(&driver, &RecordingDelay::new());

    assert!(matches!(
        session.start_rtt(1, 0),
        Err(Error::DriverFault {
            operation: "RTT start",
            code: -1
        })
    ));
    assert_eq!(session.rtt_state(), RttState::Stopped);
    assert_eq!(rtt_calls(&driver), [Call::RttStart(0)]);
    assert!(session.is_open());
}

#[test]
fn pending_error_while_polling_closes_the_session() {
    let driver = FakeDriver::new();
    let mut session = open(&driver, &RecordingDelay::new());
    driver.state().lock().has_error_code = -1;

    assert!(matches!(
        session.start_rtt(1, 0x2000_0000),
        Err(Error::GlobalError(-1))
    ));
    assert!(!session.is_open());
    assert_eq!(
        rtt_calls(&driver),
        [Call::RttStart(0x2000_0000), Call::RttStop, Call::Close]
    );
    assert!(matches!(session.rtt_read(0, &mut [0; 8]), Err(Error::Closed)));
}

#[test]
fn pending_error_while_polling_only_stops_rtt_when_configured() {
    let driver = FakeDriver::new();
    let mut session = open_with(&driver, &RecordingDelay::new(), false);
    driver.state().lock().has_error_code = -1;

    assert!(matches!(
        session.start_rtt(1, 0),
        Err(Error::GlobalError(-1))
    ));
    assert!(session.is_open());
    assert_eq!(session.rtt_state(), RttState::Stopped);
    assert_eq!(rtt_calls(&driver), [Call::RttStart(0), Call::RttStop]);
}

#[test]
fn reads_drain_the_up_buffer() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0, 0);
    let mut session = open(&driver, &RecordingDelay::new());
    session.start_rtt(1, 0).unwrap();

    driver.state().lock().push_rtt_data(0, b"Hello, world!\n");

    let mut buf = [0u8; 8];
    assert_eq!(session.rtt_read(0, &mut buf).unwrap(), b"Hello, w");
    assert_eq!(session.rtt_read(0, &mut buf).unwrap(), b"orld!\n");
    assert_eq!(session.rtt_read(0, &mut buf).unwrap(), b"");
    assert_eq!(session.rtt_read(1, &mut buf).unwrap(), b"");
}

#[test]
fn read_into_empty_buffer_returns_nothing() {
    let driver = FakeDriver::new();
    driver.state().lock().push_rtt_data(0, b"data");
    let mut session = open(&driver, &RecordingDelay::new());

    assert!(session.rtt_read(0, &mut []).unwrap().is_empty());
    assert_eq!(driver.state().lock().rtt_data[&0].len(), 4);
}

#[test]
fn read_never_reports_more_than_the_buffer_holds() {
    let driver = FakeDriver::new();
    let mut session = open(&driver, &RecordingDelay::new());
    driver.state().lock().rtt_read_code = Some(16);

    assert!(matches!(
        session.rtt_read(0, &mut [0; 8]),
        Err(Error::DriverFault {
            operation: "RTT read",
            code: 16
        })
    ));
}

#[test]
fn status_snapshot() {
    let driver = FakeDriver::new();
    {
        let state = driver.state();
        let mut state = state.lock();
        state.rtt_ready_after.insert(0, 0);
        state.rtt_up_buffers = 3;
        state.rtt_down_buffers = 2;
    }
    let mut session = open(&driver, &RecordingDelay::new());
    session.start_rtt(3, 0).unwrap();

    let status = session.read_status().unwrap();
    assert!(status.is_running());
    assert_eq!(status.up_buffers(), 3);
    assert_eq!(status.down_buffers(), 2);

    driver.state().lock().rtt_status_code = -1;
    assert!(session.read_status().is_err());
}

#[test]
fn stop_rtt() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0, 0);
    let mut session = open(&driver, &RecordingDelay::new());
    session.start_rtt(1, 0).unwrap();

    session.stop_rtt().unwrap();

    assert_eq!(session.rtt_state(), RttState::Stopped);
    assert_eq!(rtt_calls(&driver), [Call::RttStart(0), Call::RttStop]);
}

#[test]
fn close_stops_rtt_first() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0, 0);
    let mut session = open(&driver, &RecordingDelay::new());
    session.start_rtt(1, 0).unwrap();

    session.close();

    assert_eq!(
        rtt_calls(&driver),
        [Call::RttStart(0), Call::RttStop, Call::Close]
    );
}

#[test]
fn drop_closes_even_if_stopping_rtt_fails() {
    let driver = FakeDriver::new();
    driver.state().lock().rtt_ready_after.insert(0, 0);
    let mut session = open(&driver, &RecordingDelay::new());
    session.start_rtt(1, 0).unwrap();
    driver.state().lock().rtt_stop_code = -1;

    drop(session);

    let state = driver.state();
    let state = state.lock();
    assert_eq!(state.calls.last(), Some(&Call::Close));
    assert_eq!(state.count(|c| *c == Call::RttStop), 1);
    assert!(!state.open);
}
