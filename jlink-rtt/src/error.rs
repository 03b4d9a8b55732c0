use std::path::PathBuf;

use crate::config::Transport;
use crate::driver::WireProtocol;

/// Error type for all session, command and RTT operations.
///
/// Every variant carries the context needed to diagnose the failure without
/// re-running: the operation, the raw driver code and, for commands, the
/// command text together with the message the driver reported.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// The J-Link driver handle is already held by another session.
    AlreadyOpen,

    /// The J-Link driver could not be opened: {0}
    OpenFailed(String),

    /// Selecting transport {transport} failed with code {code}.
    TransportSelectFailed { transport: Transport, code: i32 },

    /// Selecting wire protocol {protocol} failed with code {code}.
    ProtocolSelectFailed { protocol: WireProtocol, code: i32 },

    /// Command {command:?} failed: {message}
    CommandFailed { command: String, message: String },

    /// Connecting to the target failed with code {0}.
    ConnectFailed(i32),

    /// The target did not report a connection after {0} attempts.
    ConnectTimeout(usize),

    /// Driver operation `{operation}` failed with code {code}.
    DriverFault { operation: &'static str, code: i32 },

    /// The driver reported a pending error (code {0}).
    GlobalError(i32),

    /// RTT did not report {up_buffers} running up-buffers within {attempts} attempts.
    #[ignore_extra_doc_attributes]
    ///
    /// When a control block address was given, this is only returned after the
    /// auto-discovery fallback timed out as well.
    RttTimeout { up_buffers: u32, attempts: usize },

    /// The target is not connected.
    NotConnected,

    /// Invalid reset type {0} (valid: 0=Normal, 1=Core, 2=ResetPin).
    InvalidResetType(u8),

    /// The session has already been closed.
    Closed,

    /// The path {0:?} cannot be passed to the driver.
    InvalidPath(PathBuf),

    /// The J-Link driver library could not be loaded.
    DriverUnavailable(#[source] libloading::Error),
}

impl Error {
    /// Returns true if the error was raised by a timed out polling loop.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout(_) | Error::RttTimeout { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_failure_carries_command_and_message() {
        let error = Error::CommandFailed {
            command: "device = nRF52840_xxAA".into(),
            message: "Unknown device".into(),
        };
        assert_eq!(
            error.to_string(),
            "Command \"device = nRF52840_xxAA\" failed: Unknown device"
        );
    }

    #[test]
    fn driver_fault_names_the_operation() {
        let error = Error::DriverFault {
            operation: "RTT read",
            code: -3,
        };
        assert_eq!(
            error.to_string(),
            "Driver operation `RTT read` failed with code -3."
        );
    }

    #[test]
    fn transport_failure_shows_the_transport() {
        let error = Error::TransportSelectFailed {
            transport: Transport::Ip {
                host: "10.0.0.7".into(),
                port: 19020,
            },
            code: 1,
        };
        assert_eq!(
            error.to_string(),
            "Selecting transport IP 10.0.0.7:19020 failed with code 1."
        );
    }
}
