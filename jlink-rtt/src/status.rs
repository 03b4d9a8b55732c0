//! Translation of raw driver codes into typed results.

use crate::Error;

/// Connection state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The driver has not established the connection yet.
    Pending,
    Connected,
    /// The driver returned a code outside of the documented range.
    Invalid(i8),
}

impl From<i8> for ConnectionState {
    fn from(code: i8) -> Self {
        match code {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Connected,
            other => ConnectionState::Invalid(other),
        }
    }
}

/// Reset strategies understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetType {
    /// Core and peripherals, the driver's default.
    Normal = 0,
    /// Core only.
    Core = 1,
    /// Toggle the reset pin.
    ResetPin = 2,
}

impl TryFrom<u8> for ResetType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResetType::Normal),
            1 => Ok(ResetType::Core),
            2 => Ok(ResetType::ResetPin),
            other => Err(Error::InvalidResetType(other)),
        }
    }
}

/// Fails with [`Error::DriverFault`] if `code` is negative, returns it otherwise.
pub(crate) fn non_negative(operation: &'static str, code: i32) -> Result<u32, Error> {
    u32::try_from(code).map_err(|_| Error::DriverFault { operation, code })
}

/// Interprets the driver's halt state query.
pub(crate) fn halted(code: i8) -> Result<bool, Error> {
    if code < 0 {
        return Err(Error::DriverFault {
            operation: "halt state",
            code: code.into(),
        });
    }
    Ok(code > 0)
}

/// Fails with [`Error::GlobalError`] if the driver reports a pending error.
pub(crate) fn global_error(code: i32) -> Result<(), Error> {
    match code {
        0 => Ok(()),
        code => Err(Error::GlobalError(code)),
    }
}
