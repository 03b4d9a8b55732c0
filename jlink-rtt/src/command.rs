//! Textual driver commands.

use crate::driver::JlinkDriver;
use crate::Error;

/// Size of the buffer the driver writes command error messages into.
pub const ERROR_BUFFER_SIZE: usize = 1024;

/// Commands issued before connecting, keeping the driver from opening
/// dialogs or prompting for firmware updates. Order matters.
pub const PRE_CONNECT: [&str; 7] = [
    "DisableAutoUpdateFW",
    "SilentUpdateFW",
    "SuppressInfoUpdateFW",
    "HideDeviceSelection 1",
    "SuppressControlPanel",
    "DisableInfoWinFlashDL",
    "DisableInfoWinFlashBPs",
];

/// Command issued once connected, switching the driver to non-interactive mode.
pub const POST_CONNECT: &str = "SetBatchMode 1";

/// The command selecting the target device.
pub fn select_device(device: &str) -> String {
    format!("device = {device}")
}

/// Executes a single command on `driver`.
///
/// This does not tear anything down on failure; see
/// [`Session::exec_command`](crate::Session::exec_command) for that.
pub(crate) fn execute(driver: &mut dyn JlinkDriver, command: &str) -> Result<(), Error> {
    tracing::debug!("Executing command {:?}", command);

    let mut buffer = [0u8; ERROR_BUFFER_SIZE];
    let code = driver.exec_command(command, &mut buffer);

    if code == 0 {
        return Ok(());
    }

    let message = error_message(code, &buffer);
    tracing::debug!("Command {:?} failed with {}: {:?}", command, code, message);

    Err(Error::CommandFailed {
        command: command.to_owned(),
        message,
    })
}

/// Decodes the error message of a failed command.
///
/// Negative codes carry no message. For a positive `code` the driver wrote a
/// message into `buffer`: it ends at the first NUL, or after `code` bytes if
/// the driver did not terminate it.
fn error_message(code: i32, buffer: &[u8]) -> String {
    let Ok(len) = usize::try_from(code) else {
        return String::new();
    };
    if len == 0 {
        return String::new();
    }

    let message = match buffer.iter().position(|&b| b == 0) {
        Some(end) => &buffer[..end],
        None => &buffer[..len.min(buffer.len())],
    };

    String::from_utf8_lossy(message).trim_end().to_owned()
}
