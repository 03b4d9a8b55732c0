//! The vendor's J-Link driver library, loaded at runtime.

use std::ffi::{c_char, c_int, c_void, CStr, CString, OsStr};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::LazyLock;

use libloading::Library;
use parking_lot::RwLock;

use super::{HandleSlot, JlinkDriver, RttCommand, RttStart, Sinks, WireProtocol};
use crate::Error;

/// File name of the driver library on this platform.
#[cfg(target_os = "linux")]
pub const LIBRARY_NAME: &str = "libjlinkarm.so";
#[cfg(target_os = "macos")]
pub const LIBRARY_NAME: &str = "libjlinkarm.dylib";
#[cfg(all(windows, target_pointer_width = "64"))]
pub const LIBRARY_NAME: &str = "JLink_x64.dll";
#[cfg(all(windows, target_pointer_width = "32"))]
pub const LIBRARY_NAME: &str = "JLinkARM.dll";
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub const LIBRARY_NAME: &str = "libjlinkarm.so";

/// The library holds a single handle per process, shared by every loaded copy.
static HANDLE: LazyLock<HandleSlot> = LazyLock::new(HandleSlot::new);

/// Sinks of the currently open handle. The library only accepts plain
/// function pointers, so the callbacks look them up here.
static SINKS: RwLock<Option<Sinks>> = parking_lot::const_rwlock(None);

type LogCallback = unsafe extern "C" fn(*const c_char);

unsafe extern "C" fn log_callback(message: *const c_char) {
    if let Some(message) = unsafe { message_from(message) } {
        let sinks = SINKS.read().clone();
        if let Some(sinks) = sinks {
            sinks.log(&message);
        }
    }
}

unsafe extern "C" fn error_callback(message: *const c_char) {
    if let Some(message) = unsafe { message_from(message) } {
        let sinks = SINKS.read().clone();
        if let Some(sinks) = sinks {
            sinks.error(&message);
        }
    }
}

/// # Safety
///
/// `message` must be null or point to a NUL terminated string.
unsafe fn message_from(message: *const c_char) -> Option<String> {
    if message.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned())
}

/// Entry points of the library.
struct Api {
    open_ex: unsafe extern "C" fn(Option<LogCallback>, Option<LogCallback>) -> *const c_char,
    is_open: unsafe extern "C" fn() -> c_char,
    tif_select: unsafe extern "C" fn(c_int) -> c_int,
    set_speed: unsafe extern "C" fn(u32),
    is_connected: unsafe extern "C" fn() -> c_char,
    connect: unsafe extern "C" fn() -> c_int,
    is_halted: unsafe extern "C" fn() -> c_char,
    halt: unsafe extern "C" fn() -> c_char,
    go: unsafe extern "C" fn(),
    clr_bp_ex: unsafe extern "C" fn(u32) -> c_int,
    exec_command: unsafe extern "C" fn(*const c_char, *mut c_char, c_int) -> c_int,
    has_error: unsafe extern "C" fn() -> c_int,
    close: unsafe extern "C" fn(),
    select_usb: unsafe extern "C" fn(c_int) -> c_char,
    select_ip: unsafe extern "C" fn(*const c_char, c_int) -> c_char,
    reset: unsafe extern "C" fn() -> c_int,
    set_reset_type: unsafe extern "C" fn(c_int) -> c_int,
    download_file: unsafe extern "C" fn(*const c_char, u32) -> c_int,
    rtt_control: unsafe extern "C" fn(u32, *mut c_void) -> c_int,
    rtt_read: unsafe extern "C" fn(u32, *mut c_char, u32) -> c_int,
}

macro_rules! symbol {
    ($library:expr, $name:literal) => {
        // SAFETY: the field type the symbol is assigned to matches the
        // library's declaration of it.
        *unsafe { $library.get(concat!($name, "\0").as_bytes()) }
            .map_err(Error::DriverUnavailable)?
    };
}

impl Api {
    fn resolve(library: &Library) -> Result<Self, Error> {
        Ok(Self {
            open_ex: symbol!(library, "JLINK_OpenEx"),
            is_open: symbol!(library, "JLINK_IsOpen"),
            tif_select: symbol!(library, "JLINK_TIF_Select"),
            set_speed: symbol!(library, "JLINK_SetSpeed"),
            is_connected: symbol!(library, "JLINK_IsConnected"),
            connect: symbol!(library, "JLINK_Connect"),
            is_halted: symbol!(library, "JLINK_IsHalted"),
            halt: symbol!(library, "JLINK_Halt"),
            go: symbol!(library, "JLINK_Go"),
            clr_bp_ex: symbol!(library, "JLINK_ClrBPEx"),
            exec_command: symbol!(library, "JLINK_ExecCommand"),
            has_error: symbol!(library, "JLINK_HasError"),
            close: symbol!(library, "JLINK_Close"),
            select_usb: symbol!(library, "JLINK_SelectUSB"),
            select_ip: symbol!(library, "JLINK_SelectIP"),
            reset: symbol!(library, "JLINK_Reset"),
            set_reset_type: symbol!(library, "JLINK_SetResetType"),
            download_file: symbol!(library, "JLINK_DownloadFile"),
            rtt_control: symbol!(library, "JLINK_RTTERMINAL_Control"),
            rtt_read: symbol!(library, "JLINK_RTTERMINAL_Read"),
        })
    }
}

/// A [`JlinkDriver`] backed by the vendor's shared library.
pub struct JlinkDll {
    api: Api,
    // Keeps the entry points in `api` valid.
    _library: Library,
}

impl fmt::Debug for JlinkDll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JlinkDll").finish_non_exhaustive()
    }
}

impl JlinkDll {
    /// Loads the library from the platform's default search path.
    pub fn load() -> Result<Self, Error> {
        Self::load_from(LIBRARY_NAME)
    }

    /// Loads the library from `path`.
    pub fn load_from(path: impl AsRef<OsStr>) -> Result<Self, Error> {
        let path = path.as_ref();
        tracing::debug!("Loading J-Link library from {:?}", path);

        // SAFETY: loading runs the library's initializers, which is what
        // using it requires anyway.
        let library = unsafe { Library::new(path) }.map_err(Error::DriverUnavailable)?;
        let api = Api::resolve(&library)?;

        Ok(Self {
            api,
            _library: library,
        })
    }
}

/// Widens a `char` result, which may be unsigned on some platforms.
fn signed(code: c_char) -> i8 {
    code as i8
}

impl JlinkDriver for JlinkDll {
    fn handle_slot(&self) -> HandleSlot {
        HandleSlot::clone(&HANDLE)
    }

    fn is_open(&mut self) -> bool {
        unsafe { (self.api.is_open)() != 0 }
    }

    fn open(&mut self, sinks: Sinks) -> Result<(), String> {
        *SINKS.write() = Some(sinks);

        let error = unsafe { (self.api.open_ex)(Some(log_callback), Some(error_callback)) };
        match unsafe { message_from(error) } {
            None => Ok(()),
            Some(message) => {
                *SINKS.write() = None;
                Err(message)
            }
        }
    }

    fn select_usb(&mut self, index: u32) -> i32 {
        let Ok(index) = c_int::try_from(index) else {
            return -1;
        };
        signed(unsafe { (self.api.select_usb)(index) }).into()
    }

    fn select_ip(&mut self, host: &str, port: u16) -> i32 {
        let Ok(host) = CString::new(host) else {
            return -1;
        };
        signed(unsafe { (self.api.select_ip)(host.as_ptr(), port.into()) }).into()
    }

    fn select_interface(&mut self, protocol: WireProtocol) -> i32 {
        unsafe { (self.api.tif_select)(protocol.interface_code()) }
    }

    fn set_speed(&mut self, khz: u32) {
        unsafe { (self.api.set_speed)(khz) }
    }

    fn is_connected(&mut self) -> i8 {
        signed(unsafe { (self.api.is_connected)() })
    }

    fn connect(&mut self) -> i32 {
        unsafe { (self.api.connect)() }
    }

    fn is_halted(&mut self) -> i8 {
        signed(unsafe { (self.api.is_halted)() })
    }

    fn halt(&mut self) {
        unsafe { (self.api.halt)() };
    }

    fn go(&mut self) {
        unsafe { (self.api.go)() }
    }

    fn clear_breakpoints(&mut self, handle: u32) -> i32 {
        unsafe { (self.api.clr_bp_ex)(handle) }
    }

    fn exec_command(&mut self, command: &str, error: &mut [u8]) -> i32 {
        let Ok(command) = CString::new(command) else {
            let message = b"command contains a NUL byte";
            let len = message.len().min(error.len());
            error[..len].copy_from_slice(&message[..len]);
            return len as i32;
        };

        let size = c_int::try_from(error.len()).unwrap_or(c_int::MAX);
        unsafe {
            (self.api.exec_command)(command.as_ptr(), error.as_mut_ptr().cast(), size)
        }
    }

    fn has_error(&mut self) -> i32 {
        unsafe { (self.api.has_error)() }
    }

    fn close(&mut self) {
        unsafe { (self.api.close)() };
        *SINKS.write() = None;
    }

    fn reset(&mut self) -> i32 {
        unsafe { (self.api.reset)() }
    }

    fn set_reset_type(&mut self, kind: u8) -> i32 {
        unsafe { (self.api.set_reset_type)(kind.into()) }
    }

    fn download_file(&mut self, path: &Path, address: u32) -> i32 {
        let Ok(path) = CString::new(path.as_os_str().as_encoded_bytes()) else {
            return -1;
        };
        unsafe { (self.api.download_file)(path.as_ptr(), address) }
    }

    fn rtt_control(&mut self, command: RttCommand<'_>) -> i32 {
        let code = command.code();
        match command {
            RttCommand::Start { address } => {
                let mut start = RttStart::new(address);
                unsafe { (self.api.rtt_control)(code, ptr::from_mut(&mut start).cast()) }
            }
            RttCommand::Stop => unsafe { (self.api.rtt_control)(code, ptr::null_mut()) },
            RttCommand::GetStatus(status) => unsafe {
                (self.api.rtt_control)(code, ptr::from_mut(status).cast())
            },
        }
    }

    fn rtt_read(&mut self, buffer_index: u32, data: &mut [u8]) -> i32 {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        unsafe { (self.api.rtt_read)(buffer_index, data.as_mut_ptr().cast(), size) }
    }
}
