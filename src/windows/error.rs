//! Win32 error translation

use std::ptr;
use winapi::{
    shared::{
        minwindef::DWORD,
        ntdef::MAKELANGID,
        winerror::{ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND},
    },
    um::{
        errhandlingapi::GetLastError,
        winbase::{FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS},
        winnt::{LANG_SYSTEM_DEFAULT, SUBLANG_SYS_DEFAULT, WCHAR},
    },
};

use crate::SerialError;

#[macro_export]
/// Runs a Win32 call that reports failure as zero and translates a
/// failure into the calling thread's last OS error
macro_rules! return_win_op {
    ($op:expr) => {
        match unsafe { $op } {
            0 => Err($crate::windows::error::get_win_error()),
            _ => Ok(()),
        }
    };
}

impl From<SerialError> for std::io::Error {
    fn from(e: SerialError) -> Self {
        match e {
            SerialError::PortBusy | SerialError::PortNotFound | SerialError::InvalidPort => {
                std::io::Error::new(std::io::ErrorKind::NotConnected, e)
            }
            SerialError::OsError { code, .. } => std::io::Error::from_raw_os_error(code as i32),
            SerialError::LibraryError(..) => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

/// Raw error code for the calling thread's last failed Win32 call
pub(crate) fn last_error_code() -> u32 {
    unsafe { GetLastError() }
}

/// Maps an open-time failure onto the port taxonomy. Anything outside
/// the two well-known open failures keeps its OS error detail.
pub(crate) fn map_open_error() -> SerialError {
    match last_error_code() {
        ERROR_ACCESS_DENIED => SerialError::PortBusy,
        ERROR_FILE_NOT_FOUND => SerialError::PortNotFound,
        _ => get_win_error(),
    }
}

pub(crate) fn get_win_error() -> SerialError {
    os_error_from_code(unsafe { GetLastError() })
}

/// Builds an [SerialError::OsError] for a code captured earlier,
/// without re-reading the thread's last-error slot
pub(crate) fn os_error_from_code(e: DWORD) -> SerialError {
    let language_id = MAKELANGID(LANG_SYSTEM_DEFAULT, SUBLANG_SYS_DEFAULT) as DWORD;
    let mut buf = [0 as WCHAR; 2048];

    unsafe {
        let res = FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            ptr::null_mut(),
            e as DWORD,
            language_id as DWORD,
            buf.as_mut_ptr(),
            buf.len() as DWORD,
            ptr::null_mut(),
        );
        if res == 0 {
            let fmt_error = GetLastError();
            return SerialError::OsError {
                code: e,
                desc: format!("Unknown. FormatMessageW() failed with error {}", fmt_error),
            };
        }

        let b = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        match String::from_utf16(&buf[..b]) {
            Ok(msg) => SerialError::OsError {
                code: e,
                desc: msg.trim_end().to_string(),
            },
            Err(..) => SerialError::OsError {
                code: e,
                desc: "Unknown, FormatMessageW() returned invalid UTF-16 string".to_string(),
            },
        }
    }
}
