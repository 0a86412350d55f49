//! Overlapped operation protocol.
//!
//! Every blocking port operation (read, write, event wait) follows
//! the same shape: allocate a manual-reset completion event, issue the
//! Win32 call, and either take its synchronous result or block on the
//! event until the driver signals completion, then fetch the final
//! transfer count. [OverlappedOp] owns the completion event for the
//! duration of one call; its `Drop` releases the event on every exit
//! path, so no outcome (hard failure at issue time, wait failure,
//! result-query failure, or success) can leak the handle.

use winapi::shared::minwindef::{BOOL, DWORD};
use winapi::shared::winerror::ERROR_IO_PENDING;
use winapi::um::handleapi::CloseHandle;
use winapi::um::ioapiset::GetOverlappedResult;
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::synchapi::{CreateEventW, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

use super::error::{get_win_error, last_error_code};
use crate::{return_win_op, SerialResult};

pub(crate) struct OverlappedOp {
    raw: OVERLAPPED,
}

impl OverlappedOp {
    /// Allocates the completion event (manual reset, initially
    /// unsignaled)
    pub fn new() -> SerialResult<Self> {
        let mut raw: OVERLAPPED = unsafe { std::mem::zeroed() };
        raw.hEvent = unsafe { CreateEventW(std::ptr::null_mut(), 1, 0, std::ptr::null_mut()) };
        if raw.hEvent.is_null() {
            return Err(get_win_error());
        }
        Ok(Self { raw })
    }

    /// Pointer handed to the issuing Win32 call
    pub fn as_mut_ptr(&mut self) -> *mut OVERLAPPED {
        &mut self.raw
    }

    /// Resolves an issued operation.
    ///
    /// `issued` is the return value of the issuing call and
    /// `sync_count` the transfer count it produced. A nonzero `issued`
    /// means the operation completed synchronously. Zero with
    /// ERROR_IO_PENDING means the driver accepted it; the calling
    /// thread then blocks on the completion event with no timeout
    /// (cancelling the port's pending IO from another thread aborts
    /// the operation, which surfaces here as an error). Any other
    /// issue-time error is a hard failure.
    pub fn finish(&mut self, handle: HANDLE, issued: BOOL, sync_count: DWORD) -> SerialResult<DWORD> {
        if issued != 0 {
            return Ok(sync_count);
        }
        if last_error_code() != ERROR_IO_PENDING {
            return Err(get_win_error());
        }
        if unsafe { WaitForSingleObject(self.raw.hEvent, INFINITE) } != WAIT_OBJECT_0 {
            return Err(get_win_error());
        }
        let mut transferred: DWORD = 0;
        return_win_op!(GetOverlappedResult(
            handle,
            &mut self.raw,
            &mut transferred,
            0
        ))?;
        Ok(transferred)
    }
}

impl Drop for OverlappedOp {
    fn drop(&mut self) {
        if !self.raw.hEvent.is_null() {
            unsafe { CloseHandle(self.raw.hEvent) };
        }
    }
}
