//! Windows COM port session layer.
//!
//! A [ComPort] owns one exclusively opened device handle. Every
//! operation runs on the calling thread and may block it; reads,
//! writes and event waits go through the overlapped completion
//! protocol, so a blocked operation can be failed from another thread
//! within bounded time: share the port (e.g. in an `Arc`) and call
//! [ComPort::cancel], which aborts the pending operation the same way
//! the OS does when the handle is closed underneath a wait. Nothing
//! here serializes concurrent use of one port from several threads;
//! the conventional pattern is one thread per open port.

use std::fmt::Debug;
use std::time::Duration;

use log::debug;

use winapi::shared::minwindef::{DWORD, LPVOID};
use winapi::um::commapi::{
    ClearCommBreak, ClearCommError, EscapeCommFunction, GetCommMask, GetCommModemStatus,
    GetCommState, PurgeComm, SetCommBreak, SetCommMask, SetCommState, SetCommTimeouts,
    WaitCommEvent,
};
use winapi::shared::winerror::ERROR_NOT_FOUND;
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::CancelIoEx;
use winapi::um::winbase::{
    CLRDTR, CLRRTS, COMMTIMEOUTS, COMSTAT, DCB, DTR_CONTROL_DISABLE, DTR_CONTROL_ENABLE,
    FILE_FLAG_OVERLAPPED, MS_CTS_ON, MS_DSR_ON, MS_RING_ON, MS_RLSD_ON, RTS_CONTROL_DISABLE,
    RTS_CONTROL_ENABLE, RTS_CONTROL_HANDSHAKE, SETDTR, SETRTS,
};
use winapi::um::winnt::{FILE_ATTRIBUTE_NORMAL, GENERIC_READ, GENERIC_WRITE, HANDLE};

use self::error::{get_win_error, last_error_code, map_open_error, os_error_from_code};
use self::overlapped::OverlappedOp;
use crate::events::{decode_events, EventMask, PortEvent, QueueStatus, StatusProbe};
use crate::{
    return_win_op, ByteSize, FlowControl, LinesStatus, Parity, PurgeFlags, SerialError,
    SerialResult, StopBits,
};

pub mod enumerate;
pub(crate) mod error;
mod overlapped;

/// An exclusively opened Windows COM port
pub struct ComPort {
    handle: HANDLE,
    path: String,
}

impl Debug for ComPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComPort").field("path", &self.path).finish()
    }
}

// The handle is a kernel object reference; moving or sharing it across
// threads is allowed by the OS, serializing operations on it is the
// caller's responsibility.
unsafe impl Send for ComPort {}
unsafe impl Sync for ComPort {}

impl ComPort {
    /// Opens a port by its logical name (e.g. `COM3`) with exclusive
    /// read/write access and overlapped IO.
    ///
    /// The name is mapped into the device namespace with the fixed
    /// `\\.\` prefix. After opening, the device must answer a comm
    /// state read; one that does not is closed again and reported as
    /// [SerialError::InvalidPort]. A port held by another process is
    /// [SerialError::PortBusy], a missing device
    /// [SerialError::PortNotFound].
    pub fn open(path: &str) -> SerialResult<Self> {
        let mut name = Vec::<u16>::with_capacity(4 + path.len() + 1);
        name.extend(r"\\.\".encode_utf16());
        name.extend(path.encode_utf16());
        name.push(0);

        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                std::ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(map_open_error());
        }

        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        if unsafe { GetCommState(handle, &mut dcb) } == 0 {
            // Close before reporting, the handle must not leak
            unsafe { CloseHandle(handle) };
            return Err(SerialError::InvalidPort);
        }

        debug!("opened port {path}");
        Ok(Self {
            handle,
            path: path.to_string(),
        })
    }

    /// Closes the port, reporting whether the OS released the handle.
    /// Dropping a port closes it as well, without the report.
    pub fn close(mut self) -> SerialResult<()> {
        debug!("closing port {}", self.path);
        let res = return_win_op!(CloseHandle(self.handle));
        self.handle = INVALID_HANDLE_VALUE;
        res
    }

    /// Logical name this port was opened with
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Applies line parameters and RTS/DTR states in one comm state
    /// write.
    ///
    /// The current control block is read, the listed fields are
    /// overwritten and the block is written back, so unrelated fields
    /// survive. Protocol fields that a previous session may have left
    /// active (hardware and software flow control, error/null byte
    /// replacement) are forced back to conservative defaults because
    /// flow control is configured separately through
    /// [set_flow_control](Self::set_flow_control). On success all
    /// driver-level timeouts are cleared as well; a timeout inherited
    /// from another process would make overlapped operations return
    /// early. If that last step fails the call reports failure even
    /// though the control block was already written.
    pub fn set_params(
        &mut self,
        baud_rate: u32,
        byte_size: ByteSize,
        stop_bits: StopBits,
        parity: Parity,
        set_rts: bool,
        set_dtr: bool,
    ) -> SerialResult<()> {
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        return_win_op!(GetCommState(self.handle, &mut dcb))?;
        apply_params(
            &mut dcb, baud_rate, byte_size, stop_bits, parity, set_rts, set_dtr,
        );
        return_win_op!(SetCommState(self.handle, &mut dcb))?;

        debug!(
            "port {} configured: {} baud, {} data bits, parity {:?}, stop bits {:?}",
            self.path,
            baud_rate,
            byte_size.bits(),
            parity,
            stop_bits
        );

        // All-zero timeouts: operations resolve through the overlapped
        // wait, never through a driver timer
        let mut timeouts: COMMTIMEOUTS = unsafe { std::mem::zeroed() };
        return_win_op!(SetCommTimeouts(self.handle, &mut timeouts))
    }

    /// Applies a flow control mode.
    ///
    /// [FlowControl::NONE] disables every handshake and forces RTS
    /// back to plain enabled.
    pub fn set_flow_control(&mut self, mode: FlowControl) -> SerialResult<()> {
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        return_win_op!(GetCommState(self.handle, &mut dcb))?;
        apply_flow_control(&mut dcb, mode);
        return_win_op!(SetCommState(self.handle, &mut dcb))
    }

    /// Reads the flow control mode back from the device.
    ///
    /// Each mask bit is reconstructed from its own control block
    /// field; a bit is absent when the field is not in its active
    /// state.
    pub fn flow_control(&self) -> SerialResult<FlowControl> {
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        return_win_op!(GetCommState(self.handle, &mut dcb))?;
        Ok(flow_control_from_dcb(&dcb))
    }

    /// Fails every read, write and event wait currently pending on
    /// this port.
    ///
    /// Takes a shared reference, so a port wrapped in an
    /// [Arc](std::sync::Arc) can be unblocked from another thread:
    /// the pending overlapped operation completes with an
    /// operation-aborted error within bounded time and the blocked
    /// call returns that error. Cancelling a port with nothing
    /// pending succeeds and does nothing. The port stays open and
    /// usable afterwards.
    pub fn cancel(&self) -> SerialResult<()> {
        if unsafe { CancelIoEx(self.handle, std::ptr::null_mut()) } == 0 {
            // Nothing was pending
            if last_error_code() == ERROR_NOT_FOUND {
                return Ok(());
            }
            return Err(get_win_error());
        }
        Ok(())
    }

    /// Drives the RTS line directly, bypassing the control block
    pub fn set_rts(&mut self, enabled: bool) -> SerialResult<()> {
        return_win_op!(match enabled {
            true => EscapeCommFunction(self.handle, SETRTS),
            false => EscapeCommFunction(self.handle, CLRRTS),
        })
    }

    /// Drives the DTR line directly, bypassing the control block
    pub fn set_dtr(&mut self, enabled: bool) -> SerialResult<()> {
        return_win_op!(match enabled {
            true => EscapeCommFunction(self.handle, SETDTR),
            false => EscapeCommFunction(self.handle, CLRDTR),
        })
    }

    /// Aborts outstanding transfers and/or discards buffered data
    pub fn purge(&mut self, flags: PurgeFlags) -> SerialResult<()> {
        return_win_op!(PurgeComm(self.handle, flags.bits() as DWORD))
    }

    /// Declares which hardware events subsequent
    /// [wait_events](Self::wait_events) calls report.
    ///
    /// Setting the mask also completes an outstanding event wait on
    /// this handle with an empty result.
    pub fn set_event_mask(&mut self, mask: EventMask) -> SerialResult<()> {
        return_win_op!(SetCommMask(self.handle, mask.bits() as DWORD))
    }

    /// Reads the configured event interest mask back
    pub fn event_mask(&self) -> SerialResult<EventMask> {
        let mut mask: DWORD = 0;
        return_win_op!(GetCommMask(self.handle, &mut mask))?;
        Ok(EventMask::from_bits(mask))
    }

    /// Blocks until the device reports at least one event from the
    /// configured interest mask and decodes the result.
    ///
    /// One wait can report several simultaneous events; the report is
    /// ordered and each entry carries its associated value (line
    /// state, queue fill or error flags). The two status queries
    /// behind those values run at most once per call; when one fails,
    /// every event depending on it is reported as
    /// [PortEvent::StatusQueryFailed] with the OS error code. A wait
    /// on an all-zero interest mask yields an empty report. A blocked
    /// wait is failed within bounded time by [cancel](Self::cancel)
    /// from another thread.
    pub fn wait_events(&self) -> SerialResult<Vec<PortEvent>> {
        let mut op = OverlappedOp::new()?;
        let mut mask: DWORD = 0;
        let issued = unsafe { WaitCommEvent(self.handle, &mut mask, op.as_mut_ptr()) };
        op.finish(self.handle, issued, 0)?;
        Ok(decode_events(EventMask::from_bits(mask), self))
    }

    /// Reads exactly `count` bytes, blocking until they arrived.
    ///
    /// `count == 0` returns an empty buffer without touching the IO
    /// path. A read blocked here is failed within bounded time by
    /// [cancel](Self::cancel) from another thread.
    pub fn read_bytes(&mut self, count: usize) -> SerialResult<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; count];
        let transferred = self.read_overlapped(&mut buffer)?;
        buffer.truncate(transferred);
        Ok(buffer)
    }

    /// Writes the whole buffer, blocking until the driver accepted it.
    /// A partial transfer is reported as an error.
    pub fn write_bytes(&mut self, buffer: &[u8]) -> SerialResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let transferred = self.write_overlapped(buffer)?;
        if transferred != buffer.len() {
            return Err(SerialError::LibraryError(format!(
                "short write: {} of {} bytes accepted",
                transferred,
                buffer.len()
            )));
        }
        Ok(())
    }

    /// Number of bytes waiting in the receive and transmit buffers
    pub fn buffers_bytes_count(&self) -> SerialResult<(u32, u32)> {
        let status = self.queue_status().map_err(os_error_from_code)?;
        Ok((status.in_queue, status.out_queue))
    }

    /// Reads the modem signal lines (CTS, DSR, RING, RLSD)
    pub fn lines_status(&self) -> SerialResult<LinesStatus> {
        self.modem_lines().map_err(os_error_from_code)
    }

    /// Asserts a break condition for `duration_ms` milliseconds.
    ///
    /// The calling thread sleeps for the whole duration; this
    /// operation is neither overlapped nor cancellable. A zero
    /// duration is rejected without touching the line.
    pub fn send_break(&mut self, duration_ms: u32) -> SerialResult<()> {
        if duration_ms == 0 {
            return Err(SerialError::LibraryError(
                "break duration must be greater than zero".to_string(),
            ));
        }
        return_win_op!(SetCommBreak(self.handle))?;
        std::thread::sleep(Duration::from_millis(u64::from(duration_ms)));
        return_win_op!(ClearCommBreak(self.handle))
    }

    fn read_overlapped(&self, buffer: &mut [u8]) -> SerialResult<usize> {
        let mut op = OverlappedOp::new()?;
        let mut count: DWORD = 0;
        let issued = unsafe {
            ReadFile(
                self.handle,
                buffer.as_mut_ptr() as LPVOID,
                buffer.len() as DWORD,
                &mut count,
                op.as_mut_ptr(),
            )
        };
        let transferred = op.finish(self.handle, issued, count)?;
        Ok(transferred as usize)
    }

    fn write_overlapped(&self, buffer: &[u8]) -> SerialResult<usize> {
        let mut op = OverlappedOp::new()?;
        let mut count: DWORD = 0;
        let issued = unsafe {
            WriteFile(
                self.handle,
                buffer.as_ptr() as *const winapi::ctypes::c_void,
                buffer.len() as DWORD,
                &mut count,
                op.as_mut_ptr(),
            )
        };
        let transferred = op.finish(self.handle, issued, count)?;
        Ok(transferred as usize)
    }
}

impl StatusProbe for ComPort {
    fn modem_lines(&self) -> Result<LinesStatus, u32> {
        let mut stat: DWORD = 0;
        if unsafe { GetCommModemStatus(self.handle, &mut stat) } == 0 {
            return Err(last_error_code());
        }
        Ok(LinesStatus {
            cts: stat & MS_CTS_ON != 0,
            dsr: stat & MS_DSR_ON != 0,
            ring: stat & MS_RING_ON != 0,
            rlsd: stat & MS_RLSD_ON != 0,
        })
    }

    fn queue_status(&self) -> Result<QueueStatus, u32> {
        let mut errors: DWORD = 0;
        let mut comstat: COMSTAT = unsafe { std::mem::zeroed() };
        if unsafe { ClearCommError(self.handle, &mut errors, &mut comstat) } == 0 {
            return Err(last_error_code());
        }
        Ok(QueueStatus {
            in_queue: comstat.cbInQue,
            out_queue: comstat.cbOutQue,
            errors,
        })
    }
}

impl std::io::Read for ComPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_overlapped(buf).map_err(Into::into)
    }
}

impl std::io::Write for ComPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.write_overlapped(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        while self.buffers_bytes_count().map_err(std::io::Error::from)?.1 != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

impl Drop for ComPort {
    fn drop(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

fn apply_params(
    dcb: &mut DCB,
    baud_rate: u32,
    byte_size: ByteSize,
    stop_bits: StopBits,
    parity: Parity,
    set_rts: bool,
    set_dtr: bool,
) {
    dcb.BaudRate = baud_rate;
    dcb.ByteSize = byte_size.bits();
    dcb.StopBits = stop_bits.code();
    dcb.Parity = parity.code();

    dcb.set_fRtsControl(match set_rts {
        true => RTS_CONTROL_ENABLE,
        false => RTS_CONTROL_DISABLE,
    });
    dcb.set_fDtrControl(match set_dtr {
        true => DTR_CONTROL_ENABLE,
        false => DTR_CONTROL_DISABLE,
    });

    // Flow control is configured separately; protocol fields another
    // session may have left active must not persist
    dcb.set_fOutxCtsFlow(0);
    dcb.set_fOutxDsrFlow(0);
    dcb.set_fDsrSensitivity(0);
    dcb.set_fTXContinueOnXoff(1);
    dcb.set_fOutX(0);
    dcb.set_fInX(0);
    dcb.set_fErrorChar(0);
    dcb.set_fNull(0);
    dcb.set_fAbortOnError(0);
    dcb.XonLim = 2048;
    dcb.XoffLim = 512;
    dcb.XonChar = crate::XON_CHAR as i8;
    dcb.XoffChar = crate::XOFF_CHAR as i8;
}

fn apply_flow_control(dcb: &mut DCB, mode: FlowControl) {
    dcb.set_fRtsControl(RTS_CONTROL_ENABLE);
    dcb.set_fOutxCtsFlow(0);
    dcb.set_fOutX(0);
    dcb.set_fInX(0);
    if mode.contains(FlowControl::RTSCTS_IN) {
        dcb.set_fRtsControl(RTS_CONTROL_HANDSHAKE);
    }
    if mode.contains(FlowControl::RTSCTS_OUT) {
        dcb.set_fOutxCtsFlow(1);
    }
    if mode.contains(FlowControl::XONXOFF_IN) {
        dcb.set_fInX(1);
    }
    if mode.contains(FlowControl::XONXOFF_OUT) {
        dcb.set_fOutX(1);
    }
}

fn flow_control_from_dcb(dcb: &DCB) -> FlowControl {
    let mut mode = FlowControl::NONE;
    if dcb.fRtsControl() == RTS_CONTROL_HANDSHAKE {
        mode |= FlowControl::RTSCTS_IN;
    }
    if dcb.fOutxCtsFlow() != 0 {
        mode |= FlowControl::RTSCTS_OUT;
    }
    if dcb.fInX() != 0 {
        mode |= FlowControl::XONXOFF_IN;
    }
    if dcb.fOutX() != 0 {
        mode |= FlowControl::XONXOFF_OUT;
    }
    mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use winapi::shared::winerror::ERROR_INVALID_HANDLE;

    fn unopened_port() -> ComPort {
        ComPort {
            handle: INVALID_HANDLE_VALUE,
            path: "TEST".to_string(),
        }
    }

    #[test]
    fn zero_length_read_skips_the_io_path() {
        // An invalid handle would fail any real IO call
        let mut port = unopened_port();
        assert!(port.read_bytes(0).unwrap().is_empty());
    }

    #[test]
    fn zero_duration_break_is_rejected_before_touching_the_line() {
        let mut port = unopened_port();
        assert!(matches!(
            port.send_break(0),
            Err(SerialError::LibraryError(..))
        ));
    }

    #[test]
    fn cancel_is_reachable_while_the_port_is_shared() {
        // A blocked read or wait holds a reference to the port, so
        // unblocking it must work through a second shared reference
        // on another thread
        let port = std::sync::Arc::new(unopened_port());
        let canceller = {
            let port = port.clone();
            std::thread::spawn(move || port.cancel())
        };
        // An invalid handle reports the OS error instead of hanging
        assert!(canceller.join().unwrap().is_err());
        assert_eq!(port.path(), "TEST");
    }

    #[test]
    fn status_failures_keep_the_captured_error_code() {
        let port = unopened_port();
        match port.lines_status() {
            Err(SerialError::OsError { code, .. }) => assert_eq!(code, ERROR_INVALID_HANDLE),
            other => panic!("expected OsError, got {other:?}"),
        }
        match port.buffers_bytes_count() {
            Err(SerialError::OsError { code, .. }) => assert_eq!(code, ERROR_INVALID_HANDLE),
            other => panic!("expected OsError, got {other:?}"),
        }
    }

    #[test]
    fn apply_params_writes_line_fields_and_defaults() {
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        // Leftovers from a previous session
        dcb.set_fOutX(1);
        dcb.set_fInX(1);
        dcb.set_fOutxCtsFlow(1);
        dcb.set_fAbortOnError(1);

        apply_params(
            &mut dcb,
            115200,
            ByteSize::Eight,
            StopBits::One,
            Parity::Even,
            true,
            false,
        );

        assert_eq!(dcb.BaudRate, 115200);
        assert_eq!(dcb.ByteSize, 8);
        assert_eq!(dcb.StopBits, 0);
        assert_eq!(dcb.Parity, 2);
        assert_eq!(dcb.fRtsControl(), RTS_CONTROL_ENABLE);
        assert_eq!(dcb.fDtrControl(), DTR_CONTROL_DISABLE);
        assert_eq!(dcb.fOutX(), 0);
        assert_eq!(dcb.fInX(), 0);
        assert_eq!(dcb.fOutxCtsFlow(), 0);
        assert_eq!(dcb.fAbortOnError(), 0);
        assert_eq!(dcb.fTXContinueOnXoff(), 1);
        assert_eq!(dcb.XonLim, 2048);
        assert_eq!(dcb.XoffLim, 512);
        assert_eq!(dcb.XonChar, 17);
        assert_eq!(dcb.XoffChar, 19);
    }

    #[test]
    fn flow_control_round_trips_through_dcb() {
        let modes = [
            FlowControl::RTSCTS_IN,
            FlowControl::RTSCTS_OUT,
            FlowControl::XONXOFF_IN,
            FlowControl::XONXOFF_OUT,
            FlowControl::RTSCTS_IN | FlowControl::RTSCTS_OUT,
            FlowControl::XONXOFF_IN | FlowControl::XONXOFF_OUT,
            FlowControl::RTSCTS_IN
                | FlowControl::RTSCTS_OUT
                | FlowControl::XONXOFF_IN
                | FlowControl::XONXOFF_OUT,
        ];
        for mode in modes {
            let mut dcb: DCB = unsafe { std::mem::zeroed() };
            apply_flow_control(&mut dcb, mode);
            assert_eq!(flow_control_from_dcb(&dcb), mode);
        }
    }

    #[test]
    fn disabling_flow_control_forces_rts_enabled() {
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        apply_flow_control(
            &mut dcb,
            FlowControl::RTSCTS_IN | FlowControl::XONXOFF_OUT,
        );
        apply_flow_control(&mut dcb, FlowControl::NONE);
        assert_eq!(dcb.fRtsControl(), RTS_CONTROL_ENABLE);
        assert_eq!(dcb.fOutxCtsFlow(), 0);
        assert_eq!(dcb.fInX(), 0);
        assert_eq!(dcb.fOutX(), 0);
        assert_eq!(flow_control_from_dcb(&dcb), FlowControl::NONE);
    }
}
