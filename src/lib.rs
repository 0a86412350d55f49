//! comport-rs is a low-level Windows serial (COM) port library
//! built around overlapped IO: exclusive port opening, line
//! configuration, blocking reads/writes that another thread can
//! cancel through a shared port, comm event waiting, and
//! port enumeration with hardware identification metadata.
//!
//! The OS session layer lives in `windows`; the modules at the crate
//! root are platform neutral (event decoding and hardware-ID parsing)
//! so their logic stays unit-testable without a device handle.

#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    while_true
)]

/// XON character written into the device control block (DC1)
pub const XON_CHAR: u8 = 17;
/// XOFF character written into the device control block (DC3)
pub const XOFF_CHAR: u8 = 19;

pub mod events;
pub mod hwid;

#[cfg(windows)]
pub mod windows;

use thiserror::Error;

/// Serial port result type
pub type SerialResult<T> = std::result::Result<T, SerialError>;

/// Serial port error type
#[derive(Debug, Error)]
pub enum SerialError {
    /// The port exists but is exclusively held by another process
    #[error("port is busy")]
    PortBusy,
    /// No device with the given name exists
    #[error("port not found")]
    PortNotFound,
    /// The device opened but does not behave like a serial port
    /// (its comm state could not be read back)
    #[error("invalid serial port")]
    InvalidPort,
    /// OS specific error
    #[error("OS error {code} ({desc})")]
    OsError {
        /// OS error code
        code: u32,
        /// OS error description
        desc: String,
    },
    /// Internal library error
    #[error("library error '{0}'")]
    LibraryError(String),
}

/// Bytesize for serial port
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ByteSize {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
}

impl ByteSize {
    /// Number of data bits, as stored in the device control block
    pub fn bits(&self) -> u8 {
        match self {
            ByteSize::Five => 5,
            ByteSize::Six => 6,
            ByteSize::Seven => 7,
            ByteSize::Eight => 8,
        }
    }
}

/// Parity definitions
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Parity {
    /// No parity
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Mark parity
    Mark,
    /// Space parity
    Space,
}

impl Parity {
    /// Control block encoding (NOPARITY..SPACEPARITY)
    pub fn code(&self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }
}

/// Stop bits for serial port
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 1.5 stop bits
    OnePointFive,
    /// 2 stop bits
    Two,
}

impl StopBits {
    /// Control block encoding (ONESTOPBIT..TWOSTOPBITS)
    pub fn code(&self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::OnePointFive => 1,
            StopBits::Two => 2,
        }
    }
}

/// Flow control mode as a 4-bit mask.
///
/// The bit values are a stable external contract (callers persist
/// them); changing an assignment is a breaking change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FlowControl(u32);

impl FlowControl {
    /// No flow control. Setting this also forces RTS back to plain
    /// enabled rather than handshake driven
    pub const NONE: FlowControl = FlowControl(0);
    /// RTS/CTS handshake on input (RTS driven by the receive buffer)
    pub const RTSCTS_IN: FlowControl = FlowControl(1);
    /// RTS/CTS handshake on output (transmit gated on CTS)
    pub const RTSCTS_OUT: FlowControl = FlowControl(2);
    /// XON/XOFF on input
    pub const XONXOFF_IN: FlowControl = FlowControl(4);
    /// XON/XOFF on output
    pub const XONXOFF_OUT: FlowControl = FlowControl(8);

    /// Builds a mode from its raw mask value
    pub fn from_bits(bits: u32) -> Self {
        FlowControl(bits & 0xF)
    }

    /// Raw mask value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in this mask
    pub fn contains(&self, other: FlowControl) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flow control bit is set
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FlowControl {
    type Output = FlowControl;
    fn bitor(self, rhs: Self) -> Self::Output {
        FlowControl(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FlowControl {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Buffer purge request as a bit mask
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PurgeFlags(u32);

impl PurgeFlags {
    /// Abort an outstanding transmit operation
    pub const TX_ABORT: PurgeFlags = PurgeFlags(0x1);
    /// Abort an outstanding receive operation
    pub const RX_ABORT: PurgeFlags = PurgeFlags(0x2);
    /// Discard the transmit buffer
    pub const TX_CLEAR: PurgeFlags = PurgeFlags(0x4);
    /// Discard the receive buffer
    pub const RX_CLEAR: PurgeFlags = PurgeFlags(0x8);
    /// Abort and discard in both directions
    pub const ALL: PurgeFlags = PurgeFlags(0xF);

    /// Raw mask value
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for PurgeFlags {
    type Output = PurgeFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        PurgeFlags(self.0 | rhs.0)
    }
}

/// Snapshot of the modem signal lines
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LinesStatus {
    /// Clear to send
    pub cts: bool,
    /// Data set ready
    pub dsr: bool,
    /// Ring indicator
    pub ring: bool,
    /// Receive line signal detect (carrier detect)
    pub rlsd: bool,
}

/// Hardware identification metadata for one enumerated port.
///
/// Every field defaults to zero/empty when the information cannot be
/// discovered for the device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortProperties {
    /// USB product ID
    pub product_id: u16,
    /// USB vendor ID
    pub vendor_id: u16,
    /// Manufacturer string from the device registry
    pub manufacturer: String,
    /// Device description from the device registry
    pub description: String,
    /// Description reported by the bus driver
    pub bus_description: String,
    /// Serial number parsed from the device instance path
    pub serial_number: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_mask_is_stable() {
        assert_eq!(FlowControl::RTSCTS_IN.bits(), 1);
        assert_eq!(FlowControl::RTSCTS_OUT.bits(), 2);
        assert_eq!(FlowControl::XONXOFF_IN.bits(), 4);
        assert_eq!(FlowControl::XONXOFF_OUT.bits(), 8);
        let all = FlowControl::RTSCTS_IN
            | FlowControl::RTSCTS_OUT
            | FlowControl::XONXOFF_IN
            | FlowControl::XONXOFF_OUT;
        assert_eq!(all.bits(), 0xF);
        assert!(all.contains(FlowControl::XONXOFF_IN));
        assert!(!FlowControl::NONE.contains(FlowControl::RTSCTS_IN));
        assert!(FlowControl::NONE.is_none());
    }

    #[test]
    fn flow_control_from_bits_discards_unknown_bits() {
        assert_eq!(FlowControl::from_bits(0xFF).bits(), 0xF);
    }

    #[test]
    fn control_block_encodings() {
        assert_eq!(ByteSize::Five.bits(), 5);
        assert_eq!(ByteSize::Eight.bits(), 8);
        assert_eq!(Parity::None.code(), 0);
        assert_eq!(Parity::Space.code(), 4);
        assert_eq!(StopBits::One.code(), 0);
        assert_eq!(StopBits::OnePointFive.code(), 1);
        assert_eq!(StopBits::Two.code(), 2);
    }
}
