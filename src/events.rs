//! Comm event mask decoding.
//!
//! A single event wait can report several simultaneous hardware events
//! in one bit mask. Decoding walks a fixed-order table of event kinds
//! and attaches a value to each one; the values come from two batched
//! status queries (modem signal lines, queue/error counters) that are
//! executed at most once per wait cycle no matter how many events
//! depend on them. The queries sit behind [StatusProbe] so the decoder
//! itself needs no OS handle.

use crate::LinesStatus;

/// Event interest mask for a port.
///
/// The bit values match the ones the OS reports in a comm event wait
/// and are stable across releases.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// No events
    pub const NONE: EventMask = EventMask(0);
    /// A byte arrived in the input buffer
    pub const RX_CHAR: EventMask = EventMask(0x0001);
    /// The event character arrived in the input buffer
    pub const RX_FLAG: EventMask = EventMask(0x0002);
    /// The output buffer drained completely
    pub const TX_EMPTY: EventMask = EventMask(0x0004);
    /// The clear-to-send line changed state
    pub const CTS: EventMask = EventMask(0x0008);
    /// The data-set-ready line changed state
    pub const DSR: EventMask = EventMask(0x0010);
    /// The carrier-detect line changed state
    pub const RLSD: EventMask = EventMask(0x0020);
    /// A break condition was seen on the line
    pub const BREAK: EventMask = EventMask(0x0040);
    /// A line-status error (framing, overrun, parity) occurred
    pub const ERR: EventMask = EventMask(0x0080);
    /// A ring was detected
    pub const RING: EventMask = EventMask(0x0100);
    /// Every event kind this crate decodes
    pub const ALL: EventMask = EventMask(0x01FF);

    /// Builds a mask from its raw value, discarding bits outside the
    /// documented contract
    pub fn from_bits(bits: u32) -> Self {
        EventMask(bits & Self::ALL.0)
    }

    /// Raw mask value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in this mask
    pub fn contains(&self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One decodable comm event kind
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    /// Break condition on the line
    Break,
    /// Clear-to-send line change
    Cts,
    /// Data-set-ready line change
    Dsr,
    /// Line-status error
    LineError,
    /// Ring indicator
    Ring,
    /// Carrier-detect line change
    CarrierDetect,
    /// Byte received
    RxChar,
    /// Event character received
    RxFlag,
    /// Transmit buffer empty
    TxEmpty,
}

/// Which batched status query an event kind needs for its value
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StatusQuery {
    None,
    ModemLines,
    QueueStatus,
}

impl EventKind {
    /// The mask bit reporting this kind
    pub fn mask(&self) -> EventMask {
        match self {
            EventKind::Break => EventMask::BREAK,
            EventKind::Cts => EventMask::CTS,
            EventKind::Dsr => EventMask::DSR,
            EventKind::LineError => EventMask::ERR,
            EventKind::Ring => EventMask::RING,
            EventKind::CarrierDetect => EventMask::RLSD,
            EventKind::RxChar => EventMask::RX_CHAR,
            EventKind::RxFlag => EventMask::RX_FLAG,
            EventKind::TxEmpty => EventMask::TX_EMPTY,
        }
    }

    fn required_query(&self) -> StatusQuery {
        match self {
            EventKind::Break => StatusQuery::None,
            EventKind::Cts | EventKind::Dsr | EventKind::Ring | EventKind::CarrierDetect => {
                StatusQuery::ModemLines
            }
            EventKind::LineError | EventKind::RxChar | EventKind::RxFlag | EventKind::TxEmpty => {
                StatusQuery::QueueStatus
            }
        }
    }
}

/// Counters from the batched queue/error status query
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Bytes waiting in the receive buffer
    pub in_queue: u32,
    /// Bytes waiting in the transmit buffer
    pub out_queue: u32,
    /// Accumulated communication error flags since the last query
    pub errors: u32,
}

/// Source of the two batched status queries a decode cycle may need.
///
/// The error type is the raw OS error code, which the decoder embeds
/// in the report for every dependent event.
pub trait StatusProbe {
    /// Reads the modem signal lines
    fn modem_lines(&self) -> Result<LinesStatus, u32>;
    /// Reads the queue counters and accumulated error flags
    fn queue_status(&self) -> Result<QueueStatus, u32>;
}

/// One decoded event with its associated value
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Break condition seen; carries no value
    Break,
    /// CTS changed; current line state
    Cts(bool),
    /// DSR changed; current line state
    Dsr(bool),
    /// Line-status error; accumulated error flags
    LineError(u32),
    /// Ring detected; current line state
    Ring(bool),
    /// Carrier detect changed; current line state
    CarrierDetect(bool),
    /// Byte received; bytes now in the receive buffer
    RxChar(u32),
    /// Event character received; bytes now in the receive buffer
    RxFlag(u32),
    /// Transmit buffer drained; bytes left in the transmit buffer
    TxEmpty(u32),
    /// The batched status query this event depends on failed, so the
    /// event is reported without a usable value
    StatusQueryFailed {
        /// The event kind whose value could not be produced
        kind: EventKind,
        /// OS error code from the failed query
        os_error: u32,
    },
}

// Fixed report order. External callers rely on it being stable.
const DECODE_ORDER: [EventKind; 9] = [
    EventKind::Break,
    EventKind::Cts,
    EventKind::Dsr,
    EventKind::LineError,
    EventKind::Ring,
    EventKind::CarrierDetect,
    EventKind::RxChar,
    EventKind::RxFlag,
    EventKind::TxEmpty,
];

/// Decodes a waited event mask into an ordered report.
///
/// Each of the two batched queries on `probe` runs at most once per
/// call; its single outcome is shared by every event that needs it.
/// An empty mask produces an empty report.
pub fn decode_events<P: StatusProbe>(mask: EventMask, probe: &P) -> Vec<PortEvent> {
    let mut lines: Option<Result<LinesStatus, u32>> = None;
    let mut queues: Option<Result<QueueStatus, u32>> = None;
    let mut report = Vec::new();

    for kind in DECODE_ORDER {
        if !mask.contains(kind.mask()) {
            continue;
        }
        let event = match kind.required_query() {
            StatusQuery::None => PortEvent::Break,
            StatusQuery::ModemLines => {
                match lines.get_or_insert_with(|| probe.modem_lines()) {
                    Ok(l) => match kind {
                        EventKind::Cts => PortEvent::Cts(l.cts),
                        EventKind::Dsr => PortEvent::Dsr(l.dsr),
                        EventKind::Ring => PortEvent::Ring(l.ring),
                        _ => PortEvent::CarrierDetect(l.rlsd),
                    },
                    Err(code) => PortEvent::StatusQueryFailed {
                        kind,
                        os_error: *code,
                    },
                }
            }
            StatusQuery::QueueStatus => {
                match queues.get_or_insert_with(|| probe.queue_status()) {
                    Ok(q) => match kind {
                        EventKind::LineError => PortEvent::LineError(q.errors),
                        EventKind::RxChar => PortEvent::RxChar(q.in_queue),
                        EventKind::RxFlag => PortEvent::RxFlag(q.in_queue),
                        _ => PortEvent::TxEmpty(q.out_queue),
                    },
                    Err(code) => PortEvent::StatusQueryFailed {
                        kind,
                        os_error: *code,
                    },
                }
            }
        };
        report.push(event);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct MockProbe {
        lines: Result<LinesStatus, u32>,
        queues: Result<QueueStatus, u32>,
        lines_calls: Cell<u32>,
        queue_calls: Cell<u32>,
    }

    impl MockProbe {
        fn new(lines: Result<LinesStatus, u32>, queues: Result<QueueStatus, u32>) -> Self {
            Self {
                lines,
                queues,
                lines_calls: Cell::new(0),
                queue_calls: Cell::new(0),
            }
        }
    }

    impl StatusProbe for MockProbe {
        fn modem_lines(&self) -> Result<LinesStatus, u32> {
            self.lines_calls.set(self.lines_calls.get() + 1);
            self.lines
        }

        fn queue_status(&self) -> Result<QueueStatus, u32> {
            self.queue_calls.set(self.queue_calls.get() + 1);
            self.queues
        }
    }

    #[test]
    fn from_bits_discards_unknown_bits() {
        assert_eq!(EventMask::from_bits(0xFFFF_FFFF), EventMask::ALL);
        assert_eq!(EventMask::from_bits(0x0400), EventMask::NONE);
        assert_eq!(
            EventMask::from_bits(0x0401 | EventMask::CTS.bits()),
            EventMask::RX_CHAR | EventMask::CTS
        );
    }

    #[test]
    fn empty_mask_yields_empty_report() {
        let probe = MockProbe::new(Ok(LinesStatus::default()), Ok(QueueStatus::default()));
        let report = decode_events(EventMask::NONE, &probe);
        assert!(report.is_empty());
        assert_eq!(probe.lines_calls.get(), 0);
        assert_eq!(probe.queue_calls.get(), 0);
    }

    #[test]
    fn break_event_needs_no_query() {
        let probe = MockProbe::new(Err(5), Err(5));
        let report = decode_events(EventMask::BREAK, &probe);
        assert_eq!(report, vec![PortEvent::Break]);
        assert_eq!(probe.lines_calls.get(), 0);
        assert_eq!(probe.queue_calls.get(), 0);
    }

    #[test]
    fn modem_query_runs_once_for_many_line_events() {
        let lines = LinesStatus {
            cts: true,
            dsr: false,
            ring: true,
            rlsd: false,
        };
        let probe = MockProbe::new(Ok(lines), Ok(QueueStatus::default()));
        let mask = EventMask::CTS | EventMask::DSR | EventMask::RING | EventMask::RLSD;
        let report = decode_events(mask, &probe);
        assert_eq!(
            report,
            vec![
                PortEvent::Cts(true),
                PortEvent::Dsr(false),
                PortEvent::Ring(true),
                PortEvent::CarrierDetect(false),
            ]
        );
        assert_eq!(probe.lines_calls.get(), 1);
        assert_eq!(probe.queue_calls.get(), 0);
    }

    #[test]
    fn queue_query_runs_once_and_feeds_all_dependents() {
        let queues = QueueStatus {
            in_queue: 12,
            out_queue: 3,
            errors: 0x8,
        };
        let probe = MockProbe::new(Ok(LinesStatus::default()), Ok(queues));
        let mask = EventMask::ERR | EventMask::RX_CHAR | EventMask::RX_FLAG | EventMask::TX_EMPTY;
        let report = decode_events(mask, &probe);
        assert_eq!(
            report,
            vec![
                PortEvent::LineError(0x8),
                PortEvent::RxChar(12),
                PortEvent::RxFlag(12),
                PortEvent::TxEmpty(3),
            ]
        );
        assert_eq!(probe.queue_calls.get(), 1);
    }

    #[test]
    fn failed_queue_query_marks_every_dependent_event() {
        let probe = MockProbe::new(Ok(LinesStatus::default()), Err(995));
        let mask = EventMask::ERR | EventMask::RX_CHAR | EventMask::TX_EMPTY | EventMask::BREAK;
        let report = decode_events(mask, &probe);
        assert_eq!(
            report,
            vec![
                PortEvent::Break,
                PortEvent::StatusQueryFailed {
                    kind: EventKind::LineError,
                    os_error: 995
                },
                PortEvent::StatusQueryFailed {
                    kind: EventKind::RxChar,
                    os_error: 995
                },
                PortEvent::StatusQueryFailed {
                    kind: EventKind::TxEmpty,
                    os_error: 995
                },
            ]
        );
        // Memoized failure: the probe must not be retried within a cycle
        assert_eq!(probe.queue_calls.get(), 1);
    }

    #[test]
    fn failed_modem_query_does_not_taint_queue_events() {
        let queues = QueueStatus {
            in_queue: 1,
            out_queue: 0,
            errors: 0,
        };
        let probe = MockProbe::new(Err(6), Ok(queues));
        let mask = EventMask::CTS | EventMask::RX_CHAR;
        let report = decode_events(mask, &probe);
        assert_eq!(
            report,
            vec![
                PortEvent::StatusQueryFailed {
                    kind: EventKind::Cts,
                    os_error: 6
                },
                PortEvent::RxChar(1),
            ]
        );
        assert_eq!(probe.lines_calls.get(), 1);
        assert_eq!(probe.queue_calls.get(), 1);
    }

    #[test]
    fn report_order_is_fixed_regardless_of_mask_bit_order() {
        let probe = MockProbe::new(
            Ok(LinesStatus {
                cts: true,
                ..Default::default()
            }),
            Ok(QueueStatus::default()),
        );
        let mask = EventMask::TX_EMPTY | EventMask::BREAK | EventMask::CTS;
        let report = decode_events(mask, &probe);
        assert_eq!(
            report,
            vec![
                PortEvent::Break,
                PortEvent::Cts(true),
                PortEvent::TxEmpty(0),
            ]
        );
    }
}
