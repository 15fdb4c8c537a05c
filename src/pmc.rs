//! Management client (`Pmc`, spec §4.7).
//!
//! The wire format itself is out of scope (spec §9): this module treats the
//! management channel as an opaque typed request/response pair, the same
//! level of abstraction `dantesync::traits::PtpNetwork` gives the PTP event
//! socket (a trait with `recv`/`reset`, mockable, and no byte-level detail
//! baked into the controller). The TLV framing that *is* modeled is parsed
//! with `byteorder`, matching `dantesync::controller`'s use of `byteorder`
//! for its own wire structures.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::debug;

/// The two data sets this client walks, in order (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSetId {
    PortDataSet,
    TimePropertiesDataSet,
}

const DATA_SETS: [DataSetId; 2] = [DataSetId::PortDataSet, DataSetId::TimePropertiesDataSet];

/// Port state values relevant to §4.7's "wait for the daemon to settle" gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Master,
    Slave,
    Other,
}

/// Leap indicator carried by TIME_PROPERTIES_DATA_SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapFlag {
    Leap61,
    Leap59,
    None,
}

/// Decoded payload for the data set currently being requested.
#[derive(Debug, Clone, Copy)]
pub enum DataSetPayload {
    Port { state: PortState },
    TimeProperties { current_utc_offset: i64, leap: LeapFlag },
}

/// One management response, already filtered down to "a single TLV of type
/// management with an id matching the current cursor" (spec §4.7 step
/// "Process the payload"); anything else is dropped by the transport layer.
pub struct Message {
    pub id: u16,
    pub payload: Vec<u8>,
}

/// Abstracts the management transport's non-blocking poll/send/recv surface
/// so [`Pmc`] can be driven without a real socket in tests.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    fn poll_readable(&mut self, timeout_ms: i32) -> Result<bool>;
    fn poll_writable(&mut self) -> Result<bool>;
    fn send_get(&mut self, id: u16) -> Result<()>;
    fn recv(&mut self) -> Result<Option<Message>>;
}

/// Outcome of one [`Pmc::run`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcOutcome {
    Complete,
    Incomplete,
}

fn dataset_id_code(id: DataSetId) -> u16 {
    match id {
        DataSetId::PortDataSet => 0x0004,
        DataSetId::TimePropertiesDataSet => 0x0002,
    }
}

/// Non-blocking state machine walking `[PORT_DATA_SET,
/// TIME_PROPERTIES_DATA_SET]` (spec §4.7).
pub struct Pmc {
    idx: usize,
    requested: bool,
}

impl Default for Pmc {
    fn default() -> Self {
        Self::new()
    }
}

impl Pmc {
    pub fn new() -> Self {
        Pmc { idx: 0, requested: false }
    }

    fn reset(&mut self) {
        self.idx = 0;
        self.requested = false;
    }

    /// Run one invocation of the cycle (spec §4.7).
    ///
    /// `wait_sync` gates `PORT_DATA_SET`, `get_utc_offset` gates
    /// `TIME_PROPERTIES_DATA_SET`. Skips ahead past any gated entries before
    /// polling the transport; if the walk is already exhausted, resets and
    /// reports complete without touching the transport at all (spec
    /// invariant: "running a management cycle with both flags false is a
    /// no-op on all state").
    pub fn run<T: Transport>(
        &mut self,
        transport: &mut T,
        timeout_ms: i32,
        wait_sync: bool,
        get_utc_offset: bool,
        sync_offset: &mut i64,
        leap: &mut i8,
    ) -> Result<PmcOutcome> {
        self.skip_gated(wait_sync, get_utc_offset);
        if self.idx >= DATA_SETS.len() {
            self.reset();
            return Ok(PmcOutcome::Complete);
        }

        let current = DATA_SETS[self.idx];
        let readable = transport.poll_readable(timeout_ms)?;
        let writable = if !self.requested { transport.poll_writable()? } else { false };

        if !readable && !writable {
            self.requested = false;
            return Ok(PmcOutcome::Incomplete);
        }

        if writable && !self.requested {
            transport.send_get(dataset_id_code(current))?;
            self.requested = true;
        }

        if readable {
            if let Some(msg) = transport.recv()? {
                if msg.id == dataset_id_code(current) {
                    self.process(current, &msg, sync_offset, leap);
                } else {
                    debug!("pmc: dropping response with mismatched id {}", msg.id);
                }
            }
        }

        self.skip_gated(wait_sync, get_utc_offset);
        if self.idx >= DATA_SETS.len() {
            self.reset();
            Ok(PmcOutcome::Complete)
        } else {
            Ok(PmcOutcome::Incomplete)
        }
    }

    fn skip_gated(&mut self, wait_sync: bool, get_utc_offset: bool) {
        while self.idx < DATA_SETS.len() {
            let gated = match DATA_SETS[self.idx] {
                DataSetId::PortDataSet => !wait_sync,
                DataSetId::TimePropertiesDataSet => !get_utc_offset,
            };
            if gated {
                self.idx += 1;
                self.requested = false;
            } else {
                break;
            }
        }
    }

    fn process(&mut self, id: DataSetId, msg: &Message, sync_offset: &mut i64, leap: &mut i8) {
        match id {
            DataSetId::PortDataSet => {
                if msg.payload.is_empty() {
                    return;
                }
                let state = match msg.payload[0] {
                    1 => PortState::Master,
                    2 => PortState::Slave,
                    _ => PortState::Other,
                };
                if state == PortState::Master || state == PortState::Slave {
                    self.idx += 1;
                    self.requested = false;
                }
            }
            DataSetId::TimePropertiesDataSet => {
                if msg.payload.len() >= 3 {
                    *sync_offset = BigEndian::read_i16(&msg.payload[0..2]) as i64;
                    *leap = match msg.payload[2] {
                        0b01 => 1,
                        0b10 => -1,
                        _ => 0,
                    };
                }
                self.idx += 1;
                self.requested = false;
            }
        }
    }
}

const MGMT_TAG: u8 = 0x0d;

fn poll_one(fd: i32, event: i16, timeout_ms: i32) -> Result<bool> {
    let mut pfd = libc::pollfd { fd, events: event, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(ret > 0 && (pfd.revents & event) != 0)
}

/// Unix-domain [`Transport`] to the external PTP daemon's management
/// endpoint (spec §6, "management transport"). The on-wire framing beyond
/// "a tag byte, a big-endian id, and a payload" is owned by that daemon and
/// is intentionally not reproduced here (spec §9).
pub struct UnixTransport {
    socket: UnixDatagram,
}

impl UnixTransport {
    pub fn connect(local_path: &Path, peer_path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(local_path);
        let socket = UnixDatagram::bind(local_path)?;
        socket.connect(peer_path)?;
        socket.set_nonblocking(true)?;
        Ok(UnixTransport { socket })
    }
}

impl Transport for UnixTransport {
    fn poll_readable(&mut self, timeout_ms: i32) -> Result<bool> {
        poll_one(self.socket.as_raw_fd(), libc::POLLIN, timeout_ms)
    }

    fn poll_writable(&mut self) -> Result<bool> {
        poll_one(self.socket.as_raw_fd(), libc::POLLOUT, 0)
    }

    fn send_get(&mut self, id: u16) -> Result<()> {
        let mut buf = [0u8; 4];
        buf[0] = MGMT_TAG;
        BigEndian::write_u16(&mut buf[2..4], id);
        self.socket.send(&buf)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Message>> {
        let mut buf = [0u8; 1024];
        match self.socket.recv(&mut buf) {
            Ok(n) if n >= 4 && buf[0] == MGMT_TAG => {
                let id = BigEndian::read_u16(&buf[2..4]);
                Ok(Some(Message { id, payload: buf[4..n].to_vec() }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_flags_false_is_complete_noop() {
        let mut transport = MockTransport::new();
        // No expectations set: the transport must not be touched at all.
        let mut pmc = Pmc::new();
        let mut offset = 0i64;
        let mut leap = 0i8;
        let outcome = pmc.run(&mut transport, 0, false, false, &mut offset, &mut leap).unwrap();
        assert_eq!(outcome, PmcOutcome::Complete);
        assert_eq!(offset, 0);
        assert_eq!(leap, 0);
    }

    #[test]
    fn timeout_with_no_event_returns_incomplete_and_clears_requested() {
        let mut transport = MockTransport::new();
        transport.expect_poll_readable().returning(|_| Ok(false));
        transport.expect_poll_writable().returning(|| Ok(false));

        let mut pmc = Pmc::new();
        let mut offset = 0i64;
        let mut leap = 0i8;
        let outcome = pmc.run(&mut transport, 0, true, true, &mut offset, &mut leap).unwrap();
        assert_eq!(outcome, PmcOutcome::Incomplete);
    }

    #[test]
    fn port_data_set_advances_cursor_only_on_master_or_slave() {
        let mut transport = MockTransport::new();
        transport.expect_poll_readable().returning(|_| Ok(true));
        transport.expect_poll_writable().returning(|| Ok(false));
        transport.expect_recv().returning(|| {
            Ok(Some(Message {
                id: dataset_id_code(DataSetId::PortDataSet),
                payload: vec![2], // SLAVE
            }))
        });

        let mut pmc = Pmc::new();
        let mut offset = 0i64;
        let mut leap = 0i8;
        pmc.run(&mut transport, 0, true, false, &mut offset, &mut leap).unwrap();
        assert_eq!(pmc.idx, 1);
    }

    #[test]
    fn time_properties_copies_offset_and_leap_and_advances_unconditionally() {
        let mut transport = MockTransport::new();
        transport.expect_poll_readable().returning(|_| Ok(true));
        transport.expect_poll_writable().returning(|| Ok(false));
        transport.expect_recv().returning(|| {
            let mut payload = vec![0u8; 3];
            BigEndian::write_i16(&mut payload[0..2], 37);
            payload[2] = 0b01; // LEAP_61
            Ok(Some(Message {
                id: dataset_id_code(DataSetId::TimePropertiesDataSet),
                payload,
            }))
        });

        let mut pmc = Pmc::new();
        let mut offset = 0i64;
        let mut leap = 0i8;
        let outcome = pmc.run(&mut transport, 0, false, true, &mut offset, &mut leap).unwrap();
        assert_eq!(offset, 37);
        assert_eq!(leap, 1);
        assert_eq!(outcome, PmcOutcome::Complete);
    }

    #[test]
    fn mismatched_tlv_id_is_silently_dropped() {
        let mut transport = MockTransport::new();
        transport.expect_poll_readable().returning(|_| Ok(true));
        transport.expect_poll_writable().returning(|| Ok(false));
        transport.expect_recv().returning(|| {
            Ok(Some(Message {
                id: 0xffff,
                payload: vec![2],
            }))
        });

        let mut pmc = Pmc::new();
        let mut offset = 0i64;
        let mut leap = 0i8;
        let outcome = pmc.run(&mut transport, 0, true, false, &mut offset, &mut leap).unwrap();
        assert_eq!(outcome, PmcOutcome::Incomplete);
        assert_eq!(pmc.idx, 0);
    }
}
