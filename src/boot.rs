//! Boot sequence (spec §4.9): clock/device resolution, PHC auto-discovery
//! from an interface name, and sync-offset-direction derivation.
//!
//! Device opening follows `dantesync::rtc`'s "open a device, keep the raw
//! fd for the process lifetime" pattern; the ethtool query is new ground
//! (the retrieval pack has nothing resembling it) built directly against
//! the kernel ioctl ABI the way `measure.rs` already does for PPS/PHC.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use libc::clockid_t;

use crate::clock::fd_to_clockid;
use crate::leap::LeapTracker;
use crate::pmc::{Pmc, PmcOutcome, Transport};

/// A resolved `-c`/`-s` clock argument (spec §6 "device conventions").
pub enum ClockRef {
    Realtime,
    Phc { fd: RawFd, clkid: clockid_t },
}

impl ClockRef {
    pub fn clockid(&self) -> clockid_t {
        match self {
            ClockRef::Realtime => libc::CLOCK_REALTIME,
            ClockRef::Phc { clkid, .. } => *clkid,
        }
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self, ClockRef::Realtime)
    }

    pub fn fd(&self) -> Option<RawFd> {
        match self {
            ClockRef::Realtime => None,
            ClockRef::Phc { fd, .. } => Some(*fd),
        }
    }
}

/// Parse a `-c`/`-s` argument: `CLOCK_REALTIME` (case-insensitive) selects
/// the real-time clock; anything else is a device path opened read/write
/// and converted to a dynamic clockid via [`fd_to_clockid`].
pub fn resolve_clock(arg: &str) -> Result<ClockRef> {
    if arg.eq_ignore_ascii_case("CLOCK_REALTIME") {
        return Ok(ClockRef::Realtime);
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(arg)
        .with_context(|| format!("opening clock device {}", arg))?;
    let fd = file.as_raw_fd();
    // The fd is kept for the process lifetime; the PHC/SYSOFF loops never
    // explicitly close it since the process exits when they terminate
    // (spec §5 resource policy).
    std::mem::forget(file);
    Ok(ClockRef::Phc { fd, clkid: fd_to_clockid(fd) })
}

/// Open the PPS device read-only (spec §6).
pub fn open_pps(path: &str) -> Result<RawFd> {
    let file = std::fs::OpenOptions::new().read(true).open(path).with_context(|| format!("opening PPS device {}", path))?;
    let fd = file.as_raw_fd();
    std::mem::forget(file);
    Ok(fd)
}

const SIOCETHTOOL: u64 = 0x8946;
const ETHTOOL_GET_TS_INFO: u32 = 0x0000_0041;

#[repr(C)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

#[repr(C)]
struct IfreqEthtool {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

/// Auto-discover the PHC device path for a network interface via
/// `ETHTOOL_GET_TS_INFO` (spec §4.9: "if the master is given by interface
/// name and no explicit source device, auto-discover the PHC device").
pub fn discover_phc_for_interface(ifname: &str) -> Result<PathBuf> {
    if ifname.len() >= libc::IFNAMSIZ {
        bail!("interface name {} too long", ifname);
    }

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(std::io::Error::last_os_error()).context("opening ethtool query socket");
    }

    let mut info = EthtoolTsInfo {
        cmd: ETHTOOL_GET_TS_INFO,
        so_timestamping: 0,
        phc_index: -1,
        tx_types: 0,
        tx_reserved: [0; 3],
        rx_filters: 0,
        rx_reserved: [0; 3],
    };

    let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (i, b) in ifname.bytes().enumerate() {
        ifr_name[i] = b as libc::c_char;
    }
    let mut ifr = IfreqEthtool {
        ifr_name,
        ifr_data: &mut info as *mut EthtoolTsInfo as *mut libc::c_void,
    };

    let ret = unsafe { libc::ioctl(sock, SIOCETHTOOL as _, &mut ifr) };
    let saved_errno = std::io::Error::last_os_error();
    unsafe { libc::close(sock) };
    if ret < 0 {
        return Err(saved_errno).context("ETHTOOL_GET_TS_INFO ioctl failed");
    }
    if info.phc_index < 0 {
        bail!("interface {} has no associated PHC", ifname);
    }

    Ok(PathBuf::from(format!("/dev/ptp{}", info.phc_index)))
}

/// Direction table from spec §4.9.
pub fn derive_direction(slave_is_rtc: bool, master_is_rtc: bool) -> i8 {
    match (slave_is_rtc, master_is_rtc) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    }
}

/// Run one `run_pmc` cycle at a time with a 1s timeout until it reports
/// complete (spec §4.9 bootstrap loop, only place a non-zero steady-state
/// timeout is used — spec §5).
pub fn wait_sync<T: Transport>(pmc: &mut Pmc, transport: &mut T, sync_offset: &mut i64, leap: &mut i8) -> Result<()> {
    loop {
        let outcome = pmc.run(transport, 1000, true, true, sync_offset, leap)?;
        if outcome == PmcOutcome::Complete {
            return Ok(());
        }
    }
}

/// Combine the forced-offset flag (`-O`) with the derived direction table
/// and the "close PMC" rule (spec §4.9): the management client is closed
/// once the offset is user-forced or the derived direction is 0, since
/// neither case needs ongoing leap tracking.
pub fn build_leap_tracker(
    forced_offset: Option<i64>,
    management_sync_offset: i64,
    slave_is_rtc: bool,
    master_is_rtc: bool,
    kernel_leap: bool,
) -> (LeapTracker, bool) {
    let (offset, direction) = match forced_offset {
        Some(o) => (o, -1),
        None => (management_sync_offset, derive_direction(slave_is_rtc, master_is_rtc)),
    };
    let close_pmc = forced_offset.is_some() || direction == 0;
    (LeapTracker::new(offset, direction, kernel_leap, slave_is_rtc), close_pmc)
}
