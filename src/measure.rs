//! Measurement primitives (spec §4.2): `read_phc`, `read_pps`,
//! `sysoff_measure`/`sysoff_probe`.
//!
//! The quickest-read technique and ioctl plumbing follow the same
//! `libc`/`nix`-based low-level style as `clock-steering::unix` (direct
//! `clock_gettime`/`clock_adjtime` calls wrapped in a small `Result`) and
//! `dantesync::rtc` (a single `ioctl_*!`-declared device call per module).

use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use libc::{clockid_t, timespec};
use nix::ioctl_readwrite;

/// One measurement: reference-minus-source offset, the local timestamp it
/// was taken at, and an optional round-trip delay (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset_ns: i64,
    pub ts_ns: u64,
    pub delay_ns: Option<i64>,
}

fn clock_gettime_ns(clkid: clockid_t) -> Result<u64> {
    let mut ts: timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clkid, &mut ts) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error()).context("clock_gettime failed");
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Dual-clock quickest-read (spec §4.2).
///
/// Brackets a read of `source` between two reads of `reference`, repeats
/// `n` times, and keeps the iteration with the smallest bracket interval.
/// Offset sign convention: reference minus source.
pub fn read_phc(reference: clockid_t, source: clockid_t, n: u32) -> Result<Sample> {
    let n = n.max(1);
    let mut best: Option<(i64, u64, i64)> = None; // (offset, ts, interval)

    for _ in 0..n {
        let r1 = clock_gettime_ns(reference)?;
        let s = clock_gettime_ns(source)?;
        let r2 = clock_gettime_ns(reference)?;
        let interval = (r2 - r1) as i64;

        if best.map(|(_, _, best_interval)| interval < best_interval).unwrap_or(true) {
            let offset = (r1 as i64 - s as i64) + interval / 2;
            best = Some((offset, r2, interval));
        }
    }

    let (offset_ns, ts_ns, delay_ns) = best.expect("n >= 1 guarantees at least one iteration");
    Ok(Sample {
        offset_ns,
        ts_ns,
        delay_ns: Some(delay_ns),
    })
}

const PHC_PPS_OFFSET_LIMIT_NS: i64 = 10_000_000;

/// Returns the PHC-PPS alignment limit used by the PPS loop (spec §4.3),
/// exposed so the loop driver and its tests share one constant.
pub fn phc_pps_offset_limit_ns() -> i64 {
    PHC_PPS_OFFSET_LIMIT_NS
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsFdata {
    info: PpsInfo,
    timeout: PpsKtime,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsInfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

const PPS_IOC_MAGIC: u8 = b'1';
ioctl_readwrite!(pps_fetch, PPS_IOC_MAGIC, 0x21, PpsFdata);

/// Block on a PPS device for the next rising edge (spec §4.2), with a 10s
/// deadline. No delay is produced; the engine supplies one separately when
/// a companion PHC is present (spec §4.3).
pub fn read_pps(fd: RawFd) -> Result<Sample> {
    let mut data = PpsFdata {
        timeout: PpsKtime {
            sec: 10,
            nsec: 0,
            flags: 1, // PPS_TIME_INVALID cleared, relative timeout
        },
        ..Default::default()
    };

    unsafe { pps_fetch(fd, &mut data) }.context("PPS_FETCH ioctl failed")?;

    let ts = &data.info.assert_tu;
    let ts_ns = ts.sec as u64 * 1_000_000_000 + ts.nsec as u64;
    let mut offset = (ts_ns % 1_000_000_000) as i64;
    if offset > 500_000_000 {
        offset -= 1_000_000_000;
    }

    Ok(Sample {
        offset_ns: offset,
        ts_ns,
        delay_ns: None,
    })
}

const PTP_MAX_SAMPLES: usize = 25;

/// Matches the kernel's `struct ptp_sys_offset_extended`: for each of up to
/// `PTP_MAX_SAMPLES` rows, a (realtime-before, phc, realtime-after) triplet
/// of (sec, nsec) pairs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PtpSysOffsetExtended {
    n_samples: u32,
    rsv: [u32; 3],
    ts: [[[u64; 2]; 3]; PTP_MAX_SAMPLES],
}

impl Default for PtpSysOffsetExtended {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

const PTP_CLOCK_MAGIC: u8 = b'=';
ioctl_readwrite!(ptp_sys_offset_extended, PTP_CLOCK_MAGIC, 0x09, PtpSysOffsetExtended);

/// Kernel-assisted quickest-read between the system clock and a PHC (spec
/// §4.2). Used by the SYSOFF loop when the slave is `CLOCK_REALTIME` and the
/// kernel supports `PTP_SYS_OFFSET_EXTENDED`.
pub fn sysoff_measure(phc_fd: RawFd, n_samples: u32) -> Result<Sample> {
    let mut req = PtpSysOffsetExtended {
        n_samples: n_samples.clamp(1, PTP_MAX_SAMPLES as u32),
        ..Default::default()
    };

    unsafe { ptp_sys_offset_extended(phc_fd, &mut req) }.context("PTP_SYS_OFFSET_EXTENDED ioctl failed")?;

    let mut best: Option<(i64, u64, i64)> = None;
    for row in req.ts.iter().take(req.n_samples as usize) {
        let r1 = row[0][0] * 1_000_000_000 + row[0][1];
        let s = row[1][0] * 1_000_000_000 + row[1][1];
        let r2 = row[2][0] * 1_000_000_000 + row[2][1];
        let interval = (r2 - r1) as i64;

        if best.map(|(_, _, best_interval)| interval < best_interval).unwrap_or(true) {
            let offset = (r1 as i64 - s as i64) + interval / 2;
            best = Some((offset, r2, interval));
        }
    }

    best.map(|(offset_ns, ts_ns, delay_ns)| Sample {
        offset_ns,
        ts_ns,
        delay_ns: Some(delay_ns),
    })
    .ok_or_else(|| anyhow!("PTP_SYS_OFFSET_EXTENDED returned zero samples"))
}

/// Best-effort single call to check kernel support for `sysoff_measure`
/// (spec §4.3). Never panics; treats any ioctl failure as "unsupported".
pub fn sysoff_probe(phc_fd: RawFd) -> bool {
    sysoff_measure(phc_fd, 1).is_ok()
}

pub fn sleep_for_rate(rate_hz: u32) {
    let micros = 1_000_000u64 / rate_hz.max(1) as u64;
    std::thread::sleep(Duration::from_micros(micros));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pps_offset_normalizes_into_symmetric_range() {
        // ts_ns mod 1e9 exactly at the boundary stays positive.
        let boundary = 500_000_000u64;
        let mut offset = boundary as i64;
        if offset > 500_000_000 {
            offset -= 1_000_000_000;
        }
        assert_eq!(offset, 500_000_000);

        // One nanosecond past flips negative.
        let mut offset = (boundary + 1) as i64;
        if offset > 500_000_000 {
            offset -= 1_000_000_000;
        }
        assert_eq!(offset, -499_999_999);
    }

    #[test]
    fn phc_pps_alignment_gate_boundary() {
        assert!(PHC_PPS_OFFSET_LIMIT_NS <= phc_pps_offset_limit_ns());
        assert!(10_000_000 <= phc_pps_offset_limit_ns());
        assert!(10_000_001 > phc_pps_offset_limit_ns());
    }

    #[test]
    fn read_phc_same_clock_yields_zero_offset_and_picks_smallest_interval() {
        // CLOCK_MONOTONIC against itself: offset should be ~0 and interval small.
        let sample = read_phc(libc::CLOCK_MONOTONIC, libc::CLOCK_MONOTONIC, 5).unwrap();
        assert!(sample.offset_ns.abs() < 1_000_000, "offset was {}", sample.offset_ns);
        assert!(sample.delay_ns.unwrap() >= 0);
    }
}
