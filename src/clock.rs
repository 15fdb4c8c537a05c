//! Clock adjustment capability: the thin interface the sync engine steers.
//!
//! Grounded on `clock-steering::unix::UnixClock` (adjtimex-based frequency
//! and step control, `STA_INS`/`STA_DEL` leap flags) and
//! `dantesync::clock::linux::LinuxClock` (the `adjtimex`/`settimeofday`
//! call shape and the restore-on-drop pattern).

use std::mem;

use libc::{clockid_t, timespec, timex};
use thiserror::Error;

/// Maximum frequency adjustment accepted by [`ClockAdj::set_freq`], in ppb.
pub const MAX_FREQ_PPB: f64 = 512_000.0;

const CLOCKFD: clockid_t = 3;

/// Turn an open device fd into the dynamic `clockid_t` the kernel
/// understands, per the standard Linux PHC convention.
pub fn fd_to_clockid(fd: std::os::unix::io::RawFd) -> clockid_t {
    (!(fd as clockid_t) << 3) | CLOCKFD
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient permissions to adjust this clock")]
    NoPermission,
    #[error("clock device has gone away")]
    NoDevice,
    #[error("invalid clock operation")]
    Invalid,
    #[error("operation not supported by this clock")]
    NotSupported,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    fn from_errno() -> Self {
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINVAL) => Error::Invalid,
            Some(libc::ENODEV) => Error::NoDevice,
            Some(libc::EOPNOTSUPP) => Error::NotSupported,
            Some(libc::EPERM) | Some(libc::EACCES) => Error::NoPermission,
            _ => Error::Io(std::io::Error::last_os_error()),
        }
    }
}

/// Leap-second direction to arm (or clear) in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapDirection {
    Insert,
    Delete,
    None,
}

/// Capability contract the sync engine steers. See spec §4.1.
///
/// A silent failure of `get_freq` must be treated as 0 ppb by the caller;
/// `set_freq`/`step`/`set_leap` surface errors so the update path can log
/// and continue (per spec §7, these never abort the loop).
#[cfg_attr(test, mockall::automock)]
pub trait ClockAdj {
    fn get_freq(&self) -> f64;
    fn set_freq(&mut self, ppb: f64) -> Result<(), Error>;
    fn step(&mut self, delta_ns: i64) -> Result<(), Error>;
    fn set_leap(&mut self, direction: LeapDirection) -> Result<(), Error>;
}

fn empty_timex() -> timex {
    unsafe { mem::zeroed() }
}

/// A clock steered through `clock_adjtime(2)` / `adjtimex(2)`.
///
/// `clkid == CLOCK_REALTIME` routes through `adjtimex`; any other id
/// (typically a PHC opened via [`fd_to_clockid`]) routes through
/// `clock_adjtime`, exactly as `clock-steering::unix::UnixClock` does.
pub struct LinuxClockAdj {
    clkid: clockid_t,
    original_freq: i64,
}

impl LinuxClockAdj {
    pub fn open(clkid: clockid_t) -> Result<Self, Error> {
        let mut tx = empty_timex();
        let mut clock = LinuxClockAdj {
            clkid,
            original_freq: 0,
        };
        clock.adjtime(&mut tx)?;
        clock.original_freq = tx.freq;
        Ok(clock)
    }

    fn adjtime(&self, tx: &mut timex) -> Result<(), Error> {
        let ret = if self.clkid == libc::CLOCK_REALTIME {
            unsafe { libc::adjtimex(tx) }
        } else {
            unsafe { libc::clock_adjtime(self.clkid, tx) }
        };
        if ret < 0 {
            Err(Error::from_errno())
        } else {
            Ok(())
        }
    }

    fn clock_gettime(&self) -> Result<timespec, Error> {
        let mut ts: timespec = unsafe { mem::zeroed() };
        let ret = unsafe { libc::clock_gettime(self.clkid, &mut ts) };
        if ret < 0 {
            Err(Error::from_errno())
        } else {
            Ok(ts)
        }
    }

    fn clock_settime(&self, ts: timespec) -> Result<(), Error> {
        let ret = unsafe { libc::clock_settime(self.clkid, &ts) };
        if ret < 0 {
            Err(Error::from_errno())
        } else {
            Ok(())
        }
    }
}

impl ClockAdj for LinuxClockAdj {
    fn get_freq(&self) -> f64 {
        let mut tx = empty_timex();
        match self.adjtime(&mut tx) {
            // timex.freq is ppm in units of 2^-16; ppm -> ppb is *1000.
            Ok(()) => tx.freq as f64 * 1000.0 / 65536.0,
            Err(_) => 0.0,
        }
    }

    fn set_freq(&mut self, ppb: f64) -> Result<(), Error> {
        let ppb = ppb.clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);
        let mut tx = empty_timex();
        tx.modes = libc::ADJ_FREQUENCY;
        // timex.freq is ppm in units of 2^-16; ppb -> ppm is /1000.
        tx.freq = ((ppb / 1000.0) * 65536.0) as i64;
        self.adjtime(&mut tx)
    }

    fn step(&mut self, delta_ns: i64) -> Result<(), Error> {
        let mut ts = self.clock_gettime()?;
        let mut nanos = ts.tv_nsec + delta_ns % 1_000_000_000;
        let mut secs = ts.tv_sec + delta_ns / 1_000_000_000;
        while nanos >= 1_000_000_000 {
            nanos -= 1_000_000_000;
            secs += 1;
        }
        while nanos < 0 {
            nanos += 1_000_000_000;
            secs -= 1;
        }
        ts.tv_sec = secs;
        ts.tv_nsec = nanos;
        self.clock_settime(ts)
    }

    fn set_leap(&mut self, direction: LeapDirection) -> Result<(), Error> {
        let mut tx = empty_timex();
        self.adjtime(&mut tx)?;
        tx.modes = libc::MOD_STATUS;
        tx.status &= !(libc::STA_INS | libc::STA_DEL);
        tx.status |= match direction {
            LeapDirection::Insert => libc::STA_INS,
            LeapDirection::Delete => libc::STA_DEL,
            LeapDirection::None => 0,
        };
        self.adjtime(&mut tx)
    }
}

impl Drop for LinuxClockAdj {
    fn drop(&mut self) {
        let mut tx = empty_timex();
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = self.original_freq;
        let _ = self.adjtime(&mut tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_to_clockid_roundtrip_shape() {
        // The dynamic clockid for fd 3 is (~3 << 3) | 3.
        assert_eq!(fd_to_clockid(3), (!3i32 << 3) | 3);
    }

    #[test]
    fn set_freq_clamps_to_limit() {
        // Pure unit check of the clamp math shared with set_freq (no real clock touched).
        let clamped = 600_000.0_f64.clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);
        assert_eq!(clamped, MAX_FREQ_PPB);
        let clamped_neg = (-600_000.0_f64).clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);
        assert_eq!(clamped_neg, -MAX_FREQ_PPB);
    }
}
