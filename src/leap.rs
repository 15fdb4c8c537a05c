//! UTC offset and leap-second tracker (spec §4.6).
//!
//! Keeps `sync_offset` current, arms/clears the kernel leap flag through
//! [`ClockAdj::set_leap`], and tells the update path when a sample falls in
//! the ambiguous second around a leap boundary. Grounded in the same
//! `chrono`-based UTC decomposition `dantesync::rtc::update_rtc` uses to go
//! from a raw timestamp to calendar fields.

use std::mem;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use log::{debug, warn};

use crate::clock::{ClockAdj, LeapDirection};

pub const PMC_UPDATE_INTERVAL_NS: u64 = 60_000_000_000;

/// A fresh read of `CLOCK_REALTIME`, in nanoseconds since the epoch. The
/// leap is defined on UTC, so classification always needs the real-time
/// clock's notion of "now" rather than a PHC-derived timestamp.
fn read_realtime_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// What the update path should do with the sample that triggered this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapAction {
    /// Keep processing the sample normally.
    Proceed,
    /// Drop the sample; it falls in the ambiguous second (or a PMC refresh
    /// was just performed and the caller chooses to be conservative).
    Suspend,
}

/// Tracks the TAI/UTC integer-second gap and any pending leap second.
pub struct LeapTracker {
    pub sync_offset: i64,
    pub direction: i8,
    pub leap: i8,
    pub leap_set: i8,
    pub kernel_leap: bool,
    pub slave_is_rtc: bool,
    last_pmc_poll_ns: Option<u64>,
}

impl LeapTracker {
    pub fn new(sync_offset: i64, direction: i8, kernel_leap: bool, slave_is_rtc: bool) -> Self {
        LeapTracker {
            sync_offset,
            direction,
            leap: 0,
            leap_set: 0,
            kernel_leap,
            slave_is_rtc,
            last_pmc_poll_ns: None,
        }
    }

    /// Wrap-safe "has at least `interval` elapsed" check (spec §9 Open
    /// Question: use a signed, wrap-tolerant comparison rather than a bare
    /// `ts - last < interval`).
    fn due(&self, ts_ns: u64, interval_ns: u64) -> bool {
        match self.last_pmc_poll_ns {
            None => true,
            Some(last) => ts_ns.wrapping_sub(last) >= interval_ns,
        }
    }

    pub fn mark_pmc_polled(&mut self, ts_ns: u64) {
        self.last_pmc_poll_ns = Some(ts_ns);
    }

    pub fn pmc_due(&self, ts_ns: u64) -> bool {
        self.due(ts_ns, PMC_UPDATE_INTERVAL_NS)
    }

    fn is_ambiguous_second(ts_ns: u64) -> bool {
        let secs = (ts_ns / 1_000_000_000) as i64;
        let dt: DateTime<Utc> = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        dt.time() == NaiveTime::from_hms_opt(23, 59, 59).unwrap()
    }

    /// Run one update-path check (spec §4.6 algorithm). `clock` is the
    /// slave's `ClockAdj`, used only to arm/clear the kernel leap flag.
    pub fn update<C: ClockAdj>(&mut self, clock: &mut C, offset_ns: i64, ts_ns: u64, servo_unlocked: bool) -> LeapAction {
        if self.leap == 0 && self.leap_set == 0 {
            return LeapAction::Proceed;
        }

        // The leap is defined on UTC; a PHC-slave's `ts` is not UTC, so
        // classification always needs a fresh real-time-clock read instead
        // (spec §4.6 step 3, first clause).
        let mut classify_ts = if self.slave_is_rtc { ts_ns } else { read_realtime_ns() };
        if self.slave_is_rtc && servo_unlocked {
            let fold = self.sync_offset * 1_000_000_000 * self.direction as i64;
            classify_ts = (classify_ts as i64 - offset_ns - fold).max(0) as u64;
        }

        if (self.leap != 0 || self.leap_set != 0) && Self::is_ambiguous_second(classify_ts) {
            warn!("leap boundary ambiguous at ts={}ns; suspending sample", classify_ts);
            return LeapAction::Suspend;
        }

        let target_direction = if self.leap != 0 { self.leap } else { 0 };

        if target_direction != self.leap_set {
            if self.leap_set != 0 && target_direction == 0 {
                // A previously armed leap has just been consumed. An
                // insertion (LEAP_61, leap_set = +1) grows TAI-UTC by one
                // second; a deletion (LEAP_59, leap_set = -1) shrinks it.
                self.sync_offset += self.leap_set as i64;
                self.leap = 0;
                debug!("leap consumed; sync_offset now {}", self.sync_offset);
            }

            if self.slave_is_rtc && self.kernel_leap {
                let direction = match target_direction {
                    d if d > 0 => LeapDirection::Insert,
                    d if d < 0 => LeapDirection::Delete,
                    _ => LeapDirection::None,
                };
                if let Err(e) = clock.set_leap(direction) {
                    warn!("set_leap failed: {}", e);
                } else {
                    self.leap_set = target_direction;
                }
            } else {
                self.leap_set = target_direction;
            }
        }

        LeapAction::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClockAdj;

    #[test]
    fn proceeds_when_no_leap_pending() {
        let mut clock = MockClockAdj::new();
        let mut tracker = LeapTracker::new(37, 1, true, true);
        let action = tracker.update(&mut clock, 0, 1_000_000_000, false);
        assert_eq!(action, LeapAction::Proceed);
    }

    #[test]
    fn ambiguous_second_predicate_matches_only_last_second_of_day() {
        // 2016-12-31T23:59:59 UTC was the last second before a leap insertion.
        let ts = chrono::Utc.with_ymd_and_hms(2016, 12, 31, 23, 59, 59).unwrap();
        let ts_ns = ts.timestamp() as u64 * 1_000_000_000;
        assert!(LeapTracker::is_ambiguous_second(ts_ns));

        let not_ambiguous = ts_ns - 1_000_000_000;
        assert!(!LeapTracker::is_ambiguous_second(not_ambiguous));
    }

    #[test]
    fn suspends_samples_during_ambiguous_second() {
        let mut clock = MockClockAdj::new();
        let mut tracker = LeapTracker::new(36, 1, true, true);
        tracker.leap = 1;
        let ts = chrono::Utc.with_ymd_and_hms(2016, 12, 31, 23, 59, 59).unwrap();
        let ts_ns = ts.timestamp() as u64 * 1_000_000_000;
        let action = tracker.update(&mut clock, 0, ts_ns, true);
        assert_eq!(action, LeapAction::Suspend);
    }

    #[test]
    fn arms_kernel_leap_when_direction_changes_and_slave_is_rtc() {
        let mut clock = MockClockAdj::new();
        clock
            .expect_set_leap()
            .withf(|d| *d == LeapDirection::Insert)
            .times(1)
            .returning(|_| Ok(()));

        let mut tracker = LeapTracker::new(36, 1, true, true);
        tracker.leap = 1;
        // Not in the ambiguous second, so the armed-direction update runs.
        let action = tracker.update(&mut clock, 0, 0, false);
        assert_eq!(action, LeapAction::Proceed);
        assert_eq!(tracker.leap_set, 1);
    }

    #[test]
    fn consuming_an_insertion_increments_sync_offset() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_leap().times(1).returning(|_| Ok(()));

        let mut tracker = LeapTracker::new(36, 1, true, true);
        tracker.leap = 0;
        tracker.leap_set = 1; // armed LEAP_61 insertion about to be consumed
        tracker.update(&mut clock, 0, 0, false);
        assert_eq!(tracker.sync_offset, 37);
        assert_eq!(tracker.leap_set, 0);
    }

    #[test]
    fn pmc_due_check_is_wrap_safe() {
        let tracker = LeapTracker::new(0, 0, false, false);
        assert!(tracker.pmc_due(0));
    }
}
