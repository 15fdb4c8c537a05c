//! Sync engine: loop mode selection, loop drivers, and the update path
//! (spec §4.3/§4.4). Grounded in `dantesync::controller::PtpController`'s
//! overall shape (a generic struct over swappable collaborators, driven by
//! a cooperative single-threaded loop) but replaces its Dante-specific
//! rate servo with the offset/PI pipeline this crate implements.

use std::os::unix::io::RawFd;

use anyhow::{anyhow, Result};
use libc::clockid_t;
use log::{info, warn};

use crate::clock::ClockAdj;
use crate::leap::LeapAction;
use crate::leap::LeapTracker;
use crate::measure::{self, Sample};
use crate::pmc::{Pmc, Transport};
use crate::servo::{Servo, ServoState};
use crate::stats::StatsAggregator;

/// Optional management-client handle bundled with the flags that gate which
/// data sets it is allowed to request (spec §4.7).
pub struct PmcHandle<T: Transport> {
    pub pmc: Pmc,
    pub transport: T,
    pub wait_sync: bool,
    pub get_utc_offset: bool,
}

/// One process-lifetime clock context (spec §3).
pub struct ClockContext<C: ClockAdj, S: Servo, T: Transport> {
    pub clock: C,
    pub servo: S,
    pub servo_state: ServoState,
    pub source_label: &'static str,
    pub stats: Option<StatsAggregator>,
    pub leap: LeapTracker,
    pub pmc: Option<PmcHandle<T>>,
}

impl<C: ClockAdj, S: Servo, T: Transport> ClockContext<C, S, T> {
    pub fn new(
        clock: C,
        servo: S,
        source_label: &'static str,
        stats_max_count: u64,
        leap: LeapTracker,
        pmc: Option<PmcHandle<T>>,
    ) -> Self {
        ClockContext {
            clock,
            servo,
            servo_state: ServoState::Unlocked,
            source_label,
            stats: (stats_max_count > 0).then(|| StatsAggregator::new(stats_max_count)),
            leap,
            pmc,
        }
    }

    /// Run one non-blocking management poll if due (spec §4.6 step 1). Never
    /// drops the sample merely for polling.
    fn poll_pmc_if_due(&mut self, ts_ns: u64) {
        if let Some(handle) = self.pmc.as_mut() {
            if self.leap.pmc_due(ts_ns) {
                let outcome = handle.pmc.run(
                    &mut handle.transport,
                    0,
                    handle.wait_sync,
                    handle.get_utc_offset,
                    &mut self.leap.sync_offset,
                    &mut self.leap.leap,
                );
                match outcome {
                    Ok(_) => self.leap.mark_pmc_polled(ts_ns),
                    Err(e) => warn!("management poll failed, will retry next cycle: {}", e),
                }
            }
        }
    }

    /// The update path (spec §4.4): leap gate, sync-offset fold, servo,
    /// clock action, stats/log.
    pub fn update(&mut self, offset_ns: i64, ts_ns: u64, delay_ns: Option<i64>) -> Result<()> {
        self.poll_pmc_if_due(ts_ns);

        let servo_unlocked = self.servo_state != ServoState::Locked;
        let action = self.leap.update(&mut self.clock, offset_ns, ts_ns, servo_unlocked);
        if action == LeapAction::Suspend {
            return Ok(());
        }

        let mut offset_ns = offset_ns;
        if self.leap.direction != 0 {
            offset_ns += self.leap.sync_offset * 1_000_000_000 * self.leap.direction as i64;
        }

        let (ppb, state) = self.servo.sample(offset_ns, ts_ns);
        self.servo_state = state;

        match state {
            ServoState::Unlocked => {}
            ServoState::Jump => {
                self.clock.step(-offset_ns)?;
                self.clock.set_freq(-ppb)?;
            }
            ServoState::Locked => {
                self.clock.set_freq(-ppb)?;
            }
        }

        match self.stats.as_mut() {
            Some(stats) => {
                if let Some(summary) = stats.push(offset_ns, ppb, delay_ns) {
                    info!(
                        "{}: batch rms={:.1}ns max={:.1}ns freq_mean={:.1}ppb freq_stddev={:.1}ppb",
                        self.source_label, summary.offset_rms_ns, summary.offset_max_ns, summary.freq_mean_ppb, summary.freq_stddev_ppb
                    );
                }
            }
            None => {
                info!(
                    "{} offset={}ns state={:?} freq={:.1}ppb delay={}",
                    self.source_label,
                    offset_ns,
                    state,
                    ppb,
                    delay_ns.map(|d| format!("{}ns", d)).unwrap_or_else(|| "-".to_string())
                );
            }
        }

        Ok(())
    }
}

/// How the loop driver obtains measurement samples (spec §4.3).
pub enum LoopMode {
    /// Block on a PPS device; optionally cross-check against a companion
    /// master PHC to anchor the integer-second part.
    Pps {
        pps_fd: RawFd,
        companion_phc: Option<(clockid_t, clockid_t, u32)>,
    },
    /// Rate-limited kernel-assisted cross-read between the system clock and
    /// a PHC.
    Sysoff { phc_fd: RawFd, rate_hz: u32, n_samples: u32 },
    /// Rate-limited dual-clock quickest-read.
    Phc {
        reference: clockid_t,
        source: clockid_t,
        rate_hz: u32,
        n_samples: u32,
    },
}

/// Selects a loop mode given what the boot sequence established (spec
/// §4.3 steps 1-3).
pub fn select_mode(
    pps_fd: Option<RawFd>,
    companion_phc: Option<(clockid_t, clockid_t, u32)>,
    slave_is_rtc: bool,
    sysoff_probe_fd: Option<RawFd>,
    reference: clockid_t,
    source: clockid_t,
    rate_hz: u32,
    n_samples: u32,
) -> LoopMode {
    if let Some(fd) = pps_fd {
        return LoopMode::Pps { pps_fd: fd, companion_phc };
    }
    if slave_is_rtc {
        if let Some(phc_fd) = sysoff_probe_fd {
            if measure::sysoff_probe(phc_fd) {
                return LoopMode::Sysoff { phc_fd, rate_hz, n_samples };
            }
        }
    }
    LoopMode::Phc { reference, source, rate_hz, n_samples }
}

fn pps_with_companion(pps_sample: Sample, reference: clockid_t, phc_clockid: clockid_t, n: u32) -> Result<Option<Sample>> {
    let phc = measure::read_phc(reference, phc_clockid, n)?;
    let phc_ts_prime = phc.ts_ns as i64 - phc.offset_ns;
    let remainder = phc_ts_prime.rem_euclid(1_000_000_000);
    if remainder > measure::phc_pps_offset_limit_ns() {
        warn!("PPS not aligned with companion PHC: remainder={}ns", remainder);
        return Ok(None);
    }
    let truncated = phc_ts_prime - remainder;
    let pps_offset = pps_sample.ts_ns as i64 - truncated;
    Ok(Some(Sample {
        offset_ns: pps_offset,
        ts_ns: pps_sample.ts_ns,
        delay_ns: None,
    }))
}

/// Drive the selected loop mode forever, calling `ctx.update` for every
/// accepted sample (spec §4.3, §5). Returns only on a fatal measurement
/// error.
pub fn run<C: ClockAdj, S: Servo, T: Transport>(ctx: &mut ClockContext<C, S, T>, mode: &LoopMode) -> Result<()> {
    loop {
        match mode {
            LoopMode::Pps { pps_fd, companion_phc } => {
                let pps_sample = match measure::read_pps(*pps_fd) {
                    Ok(s) => s,
                    Err(e) => {
                        unsafe { libc::close(*pps_fd) };
                        return Err(anyhow!("PPS read failed: {}", e));
                    }
                };

                let sample = if let Some((reference, phc_clockid, n)) = companion_phc {
                    match pps_with_companion(pps_sample, *reference, *phc_clockid, *n) {
                        Ok(Some(s)) => s,
                        Ok(None) => continue,
                        Err(e) => {
                            unsafe { libc::close(*pps_fd) };
                            return Err(anyhow!("companion PHC read failed: {}", e));
                        }
                    }
                } else {
                    pps_sample
                };

                ctx.update(sample.offset_ns, sample.ts_ns, None)?;
            }
            LoopMode::Sysoff { phc_fd, rate_hz, n_samples } => {
                measure::sleep_for_rate(*rate_hz);
                let sample = measure::sysoff_measure(*phc_fd, *n_samples).map_err(|e| anyhow!("sysoff_measure failed: {}", e))?;
                ctx.update(sample.offset_ns, sample.ts_ns, sample.delay_ns)?;
            }
            LoopMode::Phc { reference, source, rate_hz, n_samples } => {
                measure::sleep_for_rate(*rate_hz);
                match measure::read_phc(*reference, *source, *n_samples) {
                    Ok(sample) => ctx.update(sample.offset_ns, sample.ts_ns, sample.delay_ns)?,
                    Err(e) => {
                        warn!("read_phc failed, skipping sample: {}", e);
                        continue;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClockAdj;
    use crate::pmc::MockTransport;

    struct ScriptedServo {
        script: Vec<(f64, ServoState)>,
        idx: usize,
    }

    impl Servo for ScriptedServo {
        fn sample(&mut self, _offset_ns: i64, _ts_ns: u64) -> (f64, ServoState) {
            let v = self.script[self.idx.min(self.script.len() - 1)];
            self.idx += 1;
            v
        }
        fn reset(&mut self) {
            self.idx = 0;
        }
    }

    fn no_leap_tracker() -> LeapTracker {
        LeapTracker::new(0, 0, false, false)
    }

    #[test]
    fn locked_state_calls_set_freq_once_with_negated_ppb_and_no_step() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_freq().withf(|ppb| (*ppb - (-12.5)).abs() < 1e-9).times(1).returning(|_| Ok(()));
        clock.expect_step().times(0);

        let servo = ScriptedServo { script: vec![(12.5, ServoState::Locked)], idx: 0 };
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 0, no_leap_tracker(), None);
        ctx.update(100, 0, None).unwrap();
    }

    #[test]
    fn jump_state_steps_then_sets_freq_in_order() {
        let mut clock = MockClockAdj::new();
        let mut seq = mockall::Sequence::new();
        clock.expect_step().withf(|d| *d == -2_000_000_000).times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        clock.expect_set_freq().times(1).in_sequence(&mut seq).returning(|_| Ok(()));

        let servo = ScriptedServo { script: vec![(0.0, ServoState::Jump)], idx: 0 };
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 0, no_leap_tracker(), None);
        ctx.update(2_000_000_000, 0, None).unwrap();
    }

    #[test]
    fn unlocked_state_takes_no_clock_action() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_freq().times(0);
        clock.expect_step().times(0);

        let servo = ScriptedServo { script: vec![(0.0, ServoState::Unlocked)], idx: 0 };
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 0, no_leap_tracker(), None);
        ctx.update(5_000, 0, None).unwrap();
    }

    #[test]
    fn zero_direction_and_no_leap_leaves_offset_untouched() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_freq().times(1).returning(|_| Ok(()));

        struct CapturingServo(Option<i64>);
        impl Servo for CapturingServo {
            fn sample(&mut self, offset_ns: i64, _ts_ns: u64) -> (f64, ServoState) {
                self.0 = Some(offset_ns);
                (0.0, ServoState::Locked)
            }
            fn reset(&mut self) {}
        }

        let servo = CapturingServo(None);
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 0, no_leap_tracker(), None);
        ctx.update(4242, 7, None).unwrap();
        assert_eq!(ctx.servo.0, Some(4242));
    }

    #[test]
    fn forced_direction_folds_sync_offset_into_servo_input() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_freq().times(1).returning(|_| Ok(()));

        struct CapturingServo(Option<i64>);
        impl Servo for CapturingServo {
            fn sample(&mut self, offset_ns: i64, _ts_ns: u64) -> (f64, ServoState) {
                self.0 = Some(offset_ns);
                (0.0, ServoState::Locked)
            }
            fn reset(&mut self) {}
        }

        let servo = CapturingServo(None);
        let leap = LeapTracker::new(37, -1, false, false);
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 0, leap, None);
        ctx.update(1_000, 0, None).unwrap();
        assert_eq!(ctx.servo.0, Some(1_000 - 37_000_000_000));
    }

    #[test]
    fn stats_configured_suppresses_per_sample_log_path_until_window_closes() {
        let mut clock = MockClockAdj::new();
        clock.expect_set_freq().times(2).returning(|_| Ok(()));

        let servo = ScriptedServo {
            script: vec![(0.0, ServoState::Locked), (0.0, ServoState::Locked)],
            idx: 0,
        };
        let mut ctx: ClockContext<_, _, MockTransport> = ClockContext::new(clock, servo, "test", 2, no_leap_tracker(), None);
        ctx.update(10, 0, None).unwrap();
        assert!(ctx.stats.as_ref().unwrap().offset_count_for_test() == 1);
        ctx.update(20, 0, None).unwrap();
        assert!(ctx.stats.as_ref().unwrap().offset_count_for_test() == 0);
    }
}
