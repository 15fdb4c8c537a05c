//! The PI servo contract (spec §4.5).
//!
//! Grounded on `dantesync::servo::PiServo` (kp/ki accumulation, integral
//! clamp, the `sample(offset) -> adjustment` shape and its unit tests),
//! adapted to the tri-state {UNLOCKED, JUMP, LOCKED} output and ppb units
//! this spec requires instead of the teacher's ppm two-state output.

use log::debug;

use crate::clock::MAX_FREQ_PPB;

/// Action the engine takes based on the servo's internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    /// Still converging; no clock action this sample.
    Unlocked,
    /// Offset exceeded the step threshold; caller must `step()` then `set_freq()`.
    Jump,
    /// Steady state; caller applies the returned frequency only.
    Locked,
}

/// Converts `(offset_ns, ts_ns)` samples into a frequency correction and a
/// tri-state action. The engine treats implementations as a black box
/// except for the state it returns (spec §4.5).
pub trait Servo {
    fn sample(&mut self, offset_ns: i64, ts_ns: u64) -> (f64, ServoState);

    /// Re-arm the controller (e.g. after a step or a grandmaster change).
    fn reset(&mut self);
}

/// Default PI controller: `kp = 0.7`, `ki = 0.3`, clamp `±512000` ppb, with
/// an optional step threshold (disabled by default, per spec §4.5).
pub struct PiServo {
    kp: f64,
    ki: f64,
    integral: f64,
    step_threshold_ns: Option<i64>,
    locked_count: u32,
}

/// Consecutive in-range samples required before the first LOCKED verdict,
/// so a single lucky sample right after a JUMP doesn't immediately read
/// as steady state.
const LOCK_SETTLE_SAMPLES: u32 = 2;

impl PiServo {
    pub fn new(kp: f64, ki: f64, step_threshold_ns: Option<i64>) -> Self {
        PiServo {
            kp,
            ki,
            integral: 0.0,
            step_threshold_ns,
            locked_count: 0,
        }
    }

    /// Seed the controller with the clock's current free-running frequency,
    /// negated, so an immediate `set_freq(-ppb)` is a no-op (spec invariant 1,
    /// §4.5: "the initial controller input is the observed free-running
    /// frequency (negated)").
    pub fn with_initial_freq(kp: f64, ki: f64, step_threshold_ns: Option<i64>, freq_ppb: f64) -> Self {
        let mut servo = Self::new(kp, ki, step_threshold_ns);
        servo.integral = freq_ppb;
        servo
    }
}

impl Servo for PiServo {
    fn sample(&mut self, offset_ns: i64, _ts_ns: u64) -> (f64, ServoState) {
        if let Some(threshold) = self.step_threshold_ns {
            if offset_ns.abs() as i64 > threshold {
                self.reset();
                debug!("servo: offset {}ns exceeds step threshold {}ns -> JUMP", offset_ns, threshold);
                return (0.0, ServoState::Jump);
            }
        }

        let error = -(offset_ns as f64);
        self.integral += error * self.ki;
        self.integral = self.integral.clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);

        let proportional = error * self.kp;
        let ppb = (proportional + self.integral).clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);

        // A small fixed band stands in for "locked" since the spec leaves
        // the exact lock predicate to the servo implementation.
        if offset_ns.abs() < 1_000 {
            self.locked_count = self.locked_count.saturating_add(1);
        } else {
            self.locked_count = 0;
        }

        let state = if self.locked_count >= LOCK_SETTLE_SAMPLES {
            ServoState::Locked
        } else {
            ServoState::Unlocked
        };

        debug!(
            "servo: offset={}ns err={:.1} P={:.3} I={:.3} ppb={:.3} state={:?}",
            offset_ns, error, proportional, self.integral, ppb, state
        );

        (ppb, state)
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.locked_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_matches_kp() {
        let mut servo = PiServo::new(0.001, 0.0, None);
        let (ppb, _) = servo.sample(1000, 0);
        assert!((ppb - -1.0).abs() < 1e-6);
    }

    #[test]
    fn integral_accumulates_across_samples() {
        let mut servo = PiServo::new(0.0, 0.001, None);
        let (ppb1, _) = servo.sample(1000, 0);
        assert!((ppb1 - -1.0).abs() < 1e-6);
        let (ppb2, _) = servo.sample(1000, 0);
        assert!((ppb2 - -2.0).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_integral() {
        let mut servo = PiServo::new(0.0, 0.001, None);
        servo.sample(1000, 0);
        servo.reset();
        let (ppb, _) = servo.sample(0, 0);
        assert_eq!(ppb, 0.0);
    }

    #[test]
    fn output_clamps_to_max_freq_ppb() {
        let mut servo = PiServo::new(1.0, 0.0, None);
        let (ppb, _) = servo.sample(1_000_000_000, 0);
        assert_eq!(ppb, -MAX_FREQ_PPB);
    }

    #[test]
    fn step_threshold_triggers_jump_and_resets_integral() {
        let mut servo = PiServo::new(0.001, 0.001, Some(100_000));
        servo.sample(50, 0); // builds up a little integral
        let (ppb, state) = servo.sample(2_000_000_000, 0);
        assert_eq!(state, ServoState::Jump);
        assert_eq!(ppb, 0.0);
        assert_eq!(servo.integral, 0.0);
    }

    #[test]
    fn settles_into_locked_after_consecutive_small_offsets() {
        let mut servo = PiServo::new(0.001, 0.0, None);
        let (_, s1) = servo.sample(10, 0);
        assert_eq!(s1, ServoState::Unlocked);
        let (_, s2) = servo.sample(10, 0);
        assert_eq!(s2, ServoState::Locked);
    }

    #[test]
    fn with_initial_freq_seeds_integral_so_set_freq_negated_is_noop() {
        let servo = PiServo::with_initial_freq(0.7, 0.3, None, 37.5);
        assert_eq!(servo.integral, 37.5);
    }
}
