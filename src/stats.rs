//! Rolling statistics aggregator (spec §4.8).
//!
//! A much simpler cousin of `dantesync::spike_filter::SpikeFilter`'s rolling
//! window bookkeeping: instead of MAD-based outlier rejection, this just
//! accumulates sums for rms/mean/stddev and resets on a fixed sample count.

/// Accumulates one quantity (offset, freq, or delay) over a batch window.
#[derive(Debug, Default, Clone)]
struct Accumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
    max_abs: f64,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.max_abs = self.max_abs.max(value.abs());
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        }
    }

    fn stddev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            let mean = self.mean();
            ((self.sum_sq / self.count as f64) - mean * mean).max(0.0).sqrt()
        }
    }
}

/// A completed batch summary, ready to log (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct StatsSummary {
    pub offset_rms_ns: f64,
    pub offset_max_ns: f64,
    pub freq_mean_ppb: f64,
    pub freq_stddev_ppb: f64,
    pub delay_mean_ns: Option<f64>,
    pub delay_stddev_ns: Option<f64>,
}

/// Three independent rolling aggregators over (offset, freq, delay), reset
/// every `stats_max_count` offset samples (spec §4.8, invariant 6).
pub struct StatsAggregator {
    max_count: u64,
    offset: Accumulator,
    freq: Accumulator,
    delay: Accumulator,
}

impl StatsAggregator {
    pub fn new(max_count: u64) -> Self {
        StatsAggregator {
            max_count,
            offset: Accumulator::default(),
            freq: Accumulator::default(),
            delay: Accumulator::default(),
        }
    }

    #[cfg(test)]
    pub fn offset_count_for_test(&self) -> u64 {
        self.offset.count
    }

    /// Push one sample. Returns `Some(summary)` and resets all three
    /// aggregators exactly when the offset aggregator reaches `max_count`.
    pub fn push(&mut self, offset_ns: i64, freq_ppb: f64, delay_ns: Option<i64>) -> Option<StatsSummary> {
        self.offset.push(offset_ns as f64);
        self.freq.push(freq_ppb);
        if let Some(delay) = delay_ns {
            self.delay.push(delay as f64);
        }

        if self.offset.count >= self.max_count {
            let summary = StatsSummary {
                offset_rms_ns: self.offset.rms(),
                offset_max_ns: self.offset.max_abs,
                freq_mean_ppb: self.freq.mean(),
                freq_stddev_ppb: self.freq.stddev(),
                delay_mean_ns: (self.delay.count > 0).then(|| self.delay.mean()),
                delay_stddev_ns: (self.delay.count > 0).then(|| self.delay.stddev()),
            };
            self.offset = Accumulator::default();
            self.freq = Accumulator::default();
            self.delay = Accumulator::default();
            Some(summary)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_exactly_one_summary_per_window_and_resets() {
        let mut stats = StatsAggregator::new(3);
        assert!(stats.push(10, 1.0, None).is_none());
        assert!(stats.push(-10, 2.0, None).is_none());
        let summary = stats.push(20, 3.0, None).expect("third sample completes the window");
        assert_eq!(summary.offset_max_ns, 20.0);
        assert!((summary.freq_mean_ppb - 2.0).abs() < 1e-9);

        // Aggregators are empty immediately after (invariant 6).
        assert_eq!(stats.offset.count, 0);
        assert_eq!(stats.freq.count, 0);
        assert_eq!(stats.delay.count, 0);
    }

    #[test]
    fn delay_stats_absent_when_no_delay_pushed() {
        let mut stats = StatsAggregator::new(1);
        let summary = stats.push(5, 0.0, None).unwrap();
        assert!(summary.delay_mean_ns.is_none());
        assert!(summary.delay_stddev_ns.is_none());
    }

    #[test]
    fn delay_stats_present_when_delay_pushed() {
        let mut stats = StatsAggregator::new(2);
        stats.push(5, 0.0, Some(100));
        let summary = stats.push(5, 0.0, Some(200)).unwrap();
        assert_eq!(summary.delay_mean_ns, Some(150.0));
    }

    #[test]
    fn rms_reflects_magnitude_not_just_mean() {
        let mut stats = StatsAggregator::new(2);
        stats.push(100, 0.0, None);
        let summary = stats.push(-100, 0.0, None).unwrap();
        // mean is 0 but rms should not be
        assert!(summary.offset_rms_ns > 0.0);
        assert!((summary.offset_rms_ns - 100.0).abs() < 1e-9);
    }
}
