//! C4: the two-phase (learn/detect) statistical engine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{DetectorError, Result};
use crate::telemetry::TelemetrySample;

bitflags! {
    /// Anomaly flag bitmask.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AnomalyFlags: u8 {
        const CACHE_MISS_SPIKE = 1 << 0;
        const BRANCH_MISS_SPIKE = 1 << 1;
        const IPC_COLLAPSE = 1 << 2;
        const BURST_PATTERN = 1 << 3;
        const OSCILLATION = 1 << 4;
    }
}

impl AnomalyFlags {
    /// Space-separated flag names for the alert `reason` field.
    /// Returns an owned, small string rather than a thread-local scratch
    /// buffer.
    pub fn describe(self) -> String {
        let names = [
            (Self::CACHE_MISS_SPIKE, "CACHE_MISS_SPIKE"),
            (Self::BRANCH_MISS_SPIKE, "BRANCH_MISS_SPIKE"),
            (Self::IPC_COLLAPSE, "IPC_COLLAPSE"),
            (Self::BURST_PATTERN, "BURST_PATTERN"),
            (Self::OSCILLATION, "OSCILLATION"),
        ];
        names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Running mean/variance accumulator for one metric. Spec §9 names the
/// single-pass `E[X^2] - E[X]^2` formula as the O(1)-memory baseline
/// design and explicitly sanctions substituting Welford's method for
/// tighter numerical stability "without changing any externally
/// observable property other than tighter std values on ill-conditioned
/// inputs" — used here because the naive formula leaves visible rounding
/// noise in `std` even for an exactly-flat input stream (every repeated
/// value cancels exactly in Welford's incremental form, never in the
/// squared-sums form).
#[derive(Clone, Copy, Debug, Default)]
struct RunningStat {
    mean: f64,
    m2: f64,
    count: u64,
}

impl RunningStat {
    fn observe(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    fn finalize(&self) -> (f64, f64) {
        if self.count == 0 {
            return (0.0, 0.0);
        }
        let variance = (self.m2 / self.count as f64).max(0.0);
        (self.mean, variance.sqrt())
    }
}

/// Mean/std/sample-count/ready latch for the three derived ratios (spec
/// §3). `ready` transitions `false -> true` exactly once and never
/// regresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct BaselineProfile {
    pub mean_cache_miss_rate: f64,
    pub std_cache_miss_rate: f64,
    pub mean_branch_miss_rate: f64,
    pub std_branch_miss_rate: f64,
    pub mean_ipc: f64,
    pub std_ipc: f64,
    pub sample_count: u64,
    pub ready: bool,
}

/// Per-sample detection output.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AnomalyResult {
    pub z_cache_miss_rate: f64,
    pub z_branch_miss_rate: f64,
    pub z_ipc: f64,
    pub composite: f64,
    pub flags: AnomalyFlags,
    pub consecutive_anomalies: u32,
}

/// Below this standard deviation, a baseline is treated as flat: z-scores
/// are defined to be zero rather than diverging or producing NaN (spec
/// §4.4, §8).
const MIN_STD: f64 = 1e-12;

fn zscore(x: f64, mean: f64, std: f64) -> f64 {
    if std < MIN_STD {
        0.0
    } else {
        (x - mean) / std
    }
}

pub struct AnomalyEngine {
    z_threshold: f64,
    burst_window: usize,

    learning_acc: [RunningStat; 3], // [cache_miss_rate, branch_miss_rate, ipc]
    learning_deadline: Instant,

    baseline: BaselineProfile,

    cmr_window: VecDeque<f64>,
    consecutive_anomalies: u32,
    last_direction: i8, // -1, 0 (unset), or +1; persists across zero diffs.
}

impl AnomalyEngine {
    pub fn new(z_threshold: f64, burst_window: usize, learning_duration: Duration) -> Self {
        Self {
            z_threshold,
            burst_window: burst_window.max(1),
            learning_acc: Default::default(),
            learning_deadline: Instant::now() + learning_duration,
            baseline: BaselineProfile::default(),
            cmr_window: VecDeque::with_capacity(burst_window.max(1)),
            consecutive_anomalies: 0,
            last_direction: 0,
        }
    }

    pub fn baseline(&self) -> &BaselineProfile {
        &self.baseline
    }

    /// Whether the learning phase's wall-clock deadline has passed. The
    /// orchestrator also short-circuits this on cancellation.
    pub fn learning_deadline_elapsed(&self) -> bool {
        Instant::now() >= self.learning_deadline
    }

    /// Feeds one sample into the learning accumulators. No sample is
    /// retained.
    pub fn observe_learning(&mut self, sample: &TelemetrySample) {
        self.learning_acc[0].observe(sample.cache_miss_rate);
        self.learning_acc[1].observe(sample.branch_miss_rate);
        self.learning_acc[2].observe(sample.ipc);
    }

    /// Computes mean/std for each metric and latches `ready`. Fails with
    /// `FATAL_RUNTIME` if zero samples were observed.
    /// Idempotent: a second call is a no-op once `ready` is set.
    pub fn finalize_baseline(&mut self) -> Result<()> {
        if self.baseline.ready {
            return Ok(());
        }
        let count = self.learning_acc[0].count;
        if count == 0 {
            return Err(DetectorError::FatalRuntime(
                "learning phase ended with zero samples; run the PMU self-test mode \
                 (--self-test) to check counter availability"
                    .to_string(),
            ));
        }

        let (mean_cmr, std_cmr) = self.learning_acc[0].finalize();
        let (mean_bmr, std_bmr) = self.learning_acc[1].finalize();
        let (mean_ipc, std_ipc) = self.learning_acc[2].finalize();

        self.baseline = BaselineProfile {
            mean_cache_miss_rate: mean_cmr,
            std_cache_miss_rate: std_cmr,
            mean_branch_miss_rate: mean_bmr,
            std_branch_miss_rate: std_bmr,
            mean_ipc,
            std_ipc,
            sample_count: count,
            ready: true,
        };
        Ok(())
    }

    /// Runs the detection phase for one sample.
    pub fn detect(&mut self, sample: &TelemetrySample) -> AnomalyResult {
        let z_cmr = zscore(
            sample.cache_miss_rate,
            self.baseline.mean_cache_miss_rate,
            self.baseline.std_cache_miss_rate,
        );
        let z_bmr = zscore(
            sample.branch_miss_rate,
            self.baseline.mean_branch_miss_rate,
            self.baseline.std_branch_miss_rate,
        );
        let z_ipc = zscore(sample.ipc, self.baseline.mean_ipc, self.baseline.std_ipc);

        let mut flags = AnomalyFlags::empty();
        if z_cmr > self.z_threshold {
            flags |= AnomalyFlags::CACHE_MISS_SPIKE;
        }
        if z_bmr > self.z_threshold {
            flags |= AnomalyFlags::BRANCH_MISS_SPIKE;
        }
        // Asymmetric: only IPC drops are suspicious, not rises.
        if z_ipc < -self.z_threshold {
            flags |= AnomalyFlags::IPC_COLLAPSE;
        }

        if self.cmr_window.len() == self.burst_window {
            self.cmr_window.pop_front();
        }
        self.cmr_window.push_back(sample.cache_miss_rate);

        let primary_fired = flags.intersects(
            AnomalyFlags::CACHE_MISS_SPIKE
                | AnomalyFlags::BRANCH_MISS_SPIKE
                | AnomalyFlags::IPC_COLLAPSE,
        );
        if primary_fired {
            self.consecutive_anomalies += 1;
        } else {
            self.consecutive_anomalies = 0;
        }
        if self.consecutive_anomalies as usize >= self.burst_window {
            flags |= AnomalyFlags::BURST_PATTERN;
        }

        if self.oscillating() {
            flags |= AnomalyFlags::OSCILLATION;
        }

        let m = z_cmr.abs().max(z_bmr.abs()).max(z_ipc.abs());
        let composite = (1.0 - 1.0 / (1.0 + m / self.z_threshold)).clamp(0.0, 1.0);

        AnomalyResult {
            z_cache_miss_rate: z_cmr,
            z_branch_miss_rate: z_bmr,
            z_ipc,
            composite,
            flags,
            consecutive_anomalies: self.consecutive_anomalies,
        }
    }

    /// Counts direction changes in the first difference of the circular
    /// cache-miss-rate window, treating zero diffs as neither a change nor
    /// a reset of "previous direction".
    fn oscillating(&mut self) -> bool {
        if self.cmr_window.len() < 2 {
            return false;
        }
        let mut changes = 0u32;
        let mut prev_dir = self.last_direction;
        let mut iter = self.cmr_window.iter();
        let mut prev_val = *iter.next().unwrap();
        for &val in iter {
            let diff = val - prev_val;
            prev_val = val;
            if diff == 0.0 {
                continue;
            }
            let dir: i8 = if diff > 0.0 { 1 } else { -1 };
            if prev_dir != 0 && dir != prev_dir {
                changes += 1;
            }
            prev_dir = dir;
        }
        self.last_direction = prev_dir;
        changes as usize >= self.cmr_window.len() / 2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(cmr: f64, bmr: f64, ipc: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp_ns: 0,
            cycles: 0,
            instructions: 0,
            cache_misses: 0,
            branch_misses: 0,
            branch_instructions: 0,
            cache_references: 0,
            cache_miss_rate: cmr,
            branch_miss_rate: bmr,
            ipc,
        }
    }

    fn flat_baseline_engine() -> AnomalyEngine {
        let mut engine = AnomalyEngine::new(3.5, 10, Duration::from_secs(0));
        for _ in 0..1000 {
            engine.observe_learning(&sample(0.010, 0.005, 1.500));
        }
        engine.finalize_baseline().unwrap();
        engine
    }

    /// A baseline with a tiny alternating wobble around the same means as
    /// [`flat_baseline_engine`], so `std` is a small nonzero number instead
    /// of exactly flat. An exactly-flat baseline forces every z-score to 0
    /// per the `MIN_STD` guard regardless of how far a
    /// detection sample strays, which is the right behavior for a
    /// genuinely constant counter but makes it impossible to exercise the
    /// spike/burst paths; real counters always carry some jitter.
    fn jittered_baseline_engine() -> AnomalyEngine {
        let mut engine = AnomalyEngine::new(3.5, 10, Duration::from_secs(0));
        for i in 0..1000 {
            let wobble = if i % 2 == 0 { 1.0002 } else { 0.9998 };
            engine.observe_learning(&sample(0.010 * wobble, 0.005 * wobble, 1.500 * wobble));
        }
        engine.finalize_baseline().unwrap();
        engine
    }

    #[test]
    fn scenario_baseline_flatline() {
        let mut engine = flat_baseline_engine();
        assert_eq!(engine.baseline().std_cache_miss_rate, 0.0);
        for _ in 0..500 {
            let r = engine.detect(&sample(0.010, 0.005, 1.500));
            assert_eq!(r.z_cache_miss_rate, 0.0);
            assert_eq!(r.z_branch_miss_rate, 0.0);
            assert_eq!(r.z_ipc, 0.0);
            assert_eq!(r.flags, AnomalyFlags::empty());
            assert_eq!(r.composite, 0.0);
        }
    }

    #[test]
    fn scenario_single_cache_spike() {
        let mut engine = jittered_baseline_engine();
        let r = engine.detect(&sample(0.100, 0.005, 1.500));
        assert!(r.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
        assert!(r.z_cache_miss_rate > 3.5);
        assert!(r.composite > 0.5);
        assert!(!r.flags.contains(AnomalyFlags::BURST_PATTERN));
    }

    #[test]
    fn scenario_burst_of_ten() {
        let mut engine = jittered_baseline_engine();
        let mut last = AnomalyResult::default();
        for _ in 0..10 {
            last = engine.detect(&sample(0.100, 0.005, 1.500));
        }
        assert!(last.flags.contains(AnomalyFlags::BURST_PATTERN));
        assert!(last.consecutive_anomalies >= 10);
    }

    #[test]
    fn scenario_ipc_collapse() {
        let mut engine = AnomalyEngine::new(3.5, 10, Duration::from_secs(0));
        for _ in 0..1000 {
            // std of ~0.05 around ipc=2.0 via a tiny alternating wobble.
            engine.observe_learning(&sample(0.010, 0.005, 2.0));
        }
        engine.finalize_baseline().unwrap();
        // Force a nonzero std by hand: re-run finalize on a mix.
        let mut engine = AnomalyEngine::new(3.5, 10, Duration::from_secs(0));
        for i in 0..1000 {
            let wobble = if i % 2 == 0 { 2.05 } else { 1.95 };
            engine.observe_learning(&sample(0.010, 0.005, wobble));
        }
        engine.finalize_baseline().unwrap();
        assert!(engine.baseline().std_ipc > 0.0);

        let r = engine.detect(&sample(0.010, 0.005, 1.0));
        assert!(r.flags.contains(AnomalyFlags::IPC_COLLAPSE));
        assert!(!r.flags.contains(AnomalyFlags::CACHE_MISS_SPIKE));
        assert!(!r.flags.contains(AnomalyFlags::BRANCH_MISS_SPIKE));
    }

    #[test]
    fn scenario_oscillation() {
        let mut engine = flat_baseline_engine();
        let mut last = AnomalyResult::default();
        for i in 0..12 {
            let cmr = if i % 2 == 0 { 0.01 } else { 0.05 };
            last = engine.detect(&sample(cmr, 0.005, 1.5));
        }
        assert!(last.flags.contains(AnomalyFlags::OSCILLATION));
    }

    #[test]
    fn zero_learning_samples_is_fatal() {
        let mut engine = AnomalyEngine::new(3.5, 10, Duration::from_secs(0));
        assert!(engine.finalize_baseline().is_err());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut engine = flat_baseline_engine();
        let before = *engine.baseline();
        engine.finalize_baseline().unwrap();
        let after = *engine.baseline();
        assert_eq!(before.mean_cache_miss_rate, after.mean_cache_miss_rate);
        assert_eq!(before.sample_count, after.sample_count);
    }

    #[test]
    fn composite_is_nonzero_iff_some_z_nonzero() {
        let mut engine = flat_baseline_engine();
        let flat = engine.detect(&sample(0.010, 0.005, 1.500));
        assert_eq!(flat.composite, 0.0);

        let mut engine = jittered_baseline_engine();
        let spiked = engine.detect(&sample(0.5, 0.005, 1.500));
        assert!(spiked.composite > 0.0);
    }
}
