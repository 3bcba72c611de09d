//! C7: lifecycle, phase transitions, privilege drop, alert routing.
//!
//! Owns every long-lived resource except the sampler's own PMU session
//!: the ring buffer, the anomaly engine, the
//! correlation table, the IPC handle, and the alert sink. The sampler
//! thread is spawned and joined here but otherwise opaque.

mod privilege;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::{Alert, AlertLevel, AlertSink};
use crate::anomaly::{AnomalyEngine, AnomalyFlags};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::correlation::CorrelationTable;
use crate::error::{DetectorError, Result};
use crate::ipc::IpcPublisher;
use crate::ring::SpscRingBuffer;
use crate::telemetry::sampler::{Sampler, SamplerConfig};
use crate::telemetry::TelemetrySample;

/// `INIT -> LEARNING -> DETECTING -> SHUTTING_DOWN -> DONE`.
/// Transitions only move forward; cancellation short-circuits any state
/// straight to `ShuttingDown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Learning,
    Detecting,
    ShuttingDown,
    Done,
}

/// How long the empty-ring backoff sleeps before polling again (spec
/// §4.7: "sleep briefly (tens to hundreds of microseconds) rather than
/// busy-spin").
const RING_EMPTY_BACKOFF: Duration = Duration::from_micros(200);

/// How often correlation decay runs, in wall-clock time.
const DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// How often the verbose status summary is emitted.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Composite-score threshold separating `WARNING` from `INFO` (spec
/// §4.7).
const WARNING_THRESHOLD: f64 = 0.5;

/// Composite-score threshold (or `BURST_PATTERN`) separating `CRITICAL`
/// from `WARNING`.
const CRITICAL_THRESHOLD: f64 = 0.8;

struct Counters {
    samples_seen: u64,
    anomalies_seen: u64,
}

/// The full lifecycle machine. `run` is the only entry
/// point; everything else is a private step of that one run.
pub struct Orchestrator {
    config: Config,
    cancel: CancellationToken,
    state: State,
}

impl Orchestrator {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            state: State::Init,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs the full `INIT -> ... -> DONE` lifecycle to completion.
    /// Returns `Err` only for the two `FATAL_*` classes in spec §7;
    /// every other failure is absorbed internally per the propagation
    /// rule in spec §7 ("nothing past initialization should propagate a
    /// failure upward").
    pub fn run(mut self) -> Result<()> {
        let ring: Arc<SpscRingBuffer<TelemetrySample>> =
            Arc::new(SpscRingBuffer::new(self.config.ringbuffer_capacity()));

        // Shared clock origin: the sampler stamps `TelemetrySample::timestamp_ns`
        // from it, and correlation decay reads its own nanosecond clock from
        // the same origin, so the two scales stay comparable.
        let epoch = Instant::now();

        let sampler_config = SamplerConfig {
            sampling_interval_us: self.config.sampling_interval_us,
            target_cpu: self.config.target_cpu,
            target_pid: self.config.target_pid,
        };
        let sampler_handle = Sampler::spawn(sampler_config, epoch, self.cancel.clone(), ring.clone())
            .map_err(|e| {
                DetectorError::FatalInit(format!(
                    "PMU session could not be opened ({e}); check perf_event_paranoid, \
                     CAP_PERFMON, and whether this host is a VM lacking PMU passthrough"
                ))
            })?;

        let mut ipc = if self.config.enable_ml_output {
            Some(IpcPublisher::connect(&self.config.socket_path))
        } else {
            None
        };

        let mut alert_sink = AlertSink::open(
            &self.config.log_file,
            self.config.log_to_syslog,
            self.config.alert_cooldown_sec,
        )
        .map_err(|e| {
            DetectorError::FatalInit(format!(
                "alert sink could not open {}: {e}",
                self.config.log_file.display()
            ))
        })?;

        let mut engine = AnomalyEngine::new(
            self.config.z_threshold,
            self.config.burst_window as usize,
            Duration::from_secs(self.config.learning_duration_sec),
        );

        self.state = State::Learning;
        self.run_learning(&ring, &mut engine, ipc.as_mut());

        // Cancellation during learning still requires finalize to run so
        // the deadline check below produces a deterministic error rather
        // than leaving `engine` half-initialized; a zero-sample result
        // surfaces as FatalRuntime exactly as spec §4.4 requires.
        if let Err(e) = engine.finalize_baseline() {
            self.state = State::ShuttingDown;
            self.shutdown(sampler_handle, ipc, alert_sink);
            self.state = State::Done;
            return Err(e);
        }

        if !self.cancel.is_cancelled() {
            privilege::drop_if_elevated();

            self.state = State::Detecting;
            let decay_window_ns = self.config.correlation_window_sec.saturating_mul(1_000_000_000);
            let mut correlation =
                CorrelationTable::with_decay_factor(decay_window_ns, self.config.risk_decay_factor);
            self.run_detecting(
                &ring,
                epoch,
                &mut engine,
                &mut correlation,
                ipc.as_mut(),
                &mut alert_sink,
            );
        }

        self.state = State::ShuttingDown;
        self.shutdown(sampler_handle, ipc, alert_sink);
        self.state = State::Done;
        Ok(())
    }

    fn run_learning(
        &self,
        ring: &SpscRingBuffer<TelemetrySample>,
        engine: &mut AnomalyEngine,
        mut ipc: Option<&mut IpcPublisher>,
    ) {
        loop {
            if self.cancel.is_cancelled() || engine.learning_deadline_elapsed() {
                return;
            }
            match ring.pop() {
                Ok(sample) => {
                    engine.observe_learning(&sample);
                    if let Some(ipc) = ipc.as_deref_mut() {
                        ipc.send(&sample);
                    }
                }
                Err(_) => std::thread::sleep(RING_EMPTY_BACKOFF),
            }
        }
    }

    fn run_detecting(
        &self,
        ring: &SpscRingBuffer<TelemetrySample>,
        epoch: Instant,
        engine: &mut AnomalyEngine,
        correlation: &mut CorrelationTable,
        mut ipc: Option<&mut IpcPublisher>,
        alert_sink: &mut AlertSink,
    ) {
        let mut counters = Counters {
            samples_seen: 0,
            anomalies_seen: 0,
        };
        let mut last_decay = Instant::now();
        let mut last_status = Instant::now();
        // Open Question: the source attributes every alert to
        // its own pid even system-wide; carried forward unchanged (see
        // DESIGN.md).
        let self_pid = std::process::id() as i32;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match ring.pop() {
                Ok(sample) => {
                    counters.samples_seen += 1;
                    let result = engine.detect(&sample);
                    if let Some(ipc) = ipc.as_deref_mut() {
                        ipc.send(&sample);
                    }

                    if !result.flags.is_empty() {
                        counters.anomalies_seen += 1;
                        let suspicious = result.composite > WARNING_THRESHOLD;
                        correlation.update(
                            self_pid,
                            self_pid,
                            result.composite,
                            suspicious,
                            sample.timestamp_ns,
                        );
                        // Attribution is the top-risk active entry, not
                        // necessarily the one just updated.
                        let (comm, score) = correlation
                            .top_risk()
                            .map(|e| (e.name.to_string(), e.risk_score))
                            .unwrap_or_else(|| ("?".to_string(), result.composite));

                        let level = classify(result.composite, result.flags);
                        let alert = Alert {
                            level,
                            timestamp_ns: sample.timestamp_ns,
                            pid: self_pid,
                            comm,
                            anomaly_score: score,
                            reason: result.flags.describe(),
                        };
                        alert_sink.emit(&alert);
                    }
                }
                Err(_) => std::thread::sleep(RING_EMPTY_BACKOFF),
            }

            let now = Instant::now();
            if now.duration_since(last_decay) >= DECAY_INTERVAL {
                correlation.decay(now.duration_since(epoch).as_nanos() as u64);
                last_decay = now;
            }
            if self.config.verbose && now.duration_since(last_status) >= STATUS_INTERVAL {
                log::info!(
                    "status: samples={} anomalies={} ring_fill={}",
                    counters.samples_seen,
                    counters.anomalies_seen,
                    ring.len()
                );
                last_status = now;
            }
        }
    }

    /// Runs every resource-release step in spec §5 ("Resources acquired
    /// are released on every exit path"): sets cancellation (idempotent
    /// if already set by a signal), joins the sampler deterministically,
    /// then drops the IPC handle and alert sink, whose own `Drop`/`close`
    /// release their file descriptors.
    fn shutdown(
        &self,
        sampler_handle: std::thread::JoinHandle<()>,
        mut ipc: Option<IpcPublisher>,
        alert_sink: AlertSink,
    ) {
        self.cancel.cancel();
        let _ = sampler_handle.join();
        if let Some(ipc) = ipc.as_mut() {
            ipc.close();
        }
        drop(alert_sink);
    }
}

fn classify(composite: f64, flags: AnomalyFlags) -> AlertLevel {
    if composite > CRITICAL_THRESHOLD || flags.contains(AnomalyFlags::BURST_PATTERN) {
        AlertLevel::Critical
    } else if composite > WARNING_THRESHOLD {
        AlertLevel::Warning
    } else {
        AlertLevel::Info
    }
}
