//! C3: the background thread that turns PMU reads into telemetry samples.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::pmu::PmuSession;
use crate::ring::SpscRingBuffer;
use crate::telemetry::TelemetrySample;

/// The subset of [`Config`][crate::config::Config] the sampler needs,
/// copied out so the sampler thread does not have to borrow the whole
/// config across its lifetime.
#[derive(Clone, Copy, Debug)]
pub struct SamplerConfig {
    pub sampling_interval_us: u64,
    pub target_cpu: i32,
    pub target_pid: i32,
}

pub struct Sampler;

impl Sampler {
    /// Opens the PMU session synchronously (so a mandatory-counter
    /// failure is a regular `Err` the caller can treat as `FATAL_INIT`,
    ///) and then spawns the read loop in its own thread.
    pub fn spawn(
        config: SamplerConfig,
        epoch: Instant,
        cancel: CancellationToken,
        ring: Arc<SpscRingBuffer<TelemetrySample>>,
    ) -> io::Result<JoinHandle<()>> {
        let mut session = PmuSession::open(config.target_pid, config.target_cpu)?;
        let interval = Duration::from_micros(config.sampling_interval_us.max(1));
        let pin_cpu = config.target_cpu;

        thread::Builder::new()
            .name("cacheguard-sampler".into())
            .spawn(move || {
                if pin_cpu >= 0 {
                    if let Err(e) = pin_to_cpu(pin_cpu as usize) {
                        log::warn!("failed to pin sampler thread to CPU {pin_cpu}: {e}");
                    }
                }

                let mut previous = None;
                let mut dropped: u64 = 0;

                loop {
                    thread::sleep(interval);

                    match session.read() {
                        Ok(reading) => {
                            if let Some(prev) = previous {
                                let sample = build_sample(epoch, prev, reading);
                                if ring.push(sample).is_err() {
                                    dropped += 1;
                                    if dropped.is_power_of_two() {
                                        log::debug!(
                                            "ring buffer full; dropped {dropped} samples so far"
                                        );
                                    }
                                }
                            }
                            previous = Some(reading);
                        }
                        Err(e) => log::debug!("PMU read failed, skipping this tick: {e}"),
                    }

                    if cancel.is_cancelled() {
                        break;
                    }
                }

                session.close();
            })
    }
}

fn build_sample(
    start: Instant,
    prev: crate::pmu::PmuReading,
    cur: crate::pmu::PmuReading,
) -> TelemetrySample {
    let timestamp_ns = start.elapsed().as_nanos() as u64;
    TelemetrySample::from_deltas(
        timestamp_ns,
        cur.cycles().saturating_sub(prev.cycles()),
        cur.instructions().saturating_sub(prev.instructions()),
        cur.cache_misses().saturating_sub(prev.cache_misses()),
        cur.branch_misses().saturating_sub(prev.branch_misses()),
        cur.branch_instructions()
            .saturating_sub(prev.branch_instructions()),
        cur.cache_references()
            .saturating_sub(prev.cache_references()),
    )
}

fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
