//! cacheguard — a real-time behavioral detector for CPU side-channel
//! attacks (Prime+Probe, Flush+Reload, Spectre-class branch abuse, cache
//! thrashing).
//!
//! Samples hardware performance counters through `perf_event_open(2)` on
//! a fixed interval, learns a per-deployment statistical baseline over a
//! short learning window, then flags samples whose microarchitectural
//! footprint deviates from it and attributes the risk to a process.
//!
//! The pipeline is seven components, leaves first:
//!
//! - [`pmu`] — opens and reads a group of hardware counters with
//!   multiplexing-aware scaling and graceful fallback.
//! - [`ring`] — the lock-free SPSC handoff between sampler and detector.
//! - [`telemetry`] — the background sampling thread and the canonical
//!   sample type it produces.
//! - [`anomaly`] — the two-phase learn/detect statistical engine.
//! - [`correlation`] — per-process risk aggregation with EMA smoothing
//!   and time-windowed decay.
//! - [`ipc`] — the best-effort datagram mirror to an external ML
//!   consumer.
//! - [`orchestrator`] — lifecycle, phase transitions, privilege drop,
//!   and alert routing; the only component that owns every other one.
//!
//! [`config`] and [`alert`] are the ambient CLI/config and alert-sink
//! layers around that core; [`cancel`] is the single piece of shared
//! mutable state (the shutdown token) and [`error`] the fatal-error
//! taxonomy.

pub mod alert;
pub mod anomaly;
pub mod cancel;
pub mod config;
pub mod correlation;
pub mod error;
mod ffi;
pub mod ipc;
pub mod orchestrator;
pub mod pmu;
pub mod ring;
pub mod telemetry;

pub use error::{DetectorError, Result};
