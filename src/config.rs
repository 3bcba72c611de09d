//! Configuration: defaults, `key=value` file, CLI overrides.
//!
//! `spec.md` scopes CLI/config parsing out as an external collaborator
//! whose interface is only touched; this module is that interface. It is
//! deliberately thin — one struct, one file reader, no schema validation
//! beyond per-key type parsing (see `SPEC_FULL.md` §6.4).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Resolved runtime configuration, after `defaults -> file -> CLI`
/// precedence has been applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub sampling_interval_us: u64,
    pub learning_duration_sec: u64,
    pub z_threshold: f64,
    pub burst_window: u32,
    pub ringbuffer_capacity: u32,
    pub target_cpu: i32,
    pub target_pid: i32,
    pub log_file: PathBuf,
    pub log_to_syslog: bool,
    pub verbose: bool,
    pub risk_decay_factor: f64,
    pub correlation_window_sec: u64,
    pub alert_cooldown_sec: u64,
    pub socket_path: PathBuf,
    pub enable_ml_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_interval_us: 100_000,
            learning_duration_sec: 60,
            z_threshold: 3.5,
            burst_window: 10,
            ringbuffer_capacity: 4096,
            // System-wide (`target_pid = -1`) combined with "any CPU"
            // (`target_cpu = -1`) is rejected by `PmuSession::open` (spec
            // §4.1: "(pid, cpu) is not (any, any)"), so the out-of-the-box
            // default pins to CPU 0 rather than leaving both fields at
            // their individually-valid "any" sentinel.
            target_cpu: 0,
            target_pid: -1,
            log_file: PathBuf::from("/var/log/cacheguard/alerts.log"),
            log_to_syslog: false,
            verbose: false,
            risk_decay_factor: crate::correlation::DEFAULT_DECAY_FACTOR,
            correlation_window_sec: 30,
            alert_cooldown_sec: 5,
            socket_path: PathBuf::from("/run/cacheguard/ml.sock"),
            enable_ml_output: false,
        }
    }
}

/// One malformed or unrecognized line in a config file. Accumulated rather than raised so a single bad line
/// does not abort startup.
#[derive(Debug)]
pub struct ConfigWarning {
    pub line_no: usize,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line_no, self.message)
    }
}

impl Config {
    /// Applies `key=value` lines from `path` on top of `self`, in file
    /// order (later lines win if a key repeats). Returns every warning
    /// encountered rather than failing the whole file.
    pub fn apply_file(&mut self, path: &Path) -> std::io::Result<Vec<ConfigWarning>> {
        let text = fs::read_to_string(path)?;
        Ok(self.apply_str(&text))
    }

    fn apply_str(&mut self, text: &str) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        for (i, raw_line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warnings.push(ConfigWarning {
                    line_no,
                    message: format!("malformed line (expected key=value): {line:?}"),
                });
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if let Err(message) = self.set(key, value) {
                warnings.push(ConfigWarning { line_no, message });
            }
        }
        warnings
    }

    /// Sets one key by name. Unknown keys are a `CONFIG_WARN`, not a
    /// hard error.
    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        macro_rules! parse {
            ($field:expr) => {
                value
                    .parse()
                    .map(|v| $field = v)
                    .map_err(|e| format!("invalid value for {key:?}: {e}"))?
            };
        }
        match key {
            "sampling_interval_us" => parse!(self.sampling_interval_us),
            "learning_duration_sec" => parse!(self.learning_duration_sec),
            "z_threshold" => parse!(self.z_threshold),
            "burst_window" => parse!(self.burst_window),
            "ringbuffer_capacity" => parse!(self.ringbuffer_capacity),
            "target_cpu" => parse!(self.target_cpu),
            "target_pid" => parse!(self.target_pid),
            "log_file" => self.log_file = PathBuf::from(value),
            "log_to_syslog" => parse!(self.log_to_syslog),
            "verbose" => parse!(self.verbose),
            "risk_decay_factor" => parse!(self.risk_decay_factor),
            "correlation_window_sec" => parse!(self.correlation_window_sec),
            "alert_cooldown_sec" => parse!(self.alert_cooldown_sec),
            "socket_path" => self.socket_path = PathBuf::from(value),
            "enable_ml_output" => parse!(self.enable_ml_output),
            other => return Err(format!("unknown config key {other:?}")),
        }
        Ok(())
    }

    /// Applies the subset of CLI flags the caller actually set, last in
    /// precedence.
    pub fn apply_cli(&mut self, cli: &CliArgs) {
        if let Some(v) = cli.sampling_interval_us {
            self.sampling_interval_us = v;
        }
        if let Some(v) = cli.learning_duration_sec {
            self.learning_duration_sec = v;
        }
        if let Some(v) = cli.z_threshold {
            self.z_threshold = v;
        }
        if let Some(v) = cli.burst_window {
            self.burst_window = v;
        }
        if let Some(v) = cli.ringbuffer_capacity {
            self.ringbuffer_capacity = v;
        }
        if let Some(v) = cli.target_cpu {
            self.target_cpu = v;
        }
        if let Some(v) = cli.target_pid {
            self.target_pid = v;
        }
        if let Some(v) = &cli.log_file {
            self.log_file = v.clone();
        }
        if cli.log_to_syslog {
            self.log_to_syslog = true;
        }
        if cli.verbose {
            self.verbose = true;
        }
        if let Some(v) = cli.risk_decay_factor {
            self.risk_decay_factor = v;
        }
        if let Some(v) = cli.correlation_window_sec {
            self.correlation_window_sec = v;
        }
        if let Some(v) = cli.alert_cooldown_sec {
            self.alert_cooldown_sec = v;
        }
        if let Some(v) = &cli.socket_path {
            self.socket_path = v.clone();
        }
        if cli.enable_ml_output {
            self.enable_ml_output = true;
        }
    }

    pub fn ringbuffer_capacity(&self) -> usize {
        self.ringbuffer_capacity as usize
    }
}

/// CLI surface. Every tunable is an `Option` so "not passed"
/// is distinguishable from "passed as the default value", which is what
/// lets `defaults -> file -> CLI` precedence compose correctly.
#[derive(Parser, Debug, Default)]
#[command(name = "cacheguardd")]
#[command(about = "Real-time detector for CPU cache/branch side-channel attacks")]
#[command(version)]
pub struct CliArgs {
    /// Path to a key=value configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Open one PMU session, print one raw reading, and exit.
    #[arg(long)]
    pub self_test: bool,

    #[arg(long)]
    pub sampling_interval_us: Option<u64>,
    #[arg(long)]
    pub learning_duration_sec: Option<u64>,
    #[arg(long)]
    pub z_threshold: Option<f64>,
    #[arg(long)]
    pub burst_window: Option<u32>,
    #[arg(long)]
    pub ringbuffer_capacity: Option<u32>,
    #[arg(long)]
    pub target_cpu: Option<i32>,
    #[arg(long)]
    pub target_pid: Option<i32>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[arg(long)]
    pub log_to_syslog: bool,
    #[arg(short, long)]
    pub verbose: bool,
    #[arg(long)]
    pub risk_decay_factor: Option<f64>,
    #[arg(long)]
    pub correlation_window_sec: Option<u64>,
    #[arg(long)]
    pub alert_cooldown_sec: Option<u64>,
    #[arg(long)]
    pub socket_path: Option<PathBuf>,
    #[arg(long)]
    pub enable_ml_output: bool,
}

/// Builds the final `Config` by layering `defaults -> file -> CLI` (spec
/// §6). Returns every `CONFIG_WARN` collected along the way so the
/// caller can log them after the logger itself is initialized.
pub fn resolve(cli: &CliArgs) -> (Config, Vec<ConfigWarning>) {
    let mut config = Config::default();
    let mut warnings = Vec::new();
    if let Some(path) = &cli.config {
        match config.apply_file(path) {
            Ok(w) => warnings.extend(w),
            Err(e) => warnings.push(ConfigWarning {
                line_no: 0,
                message: format!("could not read config file {}: {e}", path.display()),
            }),
        }
    }
    config.apply_cli(cli);
    (config, warnings)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn file_overrides_defaults_and_flags_unknown_keys() {
        let mut config = Config::default();
        let warnings = config.apply_str(
            "z_threshold=4.0\n\
             # a comment\n\
             \n\
             burst_window=20\n\
             not_a_real_key=1\n\
             malformed_line_no_equals\n",
        );
        assert_eq!(config.z_threshold, 4.0);
        assert_eq!(config.burst_window, 20);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn cli_overrides_file_and_defaults() {
        let mut config = Config::default();
        config.apply_str("z_threshold=4.0\n");
        let cli = CliArgs {
            z_threshold: Some(5.0),
            ..Default::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.z_threshold, 5.0);
    }

    #[test]
    fn default_target_is_not_any_any() {
        // `PmuSession::open` rejects (pid, cpu) == (any, any); the default
        // config must not hand it that combination out of the box.
        let config = Config::default();
        assert!(!(config.target_pid == -1 && config.target_cpu == -1));
    }

    #[test]
    fn ringbuffer_capacity_is_rounded_up_by_the_ring_itself() {
        // Config stores the requested capacity verbatim; the
        // rounding to a power of two happens in `SpscRingBuffer::new`.
        let config = Config::default();
        assert_eq!(config.ringbuffer_capacity(), 4096);
    }
}
