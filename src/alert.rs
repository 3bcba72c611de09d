//! Alert rendering and emission: JSON formatting, file/syslog sinks,
//! cooldown.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Severity classification fed from the orchestrator's composite-score /
/// flag check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }

    #[cfg(target_os = "linux")]
    fn syslog_priority(self) -> libc::c_int {
        match self {
            AlertLevel::Info => libc::LOG_INFO,
            AlertLevel::Warning => libc::LOG_WARNING,
            AlertLevel::Critical => libc::LOG_CRIT,
        }
    }
}

/// One emitted alert's content. Built by the orchestrator
/// from an `AnomalyResult` plus the top-risk correlation entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    pub level: AlertLevel,
    pub timestamp_ns: u64,
    pub pid: i32,
    pub comm: String,
    pub anomaly_score: f64,
    pub reason: String,
}

/// Escapes control characters and quotes for a JSON string body, per
/// spec §6.2 ("Control characters and quotes in `comm` and `reason` must
/// be escaped"). `comm` in particular comes straight from
/// `/proc/<pid>/comm`, which is attacker-influenced via `prctl` — this is
/// the one place that matters.
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

impl Alert {
    /// Renders the single-line JSON wire form. `anomaly_score`
    /// is always rendered with exactly four decimals.
    pub fn to_json(&self) -> String {
        format!(
            "{{\"level\": \"{}\", \"timestamp\": {}, \"pid\": {}, \"comm\": \"{}\", \
             \"anomaly_score\": {:.4}, \"reason\": \"{}\"}}",
            self.level.as_str(),
            self.timestamp_ns,
            self.pid,
            json_escape(&self.comm),
            self.anomaly_score,
            json_escape(&self.reason),
        )
    }
}

/// The file sink plus optional syslog mirror, with the process-wide
/// cooldown gate. Owned exclusively by the orchestrator.
pub struct AlertSink {
    file: Option<File>,
    file_path: PathBuf,
    log_to_syslog: bool,
    syslog_open: bool,
    cooldown: Duration,
    last_emitted: Option<Instant>,
    reopen_attempted: bool,
}

impl AlertSink {
    /// Opens `log_file` for append and, if `log_to_syslog`, opens the
    /// syslog connection.
    pub fn open(log_file: &Path, log_to_syslog: bool, cooldown_sec: u64) -> io::Result<Self> {
        if let Some(parent) = log_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(log_file)?;

        let syslog_open = if log_to_syslog {
            open_syslog();
            true
        } else {
            false
        };

        Ok(Self {
            file: Some(file),
            file_path: log_file.to_path_buf(),
            log_to_syslog,
            syslog_open,
            cooldown: Duration::from_secs(cooldown_sec),
            last_emitted: None,
            reopen_attempted: false,
        })
    }

    /// Emits `alert` unless the cooldown is still active. The
    /// cooldown is process-wide, not per-pid (see `DESIGN.md`).
    pub fn emit(&mut self, alert: &Alert) {
        let now = Instant::now();
        if let Some(last) = self.last_emitted {
            if now.duration_since(last) < self.cooldown {
                return;
            }
        }
        self.last_emitted = Some(now);

        let line = alert.to_json();
        self.write_file_line(&line);
        if self.log_to_syslog {
            self.write_syslog(alert, &line);
        }
    }

    fn write_file_line(&mut self, line: &str) {
        let Some(file) = &mut self.file else { return };
        let write_result = writeln!(file, "{line}").and_then(|_| file.flush());
        if write_result.is_err() {
            // TRANSIENT_IO: retry once against a freshly reopened handle,
            // then give up silently for this line.
            if !self.reopen_attempted {
                self.reopen_attempted = true;
                if let Ok(mut reopened) = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.file_path)
                {
                    let _ = writeln!(reopened, "{line}").and_then(|_| reopened.flush());
                    self.file = Some(reopened);
                    self.reopen_attempted = false;
                    return;
                }
            }
            log::warn!("alert sink: dropped one alert after a file write failure");
        }
    }

    #[cfg(target_os = "linux")]
    fn write_syslog(&self, alert: &Alert, line: &str) {
        if !self.syslog_open {
            return;
        }
        if let Ok(c_line) = CString::new(line) {
            unsafe {
                libc::syslog(alert.level.syslog_priority(), b"%s\0".as_ptr() as *const _, c_line.as_ptr());
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn write_syslog(&self, _alert: &Alert, _line: &str) {}
}

#[cfg(target_os = "linux")]
fn open_syslog() {
    let ident = CString::new("cacheguardd").unwrap();
    unsafe {
        // `ident` is leaked deliberately: `openlog` keeps the pointer for
        // the process lifetime and there is exactly one `AlertSink`.
        libc::openlog(ident.into_raw(), libc::LOG_PID, libc::LOG_DAEMON);
    }
}

#[cfg(not(target_os = "linux"))]
fn open_syslog() {}

impl Drop for AlertSink {
    fn drop(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        #[cfg(target_os = "linux")]
        if self.syslog_open {
            unsafe { libc::closelog() };
        }
    }
}
