//! C5: per-process risk correlation table.

use std::fs;

use arrayvec::ArrayString;

/// Process names beyond this length are truncated; `comm` is
/// kernel-bounded to 16 bytes including the NUL anyway.
const NAME_CAPACITY: usize = 16;

/// EMA smoothing factor applied to each new composite score.
const RISK_ALPHA: f64 = 0.3;

/// Default multiplicative decay applied to a still-active entry's risk
/// once per decay tick, overridable via `risk_decay_factor`.
pub const DEFAULT_DECAY_FACTOR: f64 = 0.95;

/// Risk below this is snapped to exactly zero so a cold entry does not
/// linger forever asymptotically approaching it.
const DECAY_SNAP: f64 = 1e-3;

/// Upper bound on tracked processes; the table never
/// allocates beyond this.
pub const MAX_ENTRIES: usize = 256;

#[derive(Clone, Debug)]
pub struct ProcessRiskEntry {
    pub pid: i32,
    pub tid: i32,
    pub name: ArrayString<NAME_CAPACITY>,
    pub risk_score: f64,
    pub total_samples: u64,
    pub suspicious_samples: u64,
    pub last_seen_ns: u64,
    pub active: bool,
}

impl ProcessRiskEntry {
    fn fresh(pid: i32, tid: i32, name: ArrayString<NAME_CAPACITY>, now_ns: u64) -> Self {
        Self {
            pid,
            tid,
            name,
            risk_score: 0.0,
            total_samples: 0,
            suspicious_samples: 0,
            last_seen_ns: now_ns,
            active: true,
        }
    }
}

/// Reads and trims `/proc/<pid>/comm`; falls back to `"<unknown>"` if the
/// process has already exited or the read otherwise fails.
fn resolve_comm(pid: i32) -> ArrayString<NAME_CAPACITY> {
    match fs::read_to_string(format!("/proc/{pid}/comm")) {
        Ok(raw) => ArrayString::from(raw.trim()).unwrap_or_else(|_| {
            let mut s = ArrayString::new();
            s.push_str(&raw.trim()[..NAME_CAPACITY.min(raw.trim().len())]);
            s
        }),
        Err(_) => ArrayString::from("<unknown>").unwrap(),
    }
}

/// C5: a fixed-capacity, linearly-scanned table of per-process risk
///. Capped at [`MAX_ENTRIES`] so a PID-spraying workload
/// cannot grow the detector's own memory footprint.
pub struct CorrelationTable {
    entries: arrayvec::ArrayVec<ProcessRiskEntry, MAX_ENTRIES>,
    decay_window_ns: u64,
    decay_factor: f64,
    dropped_for_capacity: u64,
}

impl CorrelationTable {
    pub fn new(decay_window_ns: u64) -> Self {
        Self::with_decay_factor(decay_window_ns, DEFAULT_DECAY_FACTOR)
    }

    pub fn with_decay_factor(decay_window_ns: u64, decay_factor: f64) -> Self {
        Self {
            entries: arrayvec::ArrayVec::new(),
            decay_window_ns,
            decay_factor,
            dropped_for_capacity: 0,
        }
    }

    /// Feeds one detection result into the table: find the pid, or reuse
    /// an inactive slot, or allocate a new one, or drop it if the table
    /// is already full. Returns the updated entry's index so
    /// callers can immediately read back the fresh risk score.
    pub fn update(
        &mut self,
        pid: i32,
        tid: i32,
        composite_score: f64,
        suspicious: bool,
        now_ns: u64,
    ) -> Option<&ProcessRiskEntry> {
        let idx = if let Some(i) = self.entries.iter().position(|e| e.pid == pid) {
            i
        } else if let Some(i) = self.entries.iter().position(|e| !e.active) {
            let name = resolve_comm(pid);
            self.entries[i] = ProcessRiskEntry::fresh(pid, tid, name, now_ns);
            i
        } else if self.entries.len() < MAX_ENTRIES {
            let name = resolve_comm(pid);
            self.entries.push(ProcessRiskEntry::fresh(pid, tid, name, now_ns));
            self.entries.len() - 1
        } else {
            self.dropped_for_capacity += 1;
            if self.dropped_for_capacity.is_power_of_two() {
                log::warn!(
                    "correlation table full ({MAX_ENTRIES} entries); dropped {} \
                     new processes so far",
                    self.dropped_for_capacity
                );
            }
            return None;
        };

        let entry = &mut self.entries[idx];
        entry.tid = tid;
        entry.active = true;
        entry.last_seen_ns = now_ns;
        entry.total_samples += 1;
        if suspicious {
            entry.suspicious_samples += 1;
        }
        entry.risk_score = RISK_ALPHA * composite_score + (1.0 - RISK_ALPHA) * entry.risk_score;
        Some(entry)
    }

    /// Ages every active entry by one decay tick, deactivating any entry
    /// that has not been updated within the decay window.
    pub fn decay(&mut self, now_ns: u64) {
        for entry in self.entries.iter_mut() {
            if !entry.active {
                continue;
            }
            if now_ns.saturating_sub(entry.last_seen_ns) > self.decay_window_ns {
                entry.active = false;
                continue;
            }
            entry.risk_score *= self.decay_factor;
            if entry.risk_score < DECAY_SNAP {
                entry.risk_score = 0.0;
            }
        }
    }

    pub fn lookup(&self, pid: i32) -> Option<&ProcessRiskEntry> {
        self.entries.iter().find(|e| e.pid == pid && e.active)
    }

    /// The single highest-risk active entry, if any.
    pub fn top_risk(&self) -> Option<&ProcessRiskEntry> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .max_by(|a, b| a.risk_score.total_cmp(&b.risk_score))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
