//! C1: PMU Session — opens, scales and reads a group of hardware
//! performance counters with graceful fallback.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;

use arrayvec::ArrayVec;

use crate::ffi::bindings as b;
use crate::ffi::syscall::{ioctl_arg, perf_event_open, read};
use crate::ffi::Attr;

pub mod slot;
pub use slot::{Slot, BRANCH_INSTRUCTIONS, BRANCH_MISSES, CACHE_MISSES, CACHE_REFERENCES, CYCLES,
               INSTRUCTIONS, SLOT_COUNT};

/// A single snapshot of the six counters plus the scale-correction pair
/// used to recover true counts from a multiplexed group read.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PmuReading {
    pub values: [u64; SLOT_COUNT],
    pub time_enabled: u64,
    pub time_running: u64,
}

impl PmuReading {
    pub fn cycles(&self) -> u64 {
        self.values[CYCLES]
    }
    pub fn instructions(&self) -> u64 {
        self.values[INSTRUCTIONS]
    }
    pub fn cache_misses(&self) -> u64 {
        self.values[CACHE_MISSES]
    }
    pub fn branch_misses(&self) -> u64 {
        self.values[BRANCH_MISSES]
    }
    pub fn branch_instructions(&self) -> u64 {
        self.values[BRANCH_INSTRUCTIONS]
    }
    pub fn cache_references(&self) -> u64 {
        self.values[CACHE_REFERENCES]
    }
}

/// Applies the multiplexing scale correction described in spec §3:
/// when the group ran for less time than it was enabled, scale the raw
/// count up by `enabled / running`; when it never ran at all, the value
/// is defined to be zero rather than an infinite scale.
fn scale(raw: u64, time_enabled: u64, time_running: u64) -> u64 {
    if time_running == 0 {
        0
    } else if time_running < time_enabled {
        ((raw as f64) * (time_enabled as f64) / (time_running as f64)) as u64
    } else {
        raw
    }
}

/// Highest `perf_event_paranoid` level this detector still expects to
/// work under without `CAP_PERFMON`/`CAP_SYS_ADMIN`.
const MAX_SUPPORTED_PARANOID_LEVEL: i32 = 2;

/// Best-effort, non-fatal diagnostics run once before the first counter is
/// opened.
pub fn preflight_diagnostics() {
    if let Ok(raw) = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") {
        if let Ok(level) = raw.trim().parse::<i32>() {
            if level > MAX_SUPPORTED_PARANOID_LEVEL {
                log::warn!(
                    "perf_event_paranoid={level} exceeds the supported level \
                     ({MAX_SUPPORTED_PARANOID_LEVEL}); counter opens may fail \
                     without CAP_PERFMON or CAP_SYS_ADMIN"
                );
            }
        }
    }
    if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
        if cpuinfo
            .lines()
            .any(|l| l.starts_with("flags") && l.contains("hypervisor"))
        {
            log::info!(
                "hypervisor flag present in /proc/cpuinfo; counter availability \
                 and accuracy may be reduced under virtualization"
            );
        }
    }
}

fn group_read_attr(ty: u32, config: u64, inherit: bool) -> Attr {
    let mut attr = Attr::new(ty, config);
    attr.read_format = (b::PERF_FORMAT_GROUP
        | b::PERF_FORMAT_TOTAL_TIME_ENABLED
        | b::PERF_FORMAT_TOTAL_TIME_RUNNING) as _;
    attr.set_inherit(inherit);
    attr
}

/// C1: an open group of PMU counters for one (pid, cpu) target.
///
/// Group member order is fixed at open time: cycles, instructions, then
/// whichever of the optional slots actually opened, in the order they
/// were attempted. That order is what a single grouped `read()` returns
/// values in, so it is tracked in `member_order` to route each raw value
/// back to its [`slot`] position.
pub struct PmuSession {
    pid: i32,
    cpu: i32,
    slots: [Slot; SLOT_COUNT],
    member_order: ArrayVec<usize, SLOT_COUNT>,
    read_buf: Vec<u8>,
}

impl PmuSession {
    /// Opens the counter group for `pid`/`cpu` (`-1` means "any" for
    /// either, but not both at once).
    pub fn open(pid: i32, cpu: i32) -> io::Result<Self> {
        if pid == -1 && cpu == -1 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "cannot monitor all processes across all CPUs at once",
            ));
        }

        preflight_diagnostics();

        let mut cpu = cpu;
        let cycles_attr = group_read_attr(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CPU_CYCLES, true);
        let leader = match perf_event_open(&cycles_attr, pid, cpu, -1, b::PERF_FLAG_FD_CLOEXEC) {
            Ok(f) => f,
            Err(first_err) if cpu == -1 => {
                cpu = 0;
                perf_event_open(&cycles_attr, pid, cpu, -1, b::PERF_FLAG_FD_CLOEXEC)
                    .map_err(|_| first_err)?
            }
            Err(e) => return Err(e),
        };
        let leader_fd = leader.as_raw_fd();

        let instr_attr =
            group_read_attr(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_INSTRUCTIONS, true);
        let instructions = perf_event_open(&instr_attr, pid, cpu, leader_fd, b::PERF_FLAG_FD_CLOEXEC)?;

        let mut member_order = ArrayVec::new();
        member_order.push(CYCLES);
        member_order.push(INSTRUCTIONS);

        let try_open = |ty: u32, config: u64| -> Option<std::fs::File> {
            let attr = group_read_attr(ty, config, true);
            perf_event_open(&attr, pid, cpu, leader_fd, b::PERF_FLAG_FD_CLOEXEC).ok()
        };

        // First-success fallback chain for the cache-miss slot: a hardware
        // cache-miss counter, else raw cache references as a coarser proxy,
        // else the software CPU-clock as a last-resort placeholder.
        let cache_miss = try_open(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CACHE_MISSES)
            .or_else(|| try_open(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CACHE_REFERENCES))
            .or_else(|| try_open(b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_CPU_CLOCK));
        if cache_miss.is_some() {
            member_order.push(CACHE_MISSES);
        }

        let branch_misses = try_open(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_BRANCH_MISSES);
        if branch_misses.is_some() {
            member_order.push(BRANCH_MISSES);
        }

        let branch_instructions =
            try_open(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_BRANCH_INSTRUCTIONS);
        if branch_instructions.is_some() {
            member_order.push(BRANCH_INSTRUCTIONS);
        }

        let cache_references = try_open(b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CACHE_REFERENCES);
        if cache_references.is_some() {
            member_order.push(CACHE_REFERENCES);
        }

        let read_buf = vec![0u8; 8 + 8 + 8 + member_order.len() * 8];

        let slots: [Slot; SLOT_COUNT] = [
            Slot::Mandatory(leader),
            Slot::Mandatory(instructions),
            Slot::Optional(cache_miss),
            Slot::Optional(branch_misses),
            Slot::Optional(branch_instructions),
            Slot::Optional(cache_references),
        ];

        let session = Self {
            pid,
            cpu,
            slots,
            member_order,
            read_buf,
        };
        session.reset()?;
        session.enable()?;
        Ok(session)
    }

    fn leader(&self) -> &std::fs::File {
        self.slots[CYCLES]
            .file()
            .expect("cycles counter is mandatory and always open")
    }

    pub fn target(&self) -> (i32, i32) {
        (self.pid, self.cpu)
    }

    /// Reads every open slot via a single grouped read on the leader,
    /// applies the scale correction, and fills unopened slots with zero.
    pub fn read(&mut self) -> io::Result<PmuReading> {
        let needed = 8 + 8 + 8 + self.member_order.len() * 8;
        if self.read_buf.len() < needed {
            self.read_buf.resize(needed, 0);
        }
        let leader = self.slots[CYCLES]
            .file()
            .expect("cycles counter is mandatory and always open");
        let n = read(leader, &mut self.read_buf[..needed])?;
        if n != needed {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "short perf_event group read",
            ));
        }

        let mut off = 0;
        let take_u64 = |buf: &[u8], off: &mut usize| -> u64 {
            let v = u64::from_ne_bytes(buf[*off..*off + 8].try_into().unwrap());
            *off += 8;
            v
        };

        let _nr = take_u64(&self.read_buf, &mut off);
        let time_enabled = take_u64(&self.read_buf, &mut off);
        let time_running = take_u64(&self.read_buf, &mut off);

        let mut values = [0u64; SLOT_COUNT];
        for &slot_idx in &self.member_order {
            let raw = take_u64(&self.read_buf, &mut off);
            values[slot_idx] = scale(raw, time_enabled, time_running);
        }

        Ok(PmuReading {
            values,
            time_enabled,
            time_running,
        })
    }

    pub fn reset(&self) -> io::Result<()> {
        ioctl_arg(self.leader(), b::PERF_IOC_OP_RESET, b::PERF_IOC_FLAG_GROUP)?;
        Ok(())
    }

    pub fn enable(&self) -> io::Result<()> {
        ioctl_arg(self.leader(), b::PERF_IOC_OP_ENABLE, b::PERF_IOC_FLAG_GROUP)?;
        Ok(())
    }

    pub fn disable(&self) -> io::Result<()> {
        ioctl_arg(self.leader(), b::PERF_IOC_OP_DISABLE, b::PERF_IOC_FLAG_GROUP)?;
        Ok(())
    }

    /// Disables the group and releases every open descriptor. Called on
    /// every exit path from the sampler loop; consumes `self`
    /// so there is no use-after-close state to guard against.
    pub fn close(self) {
        let _ = self.disable();
        // Dropping `self` here closes every `File` (leader included).
    }
}
