//! Hand-written `perf_event_open(2)` ABI surface.
//!
//! Normally this crate's teacher picks up `struct perf_event_attr` from
//! `linux/perf_event.h` via `bindgen` against the target's installed kernel
//! headers, versioned across a ladder of `linux-X.Y` features. This
//! detector targets one stable ABI shape rather than a matrix of kernel
//! releases, so the struct and the constants it needs are written out
//! directly against the stable UAPI layout instead of generated at build
//! time.

#![allow(non_camel_case_types)]

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

pub const PERF_IOC_OP_ENABLE: u64 = 0x2400;
pub const PERF_IOC_OP_DISABLE: u64 = 0x2401;
pub const PERF_IOC_OP_RESET: u64 = 0x2403;
pub const PERF_IOC_FLAG_GROUP: u64 = 1 << 0;

/// `struct perf_event_attr`, stable-ABI fields only — this crate never
/// touches the breakpoint/BPF/aux extensions, so they are omitted rather
/// than carried as unused padding.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

impl Default for perf_event_attr {
    fn default() -> Self {
        // Every field is a plain integer; all-zero is a valid bit pattern.
        unsafe { std::mem::zeroed() }
    }
}

impl perf_event_attr {
    const DISABLED_BIT: u64 = 1 << 0;
    const INHERIT_BIT: u64 = 1 << 1;
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;

    pub fn new(ty: u32, config: u64) -> Self {
        let mut attr = Self {
            type_: ty,
            size: std::mem::size_of::<Self>() as u32,
            config,
            ..Self::default()
        };
        attr.set_disabled(true);
        attr.set_exclude_kernel(true);
        attr.set_exclude_hv(true);
        attr
    }

    fn set_bit(&mut self, bit: u64, val: bool) {
        if val {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn set_disabled(&mut self, val: bool) {
        self.set_bit(Self::DISABLED_BIT, val)
    }

    pub fn set_inherit(&mut self, val: bool) {
        self.set_bit(Self::INHERIT_BIT, val)
    }

    pub fn set_exclude_kernel(&mut self, val: bool) {
        self.set_bit(Self::EXCLUDE_KERNEL_BIT, val)
    }

    pub fn set_exclude_hv(&mut self, val: bool) {
        self.set_bit(Self::EXCLUDE_HV_BIT, val)
    }
}
