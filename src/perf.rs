//! Per-thread hardware/software performance counters via `perf_event_open(2)`.
//!
//! A [`PerfEvent`] wraps one kernel counter scoped to the calling thread.
//! Creation returns `None` on any failure (no permission, no kernel support)
//! and callers fall back to zero-valued metrics — counter availability is
//! never fatal. Ownership of the file descriptor moves with the value; the
//! counter is disabled and the descriptor closed on drop.

/// Execution contexts a counter integrates over, as a bitmask. Unselected
/// domains map to the kernel's `exclude_*` attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain(u8);

impl Domain {
    pub const USER: Domain = Domain(0b0001);
    pub const KERNEL: Domain = Domain(0b0010);
    pub const HYPERVISOR: Domain = Domain(0b0100);
    pub const IDLE: Domain = Domain(0b1000);
    pub const ALL: Domain = Domain(0b1111);

    pub const fn contains(self, other: Domain) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Domain {
    type Output = Domain;

    fn bitor(self, other: Domain) -> Domain {
        Domain(self.0 | other.0)
    }
}

/// Top-level counter class, matching `perf_event_attr.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeId {
    Hardware,
    Software,
    Tracepoint,
    HwCache,
    Raw,
    Breakpoint,
}

impl TypeId {
    fn raw(self) -> u32 {
        match self {
            TypeId::Hardware => 0,
            TypeId::Software => 1,
            TypeId::Tracepoint => 2,
            TypeId::HwCache => 3,
            TypeId::Raw => 4,
            TypeId::Breakpoint => 5,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TypeId::Hardware => "HARDWARE",
            TypeId::Software => "SOFTWARE",
            TypeId::Tracepoint => "TRACEPOINT",
            TypeId::HwCache => "HW_CACHE",
            TypeId::Raw => "RAW",
            TypeId::Breakpoint => "BREAKPOINT",
        }
    }
}

/// The specific event within a [`TypeId`], matching `perf_event_attr.config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    HwCpuCycles,
    HwInstructions,
    SwCpuClock,
    SwTaskClock,
    SwDummy,
}

impl Config {
    fn raw(self) -> u64 {
        match self {
            Config::HwCpuCycles => 0,
            Config::HwInstructions => 1,
            Config::SwCpuClock => 0,
            Config::SwTaskClock => 1,
            Config::SwDummy => 9,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Config::HwCpuCycles => "HW_CPU_CYCLES",
            Config::HwInstructions => "HW_INSTRUCTIONS",
            Config::SwCpuClock => "SW_CPU_CLOCK",
            Config::SwTaskClock => "SW_TASK_CLOCK",
            Config::SwDummy => "SW_DUMMY",
        }
    }
}

/// A raw cumulative counter reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Count {
    pub value: u64,
}

fn domain_name(domain: Domain) -> String {
    let mut name = String::from("(");
    if domain.contains(Domain::USER) {
        name.push_str("usr:");
    }
    if domain.contains(Domain::KERNEL) {
        name.push_str("sys:");
    }
    if domain.contains(Domain::IDLE) {
        name.push_str("idle:");
    }
    if domain.contains(Domain::HYPERVISOR) {
        name.push_str("hv:");
    }
    name.push(')');
    name
}

pub use imp::PerfEvent;

#[cfg(target_os = "linux")]
mod imp {
    use std::fmt::Write as _;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::{domain_name, Config, Count, Domain, TypeId};

    // PERF_ATTR_SIZE_VER5 layout; newer kernels accept older sizes. libc
    // does not export perf_event_attr, so it is declared here. The flags
    // field packs the attribute bitfield; only the bits below are used.
    #[repr(C)]
    #[derive(Default)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period_or_freq: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events_or_watermark: u32,
        bp_type: u32,
        config1: u64,
        config2: u64,
        branch_sample_type: u64,
        sample_regs_user: u64,
        sample_stack_user: u32,
        clockid: i32,
        sample_regs_intr: u64,
        aux_watermark: u32,
        sample_max_stack: u16,
        reserved_2: u16,
    }

    const FLAG_DISABLED: u64 = 1 << 0;
    const FLAG_EXCLUDE_USER: u64 = 1 << 4;
    const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
    const FLAG_EXCLUDE_HV: u64 = 1 << 6;
    const FLAG_EXCLUDE_IDLE: u64 = 1 << 7;

    const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
    const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
    const PERF_EVENT_IOC_ID: libc::c_ulong = 0x8008_2407;

    /// One open kernel counter scoped to the thread that created it.
    #[derive(Debug)]
    pub struct PerfEvent {
        fd: OwnedFd,
        id: u64,
        type_id: TypeId,
        config: Config,
        domain: Domain,
    }

    impl PerfEvent {
        /// Open a disabled counter for the calling thread on any CPU.
        /// Returns `None` on any failure.
        pub fn create(type_id: TypeId, config: Config, domain: Domain) -> Option<PerfEvent> {
            let mut attr = PerfEventAttr {
                type_: type_id.raw(),
                size: std::mem::size_of::<PerfEventAttr>() as u32,
                config: config.raw(),
                flags: FLAG_DISABLED,
                ..PerfEventAttr::default()
            };
            if !domain.contains(Domain::USER) {
                attr.flags |= FLAG_EXCLUDE_USER;
            }
            if !domain.contains(Domain::KERNEL) {
                attr.flags |= FLAG_EXCLUDE_KERNEL;
            }
            if !domain.contains(Domain::HYPERVISOR) {
                attr.flags |= FLAG_EXCLUDE_HV;
            }
            if !domain.contains(Domain::IDLE) {
                attr.flags |= FLAG_EXCLUDE_IDLE;
            }

            // pid = 0, cpu = -1: this thread, any CPU.
            let raw = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &attr as *const PerfEventAttr,
                    0 as libc::pid_t,
                    -1 as libc::c_int,
                    -1 as libc::c_int,
                    0 as libc::c_ulong,
                )
            };
            if raw < 0 {
                return None;
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw as libc::c_int) };

            let mut id: u64 = 0;
            // Best effort; a kernel too old for IOC_ID leaves it zero.
            unsafe {
                libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ID, &mut id as *mut u64);
            }

            Some(PerfEvent {
                fd,
                id,
                type_id,
                config,
                domain,
            })
        }

        /// Reset the accumulated count to zero and start counting.
        pub fn enable(&self) {
            unsafe {
                libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_RESET, 0);
                libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0);
            }
        }

        /// Read the raw cumulative count without stopping the counter.
        pub fn now(&self, count: &mut Count) -> bool {
            let bytes = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    count as *mut Count as *mut libc::c_void,
                    std::mem::size_of::<Count>(),
                )
            };
            bytes == std::mem::size_of::<Count>() as isize
        }

        /// Stop counting. The accumulated value remains readable.
        pub fn disable(&self) {
            unsafe {
                libc::ioctl(self.fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE, 0);
            }
        }

        /// Diagnostic name, e.g. `SOFTWARE:SW_TASK_CLOCK:(usr:):4`.
        pub fn name(&self) -> String {
            let mut name = String::new();
            let _ = write!(
                name,
                "{}:{}:{}:{}",
                self.type_id.label(),
                self.config.label(),
                domain_name(self.domain),
                self.id
            );
            name
        }

        pub fn id(&self) -> u64 {
            self.id
        }

        pub fn type_id(&self) -> TypeId {
            self.type_id
        }

        pub fn config(&self) -> Config {
            self.config
        }

        pub fn domain(&self) -> Domain {
            self.domain
        }
    }

    impl Drop for PerfEvent {
        fn drop(&mut self) {
            self.disable();
            // OwnedFd closes the descriptor.
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{Config, Count, Domain, TypeId};

    /// Stub for targets without the perf facility: `create` always fails and
    /// callers degrade to zero-valued metrics.
    #[derive(Debug)]
    pub struct PerfEvent {
        type_id: TypeId,
        config: Config,
        domain: Domain,
    }

    impl PerfEvent {
        pub fn create(type_id: TypeId, config: Config, domain: Domain) -> Option<PerfEvent> {
            let _ = (type_id, config, domain);
            None
        }

        pub fn enable(&self) {}

        pub fn now(&self, _count: &mut Count) -> bool {
            false
        }

        pub fn disable(&self) {}

        pub fn name(&self) -> String {
            format!(
                "{}:{}:{}:0",
                self.type_id.label(),
                self.config.label(),
                super::domain_name(self.domain)
            )
        }

        pub fn id(&self) -> u64 {
            0
        }

        pub fn type_id(&self) -> TypeId {
            self.type_id
        }

        pub fn config(&self) -> Config {
            self.config
        }

        pub fn domain(&self) -> Domain {
            self.domain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_bitmask_combines() {
        let d = Domain::USER | Domain::KERNEL;
        assert!(d.contains(Domain::USER));
        assert!(d.contains(Domain::KERNEL));
        assert!(!d.contains(Domain::IDLE));
        assert!(Domain::ALL.contains(d));
    }

    #[test]
    fn domain_name_formatting() {
        assert_eq!(domain_name(Domain::USER), "(usr:)");
        assert_eq!(domain_name(Domain::ALL), "(usr:sys:idle:hv:)");
    }

    // Counter availability depends on kernel config and
    // perf_event_paranoid; the test only asserts the non-fatal contract.
    #[cfg(target_os = "linux")]
    #[test]
    fn task_clock_advances_or_degrades() {
        match PerfEvent::create(TypeId::Software, Config::SwTaskClock, Domain::ALL) {
            Some(event) => {
                event.enable();
                let mut buf = [0u8; 4096];
                for i in 0u64..50_000 {
                    for b in &mut buf {
                        *b = b.wrapping_add(i as u8).wrapping_mul(31);
                    }
                }
                std::hint::black_box(&buf);
                let mut count = Count::default();
                assert!(event.now(&mut count));
                assert!(count.value > 0, "task clock should advance during compute");
                event.disable();
                assert!(event.name().starts_with("SOFTWARE:SW_TASK_CLOCK:"));
            }
            None => {
                // Environment denies perf; degrading to None is the contract.
            }
        }
    }
}
