//! Thread and process metadata providers.
//!
//! The engine consumes these two narrow traits and nothing else about the
//! OS. On Linux the per-thread CPU split comes primarily from two perf
//! task-clock counters (user and kernel domains), falling back to
//! `/proc/self/task/<tid>/stat` when perf is unavailable; process-side
//! numbers come from `/proc`. Everywhere else the null providers report
//! zero — a missing OS facility degrades the metric, never the engine.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-thread metadata. `update()` refreshes the cached CPU readings;
/// `finalize()` is called once at thread exit and records the end
/// timestamp and the final thread name.
pub trait ThreadInfoSource: Send + Sync {
    fn thread_id(&self) -> u64;
    fn thread_name(&self) -> String;
    fn native_handle(&self) -> u64;
    /// CPU time spent in user mode, microseconds.
    fn cpu_user_time(&self) -> u64;
    /// CPU time spent in kernel mode, microseconds.
    fn cpu_system_time(&self) -> u64;
    fn update(&self);
    fn finalize(&self);
    /// Milliseconds since the Unix epoch.
    fn start_timestamp(&self) -> u64;
    /// Zero until `finalize()` has run.
    fn end_timestamp(&self) -> u64;
}

/// Process-wide metadata, queried on demand by the dump path.
pub trait ProcessInfoSource: Send + Sync {
    fn process_name(&self) -> String;
    fn process_id(&self) -> i64;
    /// Machine physical memory, bytes.
    fn physical_memory(&self) -> i64;
    /// Resident set size, bytes.
    fn resident_size(&self) -> i64;
    /// Virtual size, bytes.
    fn virtual_size(&self) -> i64;
    /// Microseconds.
    fn cpu_user_time(&self) -> i64;
    /// Microseconds.
    fn cpu_system_time(&self) -> i64;
    fn thread_count(&self) -> i64;
    /// Milliseconds since the Unix epoch.
    fn start_timestamp(&self) -> i64;
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Build the provider for the calling thread.
pub fn current_thread_info() -> Box<dyn ThreadInfoSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxThreadInfo::for_current_thread())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullThreadInfo::for_current_thread())
    }
}

/// Build the process provider.
pub fn process_info() -> Box<dyn ProcessInfoSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxProcessInfo::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullProcessInfo::new())
    }
}

/// Fallback provider: identity from std, all metrics zero.
pub struct NullThreadInfo {
    name: String,
    start_ts: u64,
    end_ts: Mutex<u64>,
}

impl NullThreadInfo {
    pub fn for_current_thread() -> Self {
        Self {
            name: std::thread::current().name().unwrap_or_default().to_owned(),
            start_ts: now_unix_ms(),
            end_ts: Mutex::new(0),
        }
    }
}

impl ThreadInfoSource for NullThreadInfo {
    fn thread_id(&self) -> u64 {
        0
    }
    fn thread_name(&self) -> String {
        self.name.clone()
    }
    fn native_handle(&self) -> u64 {
        0
    }
    fn cpu_user_time(&self) -> u64 {
        0
    }
    fn cpu_system_time(&self) -> u64 {
        0
    }
    fn update(&self) {}
    fn finalize(&self) {
        *self.end_ts.lock().unwrap_or_else(|e| e.into_inner()) = now_unix_ms();
    }
    fn start_timestamp(&self) -> u64 {
        self.start_ts
    }
    fn end_timestamp(&self) -> u64 {
        *self.end_ts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fallback process provider: pid from std, all metrics zero.
pub struct NullProcessInfo {
    start_ts: i64,
}

impl NullProcessInfo {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            start_ts: now_unix_ms() as i64,
        }
    }
}

impl ProcessInfoSource for NullProcessInfo {
    fn process_name(&self) -> String {
        String::new()
    }
    fn process_id(&self) -> i64 {
        std::process::id() as i64
    }
    fn physical_memory(&self) -> i64 {
        0
    }
    fn resident_size(&self) -> i64 {
        0
    }
    fn virtual_size(&self) -> i64 {
        0
    }
    fn cpu_user_time(&self) -> i64 {
        0
    }
    fn cpu_system_time(&self) -> i64 {
        0
    }
    fn thread_count(&self) -> i64 {
        0
    }
    fn start_timestamp(&self) -> i64 {
        self.start_ts
    }
}

/// Split `/proc/*/stat` content after the parenthesized comm field and
/// return (utime_ticks, stime_ticks). Fields 14 and 15, 1-indexed from pid.
fn parse_stat_cpu_ticks(stat: &str) -> Option<(u64, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // `rest` starts at field 3 (state); utime/stime are fields 14/15.
    let utime = fields.nth(11)?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

/// Extract a `kB` quantity like `VmRSS:    1234 kB` from `/proc` status
/// text, returned in bytes.
fn parse_status_kb(status: &str, key: &str) -> Option<i64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start_matches(':').trim();
            let value: i64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(value * 1024);
        }
    }
    None
}

fn parse_status_count(status: &str, key: &str) -> Option<i64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            return rest.trim_start_matches(':').trim().parse().ok();
        }
    }
    None
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;
    use std::sync::Mutex;

    use super::{
        now_unix_ms, parse_stat_cpu_ticks, parse_status_count, parse_status_kb,
        ProcessInfoSource, ThreadInfoSource,
    };
    use crate::perf::{Config, Count, Domain, PerfEvent, TypeId};

    fn clock_ticks_per_sec() -> u64 {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            ticks as u64
        } else {
            100
        }
    }

    fn ticks_to_us(ticks: u64) -> u64 {
        ticks * 1_000_000 / clock_ticks_per_sec()
    }

    #[derive(Default)]
    struct ThreadState {
        user_us: u64,
        sys_us: u64,
        name_cache: String,
        end_ts: u64,
        finalized: bool,
    }

    /// Linux per-thread provider.
    ///
    /// CPU split from two task-clock counters opened with the user and
    /// kernel domains — one counter stream per mode approximates the split
    /// without per-mode hardware counters. When perf is unavailable the
    /// split comes from `/proc` at clock-tick granularity instead.
    pub struct LinuxThreadInfo {
        tid: u32,
        native: u64,
        start_ts: u64,
        user_clock: Option<PerfEvent>,
        kernel_clock: Option<PerfEvent>,
        state: Mutex<ThreadState>,
    }

    impl LinuxThreadInfo {
        pub fn for_current_thread() -> Self {
            let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
            let native = unsafe { libc::pthread_self() } as u64;
            let user_clock =
                PerfEvent::create(TypeId::Software, Config::SwTaskClock, Domain::USER);
            let kernel_clock =
                PerfEvent::create(TypeId::Software, Config::SwTaskClock, Domain::KERNEL);
            match (&user_clock, &kernel_clock) {
                (Some(user), Some(kernel)) => {
                    user.enable();
                    kernel.enable();
                    log::debug!(
                        "thread {tid}: task clocks {} / {}",
                        user.name(),
                        kernel.name()
                    );
                }
                _ => {
                    log::debug!("thread {tid}: perf unavailable, CPU split from /proc");
                }
            }
            Self {
                tid,
                native,
                start_ts: now_unix_ms(),
                user_clock,
                kernel_clock,
                state: Mutex::new(ThreadState::default()),
            }
        }

        fn read_perf_split(&self) -> Option<(u64, u64)> {
            let user = self.user_clock.as_ref()?;
            let kernel = self.kernel_clock.as_ref()?;
            let mut user_count = Count::default();
            let mut kernel_count = Count::default();
            if user.now(&mut user_count) && kernel.now(&mut kernel_count) {
                // Task clock counts nanoseconds.
                Some((user_count.value / 1_000, kernel_count.value / 1_000))
            } else {
                None
            }
        }

        fn read_proc_split(&self) -> Option<(u64, u64)> {
            let stat = fs::read_to_string(format!("/proc/self/task/{}/stat", self.tid)).ok()?;
            let (utime, stime) = parse_stat_cpu_ticks(&stat)?;
            Some((ticks_to_us(utime), ticks_to_us(stime)))
        }

        fn read_name(&self) -> String {
            fs::read_to_string(format!("/proc/self/task/{}/comm", self.tid))
                .map(|s| s.trim_end().to_owned())
                .unwrap_or_default()
        }
    }

    impl ThreadInfoSource for LinuxThreadInfo {
        fn thread_id(&self) -> u64 {
            self.tid as u64
        }

        fn thread_name(&self) -> String {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finalized || !state.name_cache.is_empty() {
                return state.name_cache.clone();
            }
            drop(state);
            self.read_name()
        }

        fn native_handle(&self) -> u64 {
            self.native
        }

        fn cpu_user_time(&self) -> u64 {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).user_us
        }

        fn cpu_system_time(&self) -> u64 {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).sys_us
        }

        fn update(&self) {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finalized {
                return;
            }
            let split = self.read_perf_split().or_else(|| self.read_proc_split());
            if let Some((user, sys)) = split {
                // Readings are cumulative; keep the cache monotone even if a
                // fallback source briefly reads behind the previous one.
                state.user_us = state.user_us.max(user);
                state.sys_us = state.sys_us.max(sys);
            }
        }

        fn finalize(&self) {
            self.update();
            let name = self.read_name();
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.name_cache = name;
            state.end_ts = now_unix_ms();
            state.finalized = true;
            drop(state);
            if let Some(clock) = &self.user_clock {
                clock.disable();
            }
            if let Some(clock) = &self.kernel_clock {
                clock.disable();
            }
        }

        fn start_timestamp(&self) -> u64 {
            self.start_ts
        }

        fn end_timestamp(&self) -> u64 {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).end_ts
        }
    }

    /// Linux process provider, queried from `/proc` on demand.
    pub struct LinuxProcessInfo {
        start_ts: i64,
    }

    impl LinuxProcessInfo {
        #[allow(clippy::new_without_default)]
        pub fn new() -> Self {
            Self {
                start_ts: now_unix_ms() as i64,
            }
        }

        fn status(&self) -> String {
            fs::read_to_string("/proc/self/status").unwrap_or_default()
        }
    }

    impl ProcessInfoSource for LinuxProcessInfo {
        fn process_name(&self) -> String {
            fs::read_to_string("/proc/self/comm")
                .map(|s| s.trim_end().to_owned())
                .unwrap_or_default()
        }

        fn process_id(&self) -> i64 {
            std::process::id() as i64
        }

        fn physical_memory(&self) -> i64 {
            let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
            parse_status_kb(&meminfo, "MemTotal").unwrap_or(0)
        }

        fn resident_size(&self) -> i64 {
            parse_status_kb(&self.status(), "VmRSS").unwrap_or(0)
        }

        fn virtual_size(&self) -> i64 {
            parse_status_kb(&self.status(), "VmSize").unwrap_or(0)
        }

        fn cpu_user_time(&self) -> i64 {
            let stat = fs::read_to_string("/proc/self/stat").unwrap_or_default();
            parse_stat_cpu_ticks(&stat)
                .map(|(utime, _)| ticks_to_us(utime) as i64)
                .unwrap_or(0)
        }

        fn cpu_system_time(&self) -> i64 {
            let stat = fs::read_to_string("/proc/self/stat").unwrap_or_default();
            parse_stat_cpu_ticks(&stat)
                .map(|(_, stime)| ticks_to_us(stime) as i64)
                .unwrap_or(0)
        }

        fn thread_count(&self) -> i64 {
            parse_status_count(&self.status(), "Threads").unwrap_or(0)
        }

        fn start_timestamp(&self) -> i64 {
            self.start_ts
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{LinuxProcessInfo, LinuxThreadInfo};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_cpu_ticks_parse_past_comm_parens() {
        // comm may contain spaces and parentheses; parsing must anchor on
        // the LAST closing paren.
        let stat = "1234 (weird) (name) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    250 75 0 0 20 0 4 0 100 1000000 500 18446744073709551615";
        let (utime, stime) = parse_stat_cpu_ticks(stat).unwrap();
        assert_eq!(utime, 250);
        assert_eq!(stime, 75);
    }

    #[test]
    fn stat_parse_rejects_garbage() {
        assert!(parse_stat_cpu_ticks("").is_none());
        assert!(parse_stat_cpu_ticks("no parens here").is_none());
        assert!(parse_stat_cpu_ticks("1 (x) S 1 2 3").is_none());
    }

    #[test]
    fn status_kb_and_count_parsing() {
        let status = "Name:\tdemo\nVmSize:\t  204800 kB\nVmRSS:\t    1024 kB\nThreads:\t7\n";
        assert_eq!(parse_status_kb(status, "VmRSS"), Some(1024 * 1024));
        assert_eq!(parse_status_kb(status, "VmSize"), Some(204800 * 1024));
        assert_eq!(parse_status_count(status, "Threads"), Some(7));
        assert_eq!(parse_status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn null_thread_info_reports_zero_metrics() {
        let info = NullThreadInfo::for_current_thread();
        info.update();
        assert_eq!(info.cpu_user_time(), 0);
        assert_eq!(info.cpu_system_time(), 0);
        assert!(info.start_timestamp() > 0);
        assert_eq!(info.end_timestamp(), 0);
        info.finalize();
        assert!(info.end_timestamp() >= info.start_timestamp());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_thread_info_updates_and_finalizes() {
        let info = LinuxThreadInfo::for_current_thread();
        // Spend a little CPU so the readings have a chance to advance.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);
        info.update();
        let user_before = info.cpu_user_time();
        info.update();
        assert!(info.cpu_user_time() >= user_before, "CPU cache is monotone");
        info.finalize();
        assert!(info.end_timestamp() >= info.start_timestamp());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_process_info_reads_proc() {
        let info = LinuxProcessInfo::new();
        assert_eq!(info.process_id(), std::process::id() as i64);
        assert!(info.resident_size() > 0);
        assert!(info.virtual_size() >= info.resident_size());
        assert!(info.thread_count() >= 1);
        assert!(!info.process_name().is_empty());
    }
}
