use std::time::Duration;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// A snapshot of the resources used so far by the calling rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// CPU time spent in user mode.
    pub user_cpu: Duration,
    /// CPU time spent in kernel mode.
    pub system_cpu: Duration,
    /// Resident set size of the process, in bytes.
    pub resident_bytes: u64,
}

impl ResourceUsage {
    pub fn now() -> Self {
        let (user_cpu, system_cpu) = cpu_times();
        Self {
            user_cpu,
            system_cpu,
            resident_bytes: resident_bytes(),
        }
    }
}

/// On Linux the CPU time of the calling thread is measured, so that ranks running as threads of
/// the same process are accounted separately.
#[cfg(target_os = "linux")]
const RUSAGE_WHO: libc::c_int = libc::RUSAGE_THREAD;
#[cfg(all(unix, not(target_os = "linux")))]
const RUSAGE_WHO: libc::c_int = libc::RUSAGE_SELF;

#[cfg(unix)]
fn cpu_times() -> (Duration, Duration) {
    // SAFETY: getrusage only writes into the struct it is given.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(RUSAGE_WHO, &mut usage) != 0 {
            log::warn!(
                "getrusage failed: {:?}",
                std::io::Error::last_os_error()
            );
            return (Duration::ZERO, Duration::ZERO);
        }
        usage
    };
    (timeval(usage.ru_utime), timeval(usage.ru_stime))
}

#[cfg(unix)]
fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(not(unix))]
fn cpu_times() -> (Duration, Duration) {
    (Duration::ZERO, Duration::ZERO)
}

fn resident_bytes() -> u64 {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            log::warn!("cannot get the current pid: {e}");
            return 0;
        }
    };
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}

/// Name of the machine this rank runs on.
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}
