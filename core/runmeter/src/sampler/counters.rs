//! Native resource counters.

use std::time::Duration;

use crate::error::CounterUnavailableError;
use crate::measurement::NativeMetric;

/// Cumulative CPU time of the whole machine, summed over all its CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCpuTime {
    /// Time spent doing something else than idling.
    pub busy: Duration,
    pub total: Duration,
}

/// The values of the native counters at some point in time.
///
/// Each counter is read independently: one of them can fail without affecting the others.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    /// Total CPU time spent in user mode since the process started.
    pub cpu_user: Result<Duration, CounterUnavailableError>,
    /// Total CPU time spent in kernel mode since the process started.
    pub cpu_system: Result<Duration, CounterUnavailableError>,
    /// Current resident set size, in bytes.
    pub resident: Result<u64, CounterUnavailableError>,
    /// Highest resident set size, in bytes.
    pub peak_resident: Result<u64, CounterUnavailableError>,
    pub system_cpu: Result<SystemCpuTime, CounterUnavailableError>,
}

impl CounterSnapshot {
    /// A snapshot where every counter is unsupported.
    pub fn unsupported() -> Self {
        Self {
            cpu_user: Err(CounterUnavailableError::unsupported(NativeMetric::CpuUser)),
            cpu_system: Err(CounterUnavailableError::unsupported(NativeMetric::CpuSystem)),
            resident: Err(CounterUnavailableError::unsupported(NativeMetric::Resident)),
            peak_resident: Err(CounterUnavailableError::unsupported(NativeMetric::PeakResident)),
            system_cpu: Err(CounterUnavailableError::unsupported(NativeMetric::SystemCpu)),
        }
    }

    /// Returns the errors of the counters that could not be read.
    pub fn errors(&self) -> impl Iterator<Item = &CounterUnavailableError> {
        [
            self.cpu_user.as_ref().err(),
            self.cpu_system.as_ref().err(),
            self.resident.as_ref().err(),
            self.peak_resident.as_ref().err(),
            self.system_cpu.as_ref().err(),
        ]
        .into_iter()
        .flatten()
    }
}

/// A provider of native resource counters.
pub trait CounterSource: Send {
    fn read(&mut self) -> CounterSnapshot;
}

/// Counters of the current process, and of the machine.
///
/// On Unix, CPU times and peak memory come from `getrusage`. On Linux, the
/// current memory comes from `/proc/self/statm` and the CPU time of the machine
/// from `/proc/stat`.
pub struct ProcessCounters {
    #[cfg(target_os = "linux")]
    process: Option<procfs::process::Process>,
    #[cfg(target_os = "linux")]
    kernel_stats: Option<linux::KernelStatsReader>,
}

impl ProcessCounters {
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            process: procfs::process::Process::myself()
                .inspect_err(|e| log::warn!("/proc/self is not readable, memory usage will be missing: {e}"))
                .ok(),
            #[cfg(target_os = "linux")]
            kernel_stats: linux::KernelStatsReader::open()
                .inspect_err(|e| log::warn!("/proc/stat is not readable, system CPU usage will be missing: {e}"))
                .ok(),
        }
    }
}

impl Default for ProcessCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl CounterSource for ProcessCounters {
    fn read(&mut self) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot::unsupported();
        match unix::rusage_self() {
            Ok(usage) => {
                snapshot.cpu_user = Ok(unix::timeval_to_duration(usage.ru_utime));
                snapshot.cpu_system = Ok(unix::timeval_to_duration(usage.ru_stime));
                snapshot.peak_resident = Ok(unix::maxrss_bytes(usage.ru_maxrss));
            }
            Err(e) => {
                let reason = format!("getrusage failed: {e}");
                snapshot.cpu_user = Err(CounterUnavailableError::new(NativeMetric::CpuUser, &reason));
                snapshot.cpu_system = Err(CounterUnavailableError::new(NativeMetric::CpuSystem, &reason));
                snapshot.peak_resident = Err(CounterUnavailableError::new(NativeMetric::PeakResident, reason));
            }
        }
        #[cfg(target_os = "linux")]
        {
            snapshot.resident = match &self.process {
                Some(process) => linux::resident_bytes(process).map_err(|e| {
                    CounterUnavailableError::new(NativeMetric::Resident, format!("/proc/self/statm: {e}"))
                }),
                None => Err(CounterUnavailableError::new(NativeMetric::Resident, "/proc/self is not readable")),
            };
            snapshot.system_cpu = match &mut self.kernel_stats {
                Some(stats) => stats.system_cpu().map_err(|e| {
                    CounterUnavailableError::new(NativeMetric::SystemCpu, format!("/proc/stat: {e}"))
                }),
                None => Err(CounterUnavailableError::new(NativeMetric::SystemCpu, "/proc/stat is not readable")),
            };
        }
        snapshot
    }
}

#[cfg(not(unix))]
impl CounterSource for ProcessCounters {
    fn read(&mut self) -> CounterSnapshot {
        CounterSnapshot::unsupported()
    }
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::mem::MaybeUninit;
    use std::time::Duration;

    pub fn rusage_self() -> io::Result<libc::rusage> {
        let mut usage = MaybeUninit::<libc::rusage>::uninit();
        // SAFETY: getrusage writes into the struct that we provide, and we only read it on success.
        let res = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if res == 0 {
            Ok(unsafe { usage.assume_init() })
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn timeval_to_duration(tv: libc::timeval) -> Duration {
        Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
    }

    /// `ru_maxrss` is in kilobytes on Linux and in bytes on macOS.
    pub fn maxrss_bytes(maxrss: libc::c_long) -> u64 {
        let value = maxrss.max(0) as u64;
        if cfg!(target_os = "macos") { value } else { value * 1024 }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::io::{BufReader, Seek};
    use std::time::Duration;

    use procfs::{
        CpuTime, ExplicitSystemInfo, FromBufReadSI, KernelStats, LocalSystemInfo, ProcResult, SystemInfoInterface,
        process::Process,
    };

    use super::SystemCpuTime;

    /// Reads the resident memory of a process, in bytes.
    pub fn resident_bytes(process: &Process) -> ProcResult<u64> {
        Ok(process.statm()?.resident * procfs::page_size())
    }

    /// A reader opened to `/proc/stat`.
    pub struct KernelStatsReader {
        reader: BufReader<File>,
        sysinfo: ExplicitSystemInfo,
    }

    impl KernelStatsReader {
        pub fn open() -> ProcResult<Self> {
            let sysinfo = LocalSystemInfo;
            Ok(Self {
                reader: BufReader::new(File::open("/proc/stat")?),
                sysinfo: ExplicitSystemInfo {
                    boot_time_secs: sysinfo.boot_time_secs()?,
                    ticks_per_second: sysinfo.ticks_per_second(),
                    page_size: sysinfo.page_size(),
                    is_little_endian: sysinfo.is_little_endian(),
                },
            })
        }

        /// Reads the CPU time of the machine.
        pub fn system_cpu(&mut self) -> ProcResult<SystemCpuTime> {
            self.reader.rewind()?;
            let stats = KernelStats::from_buf_read(&mut self.reader, &self.sysinfo)?;
            Ok(cpu_time_split(&stats.total))
        }
    }

    pub fn cpu_time_split(cpu: &CpuTime) -> SystemCpuTime {
        // guest time is already counted in user time
        let busy_ms = cpu.user_ms()
            + cpu.nice_ms()
            + cpu.system_ms()
            + cpu.irq_ms().unwrap_or(0)
            + cpu.softirq_ms().unwrap_or(0)
            + cpu.steal_ms().unwrap_or(0);
        let idle_ms = cpu.idle_ms() + cpu.iowait_ms().unwrap_or(0);
        SystemCpuTime {
            busy: Duration::from_millis(busy_ms),
            total: Duration::from_millis(busy_ms + idle_ms),
        }
    }
}

/// Deterministic counters.
///
/// Each read advances the CPU times by a fixed step. Useful on hosts that do not
/// provide native counters, and in tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCounters {
    reads: u32,
    cpu_user_step: Duration,
    cpu_system_step: Duration,
    resident: u64,
    system_busy_step: Duration,
    system_total_step: Duration,
    unavailable: Vec<NativeMetric>,
}

impl ScriptedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CPU time that is added at each read.
    pub fn with_cpu_step(mut self, user: Duration, system: Duration) -> Self {
        self.cpu_user_step = user;
        self.cpu_system_step = system;
        self
    }

    /// Sets the busy and total CPU time of the machine that are added at each read.
    pub fn with_system_cpu(mut self, busy: Duration, total: Duration) -> Self {
        self.system_busy_step = busy;
        self.system_total_step = total;
        self
    }

    pub fn with_resident(mut self, bytes: u64) -> Self {
        self.resident = bytes;
        self
    }

    /// Makes a counter fail on every read.
    pub fn with_unavailable(mut self, metric: NativeMetric) -> Self {
        self.unavailable.push(metric);
        self
    }

    /// Number of reads so far.
    pub fn reads(&self) -> u32 {
        self.reads
    }

    fn check(&self, metric: NativeMetric) -> Result<(), CounterUnavailableError> {
        if self.unavailable.contains(&metric) {
            Err(CounterUnavailableError::new(metric, "disabled"))
        } else {
            Ok(())
        }
    }
}

impl CounterSource for ScriptedCounters {
    fn read(&mut self) -> CounterSnapshot {
        self.reads += 1;
        CounterSnapshot {
            cpu_user: self
                .check(NativeMetric::CpuUser)
                .map(|_| self.cpu_user_step * self.reads),
            cpu_system: self
                .check(NativeMetric::CpuSystem)
                .map(|_| self.cpu_system_step * self.reads),
            resident: self.check(NativeMetric::Resident).map(|_| self.resident),
            peak_resident: self.check(NativeMetric::PeakResident).map(|_| self.resident),
            system_cpu: self.check(NativeMetric::SystemCpu).map(|_| SystemCpuTime {
                busy: self.system_busy_step * self.reads,
                total: self.system_total_step * self.reads,
            }),
        }
    }
}
