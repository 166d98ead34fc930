//! Static description of the host, captured when a run begins.

use serde::{Deserialize, Serialize};

/// Information about the machine on which a run is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// A friendly or logical name for the machine (the short hostname).
    pub name: String,
    pub hostname: String,
    /// Operating system name, for instance `linux`.
    pub os: String,
    /// Operating system release, for instance the kernel version.
    pub os_version: String,
    pub arch: String,
    /// Linux distribution id (e.g. `debian`), from `/etc/os-release`.
    pub distro_id: Option<String>,
    pub distro_version: Option<String>,
    /// Number of logical CPUs available to this process.
    pub process_cpus: usize,
    /// Number of logical CPUs of the machine.
    pub logical_cores: Option<usize>,
    /// Number of physical cores of the machine.
    pub physical_cores: Option<usize>,
}

impl MachineRecord {
    /// Describes the current machine (best-effort).
    pub fn capture() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                log::warn!("unable to retrieve the hostname: {e}");
                String::from("unknown")
            });
        let name = hostname.split('.').next().unwrap_or(&hostname).to_owned();
        let (distro_id, distro_version) = match std::fs::read_to_string("/etc/os-release") {
            Ok(content) => parse_os_release(&content),
            Err(_) => (None, None),
        };
        let (logical_cores, physical_cores) = core_counts();
        Self {
            name,
            hostname,
            os: std::env::consts::OS.to_owned(),
            os_version: os_release().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_owned(),
            distro_id,
            distro_version,
            process_cpus: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            logical_cores,
            physical_cores,
        }
    }
}

/// Extracts `ID` and `VERSION_ID` from the content of an `os-release` file.
fn parse_os_release(content: &str) -> (Option<String>, Option<String>) {
    let mut id = None;
    let mut version = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_owned();
        match key.trim() {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => (),
        }
    }
    (id, version)
}

/// Returns the number of logical CPUs and of physical cores, from `/proc/cpuinfo`.
#[cfg(target_os = "linux")]
fn core_counts() -> (Option<usize>, Option<usize>) {
    use procfs::Current;

    match procfs::CpuInfo::current() {
        Ok(info) => count_cores(&info),
        Err(e) => {
            log::warn!("unable to read /proc/cpuinfo: {e}");
            (None, None)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn core_counts() -> (Option<usize>, Option<usize>) {
    (None, None)
}

/// A physical core is a distinct (`physical id`, `core id`) pair. Some platforms
/// do not report them, the physical count is then unknown.
#[cfg(target_os = "linux")]
fn count_cores(info: &procfs::CpuInfo) -> (Option<usize>, Option<usize>) {
    let logical = info.num_cores();
    let physical: std::collections::BTreeSet<(&str, &str)> = (0..logical)
        .filter_map(|cpu| Some((info.get_field(cpu, "physical id")?, info.get_field(cpu, "core id")?)))
        .collect();
    (Some(logical), (!physical.is_empty()).then_some(physical.len()))
}

#[cfg(unix)]
fn os_release() -> Option<String> {
    // SAFETY: uname only writes into the struct that we provide.
    let mut uts = unsafe { std::mem::zeroed::<libc::utsname>() };
    let res = unsafe { libc::uname(&mut uts) };
    if res != 0 {
        return None;
    }
    // SAFETY: on success, `release` is a nul-terminated string.
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn os_release() -> Option<String> {
    None
}
