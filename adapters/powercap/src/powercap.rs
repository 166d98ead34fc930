// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoules

const PERMISSION_ADVICE: &str = "Try to adjust file permissions.";

/// A RAPL power zone, for instance `package-0` or its subzone `core`.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerZone {
    /// Identifier of the zone's power source, for instance `rapl/package-0/core`.
    pub source_id: String,
    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    pub path: PathBuf,
}

/// Finds all the power zones (and subzones) below `root`, sorted by path.
pub fn power_zones(root: &Path) -> anyhow::Result<Vec<PowerZone>> {
    fn collect(dir: &Path, parent_id: &str, zones: &mut Vec<PowerZone>) -> anyhow::Result<()> {
        let entries = fs::read_dir(dir).with_context(|| format!("could not list {dir:?}"))?;
        for entry in entries {
            let path = entry?.path();
            if !is_zone_path(&path) {
                continue;
            }
            let name = fs::read_to_string(path.join("name"))
                .with_context(|| format!("could not read the name of {path:?}"))?
                .trim()
                .to_owned();
            let source_id = format!("{parent_id}/{name}");
            collect(&path, &source_id, zones)?;
            zones.push(PowerZone { source_id, path });
        }
        Ok(())
    }

    let mut zones = Vec::new();
    collect(root, "rapl", &mut zones)?;
    zones.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(zones)
}

fn is_zone_path(path: &Path) -> bool {
    let is_zone = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(POWER_ZONE_PREFIX));
    is_zone && path.is_dir()
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    /// Opens the energy counter of the zone.
    pub fn open(&self) -> anyhow::Result<OpenedPowerZone> {
        let file = File::open(self.energy_path())
            .with_context(|| format!("Could not open {:?}. {PERMISSION_ADVICE}", self.energy_path()))?;
        let max_energy = fs::read_to_string(self.max_energy_path())
            .with_context(|| format!("Could not read {:?}. {PERMISSION_ADVICE}", self.max_energy_path()))?;
        let max_energy_uj = max_energy
            .trim_end()
            .parse()
            .with_context(|| format!("parse max_energy_range_uj: '{max_energy}'"))?;
        Ok(OpenedPowerZone {
            source_id: self.source_id.clone(),
            file,
            counter: EnergyCounter::with_max_value(max_energy_uj),
            buf: Vec::with_capacity(16),
        })
    }
}

/// Opens every zone, or fails if one of them cannot be read.
pub fn open_all(zones: &[PowerZone]) -> anyhow::Result<Vec<OpenedPowerZone>> {
    if zones.is_empty() {
        return Err(anyhow!("no RAPL power zone found"));
    }
    zones.iter().map(PowerZone::open).collect()
}

/// A power zone, ready to be read.
pub struct OpenedPowerZone {
    pub source_id: String,
    file: File,
    counter: EnergyCounter,
    buf: Vec<u8>,
}

impl OpenedPowerZone {
    /// Reads the energy consumed by the zone, in joules, corrected for the overflows of the counter.
    pub fn read_joules(&mut self) -> anyhow::Result<f64> {
        let value = self.read_counter_value()?;
        let (total, overflowed) = self.counter.update(value);
        if overflowed {
            log::debug!("Overflow on powercap counter {}", self.source_id);
        }
        Ok(total as f64 * POWERCAP_ENERGY_UNIT)
    }

    fn read_counter_value(&mut self) -> anyhow::Result<u64> {
        self.buf.clear();
        self.file
            .rewind()
            .with_context(|| format!("failed to rewind {:?}", self.file))?;
        self.file
            .read_to_end(&mut self.buf)
            .with_context(|| format!("failed to read {:?}", self.file))?;
        let content = std::str::from_utf8(&self.buf)?;
        content
            .trim_end()
            .parse()
            .with_context(|| format!("failed to parse {:?}: '{content}'", self.file))
    }
}

/// Turns a wrapping hardware counter into a monotonic total.
#[derive(Debug)]
struct EnergyCounter {
    max_value: u64,
    previous: Option<u64>,
    total: u64,
}

impl EnergyCounter {
    fn with_max_value(max_value: u64) -> Self {
        Self {
            max_value,
            previous: None,
            total: 0,
        }
    }

    /// Returns the new total, and whether the counter has overflowed since the last update.
    fn update(&mut self, value: u64) -> (u64, bool) {
        let (diff, overflowed) = match self.previous {
            None => (value, false),
            Some(prev) if value < prev => (self.max_value - prev + value + 1, true),
            Some(prev) => (value - prev, false),
        };
        self.previous = Some(value);
        self.total = self.total.saturating_add(diff);
        (self.total, overflowed)
    }
}
