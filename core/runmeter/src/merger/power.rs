use std::time::Duration;

use crate::measurement::PowerKind;
use crate::record::PowerSample;

/// The readings of one power source in one bucket.
pub(super) struct SourceReadings {
    pub kind: PowerKind,
    /// (offset from the start of the run, value)
    pub values: Vec<(Duration, f64)>,
}

/// Energy of one source in one closed bucket.
pub(super) struct BucketEnergy {
    pub sample: PowerSample,
    pub counter_resets: u64,
}

impl SourceReadings {
    pub fn new(kind: PowerKind) -> Self {
        Self {
            kind,
            values: Vec::with_capacity(4),
        }
    }

    /// Removes the readings that are not before `end`, and returns how many were removed.
    pub fn truncate_at(&mut self, end: Duration) -> u64 {
        let before = self.values.len();
        self.values.retain(|(offset, _)| *offset < end);
        (before - self.values.len()) as u64
    }

    /// Computes the energy consumed during the bucket.
    ///
    /// For cumulative counters, `counter` is the last value of the counter in the previous
    /// buckets. It is updated with the last value of this bucket.
    /// Returns `None` if there is no reading.
    pub fn energy(mut self, duration: Duration, counter: &mut Option<f64>) -> Option<BucketEnergy> {
        // readings can arrive out of order
        self.values.sort_by(|a, b| a.0.cmp(&b.0));
        let n = self.values.len();
        let readings = u32::try_from(n).unwrap_or(u32::MAX);
        let (first_value, secs) = (self.values.first()?.1, duration.as_secs_f64());
        match self.kind {
            PowerKind::Watts => {
                let mean = self.values.iter().map(|(_, w)| w).sum::<f64>() / n as f64;
                Some(BucketEnergy {
                    sample: PowerSample {
                        kind: PowerKind::Watts,
                        readings,
                        energy: mean * secs,
                        average_power: mean,
                    },
                    counter_resets: 0,
                })
            }
            PowerKind::Joules => {
                let mut prev = counter.unwrap_or(first_value);
                let mut energy = 0.0;
                let mut resets = 0;
                for (_, value) in &self.values {
                    if *value >= prev {
                        energy += value - prev;
                    } else {
                        // the counter has been reset (or has wrapped around)
                        resets += 1;
                        energy += value;
                    }
                    prev = *value;
                }
                *counter = Some(prev);
                Some(BucketEnergy {
                    sample: PowerSample {
                        kind: PowerKind::Joules,
                        readings,
                        energy,
                        average_power: energy / secs,
                    },
                    counter_resets: resets,
                })
            }
        }
    }
}
