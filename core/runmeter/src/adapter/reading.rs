//! Validation and sequencing of the readings received from an adapter.

use rustc_hash::FxHashMap;

use super::protocol::WireReading;
use crate::measurement::{Measure, PowerKind, PowerReading, Stamp, Timestamp};

/// Maximum length of a source identifier, in bytes.
pub const MAX_SOURCE_ID_LEN: usize = 256;

/// Something unusual about a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Same stamp as the previous reading of the source. The reading is dropped.
    Duplicate,
    /// Older stamp than the previous reading of the source.
    Reordered,
    /// Some sequence numbers were skipped.
    Missing(u64),
    /// The reading is invalid. It is dropped.
    Malformed(String),
}

/// Result of [`ReadingValidator::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct Checked {
    /// The reading to forward to the merger, if any.
    pub reading: Option<PowerReading>,
    pub anomaly: Option<Anomaly>,
}

impl Checked {
    fn forward(reading: PowerReading) -> Self {
        Self {
            reading: Some(reading),
            anomaly: None,
        }
    }

    fn drop(anomaly: Anomaly) -> Self {
        Self {
            reading: None,
            anomaly: Some(anomaly),
        }
    }
}

/// Checks that a reading is well-formed, and returns its measure.
pub fn validate(wire: &WireReading) -> Result<Measure, String> {
    if wire.source_id.is_empty() {
        return Err(String::from("empty source id"));
    }
    if wire.source_id.len() > MAX_SOURCE_ID_LEN {
        return Err(format!("source id longer than {MAX_SOURCE_ID_LEN} bytes"));
    }
    if !wire.value.is_finite() {
        return Err(format!("non-finite value {}", wire.value));
    }
    if wire.value < 0.0 {
        return Err(format!("negative value {}", wire.value));
    }
    Ok(match wire.kind {
        PowerKind::Watts => Measure::Watts(wire.value),
        PowerKind::Joules => Measure::Joules(wire.value),
    })
}

struct SourceState {
    kind: PowerKind,
    last: Stamp,
}

/// Validates the readings of one adapter connection and tracks the order of each source.
#[derive(Default)]
pub struct ReadingValidator {
    sources: FxHashMap<String, SourceState>,
}

impl ReadingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks a reading that has been received at time `received`.
    ///
    /// Readings stamped with a sequence number are timed on receipt.
    pub fn check(&mut self, wire: WireReading, received: Timestamp) -> Checked {
        let measure = match validate(&wire) {
            Ok(m) => m,
            Err(reason) => return Checked::drop(Anomaly::Malformed(reason)),
        };
        let time = match wire.stamp {
            Stamp::Sequence(_) => received,
            Stamp::Timestamp(micros) => Timestamp::from_unix_micros(micros),
        };
        let reading = PowerReading {
            source_id: wire.source_id,
            stamp: wire.stamp,
            time,
            measure,
        };

        let Some(state) = self.sources.get_mut(&reading.source_id) else {
            self.sources.insert(
                reading.source_id.clone(),
                SourceState {
                    kind: wire.kind,
                    last: wire.stamp,
                },
            );
            return Checked::forward(reading);
        };

        if state.kind != wire.kind {
            return Checked::drop(Anomaly::Malformed(format!(
                "source {} changed its kind from {} to {}",
                reading.source_id, state.kind, wire.kind
            )));
        }

        match (state.last, wire.stamp) {
            (Stamp::Sequence(last), Stamp::Sequence(seq)) => {
                if seq == last {
                    Checked::drop(Anomaly::Duplicate)
                } else if seq < last {
                    Checked::drop(Anomaly::Reordered)
                } else {
                    state.last = wire.stamp;
                    let anomaly = (seq > last + 1).then(|| Anomaly::Missing(seq - last - 1));
                    Checked {
                        reading: Some(reading),
                        anomaly,
                    }
                }
            }
            (Stamp::Timestamp(last), Stamp::Timestamp(t)) => {
                if t == last {
                    Checked::drop(Anomaly::Duplicate)
                } else if t < last {
                    // the merger decides whether it is too late
                    Checked {
                        reading: Some(reading),
                        anomaly: Some(Anomaly::Reordered),
                    }
                } else {
                    state.last = wire.stamp;
                    Checked::forward(reading)
                }
            }
            _ => Checked::drop(Anomaly::Malformed(format!(
                "source {} mixes sequence numbers and timestamps",
                reading.source_id
            ))),
        }
    }
}
