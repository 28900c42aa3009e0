/*!
Delta encoding for cumulative metrics.

New Relic expects counts and summaries to describe the change over an interval, but `emit` sources usually report running totals. The [`DeltaTracker`] remembers the last raw value it saw for each series and turns each new cumulative sample into the difference since then.

A series is identified by its name and its set of tags. Tags are kept in a sorted map, so the order they were attached in doesn't matter.

Counter resets aren't detected. If a source restarts from zero then the next delta will be negative and is reported as-is.
*/

use std::collections::{BTreeMap, HashMap};

use crate::data::AttributeValue;

/**
The tags attached to a metric sample.
*/
pub(crate) type Tags = BTreeMap<String, AttributeValue>;

/**
A single metric sample, already resolved to one of the shapes New Relic understands.
*/
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetricSnapshot {
    pub name: String,
    pub tags: Tags,
    pub value: MetricValue,
    pub temporality: Temporality,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum MetricValue {
    Gauge(f64),
    Counter(f64),
    Summary {
        count: f64,
        sum: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Temporality {
    /**
    The value is a running total since some fixed point in the past.
    */
    Cumulative,
    /**
    The value already covers just the last `interval_ms` milliseconds.
    */
    Delta { interval_ms: u64 },
}

/**
A metric ready to be encoded into a request.
*/
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EmissionRecord {
    pub name: String,
    pub tags: Tags,
    pub value: MetricValue,
    pub timestamp_ms: u64,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricIdentity {
    name: String,
    tags: Tags,
}

impl MetricIdentity {
    fn of(snapshot: &MetricSnapshot) -> Self {
        MetricIdentity {
            name: snapshot.name.clone(),
            tags: snapshot.tags.clone(),
        }
    }
}

struct Observed<T> {
    value: T,
    timestamp_ms: u64,
}

/**
The last raw value observed for each cumulative series.

Counters and summaries are tracked separately, so a counter and a summary with the same name and tags don't interfere with each other.
*/
#[derive(Default)]
pub(crate) struct DeltaTracker {
    counters: HashMap<MetricIdentity, Observed<f64>>,
    summaries: HashMap<MetricIdentity, Observed<(f64, f64)>>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        DeltaTracker::default()
    }

    /**
    Convert a batch of raw samples into records, delta encoding any cumulative counters and summaries.

    Snapshots are processed in order, so the same series may appear more than once in a batch.
    */
    pub fn process(
        &mut self,
        snapshots: impl IntoIterator<Item = MetricSnapshot>,
    ) -> Vec<EmissionRecord> {
        snapshots
            .into_iter()
            .map(|snapshot| self.process_one(snapshot))
            .collect()
    }

    fn process_one(&mut self, snapshot: MetricSnapshot) -> EmissionRecord {
        let (value, interval_ms) = match (snapshot.value, snapshot.temporality) {
            (MetricValue::Gauge(value), _) => (MetricValue::Gauge(value), None),
            (value, Temporality::Delta { interval_ms }) => (value, Some(interval_ms)),
            (MetricValue::Counter(current), Temporality::Cumulative) => {
                let identity = MetricIdentity::of(&snapshot);

                let last = self.counters.insert(
                    identity,
                    Observed {
                        value: current,
                        timestamp_ms: snapshot.timestamp_ms,
                    },
                );

                let (prior, interval_ms) = last
                    .map(|last| {
                        (
                            last.value,
                            interval_since(last.timestamp_ms, snapshot.timestamp_ms),
                        )
                    })
                    .unwrap_or((0.0, None));

                (MetricValue::Counter(current - prior), interval_ms)
            }
            (
                MetricValue::Summary {
                    count,
                    sum,
                    min,
                    max,
                },
                Temporality::Cumulative,
            ) => {
                let identity = MetricIdentity::of(&snapshot);

                let last = self.summaries.insert(
                    identity,
                    Observed {
                        value: (count, sum),
                        timestamp_ms: snapshot.timestamp_ms,
                    },
                );

                let ((prior_count, prior_sum), interval_ms) = last
                    .map(|last| {
                        (
                            last.value,
                            interval_since(last.timestamp_ms, snapshot.timestamp_ms),
                        )
                    })
                    .unwrap_or(((0.0, 0.0), None));

                (
                    MetricValue::Summary {
                        count: count - prior_count,
                        sum: sum - prior_sum,
                        min,
                        max,
                    },
                    interval_ms,
                )
            }
        };

        EmissionRecord {
            name: snapshot.name,
            tags: snapshot.tags,
            value,
            timestamp_ms: snapshot.timestamp_ms,
            interval_ms,
        }
    }

    /**
    The number of distinct cumulative series being tracked.
    */
    pub fn tracked(&self) -> usize {
        self.counters.len() + self.summaries.len()
    }
}

// Samples taken within the same millisecond don't carry a usable interval
fn interval_since(last_ms: u64, now_ms: u64) -> Option<u64> {
    now_ms.checked_sub(last_ms).filter(|interval| *interval > 0)
}
