//! In-process decoder for HdrHistogram interval logs written by the load generators.
//!
//! Every log holds, per operation and in the family's fixed operation order, a
//! sequence of logarithmically spaced intervals: `[0, 1)`, `[1, 2)`, `[2, 4)`, ...
//! seconds after the start of the run, each with one `processing` and one `sojourn`
//! histogram. Histograms of all files handed to one [`NativeDecoder::decode`] call
//! are added up per (operation, bucket, metric) before any statistic is taken.

use super::{DecodeRequest, DecodedRow, DecoderError, HistogramMode};
use base64::{engine::general_purpose::STANDARD, Engine};
use hdrhistogram::{
    serialization::{
        interval_log::{IntervalLogIterator, LogEntry},
        Deserializer,
    },
    Histogram,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    time::Duration,
};
use tracing::debug;

const LOWEST_DISCERNIBLE: u64 = 1;
/// one minute in µs
const HIGHEST_TRACKABLE: u64 = 60_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// quantile iteration resolution of the percentile table
const TICKS_PER_HALF_DISTANCE: u32 = 4;

/// name of the synthetic operation that merges all others
pub const ALL_OPERATIONS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Metric {
    Processing,
    Sojourn,
}

impl Metric {
    const ALL: [Metric; 2] = [Metric::Processing, Metric::Sojourn];

    fn name(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Sojourn => "sojourn",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "processing" => Some(Self::Processing),
            "sojourn" => Some(Self::Sojourn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    processing: Option<Histogram<u64>>,
    sojourn: Option<Histogram<u64>>,
}

impl Bucket {
    fn slot(&mut self, metric: Metric) -> &mut Option<Histogram<u64>> {
        match metric {
            Metric::Processing => &mut self.processing,
            Metric::Sojourn => &mut self.sojourn,
        }
    }

    fn get(&self, metric: Metric) -> Option<&Histogram<u64>> {
        match metric {
            Metric::Processing => self.processing.as_ref(),
            Metric::Sojourn => self.sojourn.as_ref(),
        }
    }

    /// counts are added, never replaced
    fn add(&mut self, metric: Metric, histogram: &Histogram<u64>) -> Result<(), String> {
        let slot = self.slot(metric);
        if slot.is_none() {
            *slot = Some(empty_histogram()?);
        }

        match slot.as_mut() {
            Some(existing) => existing
                .add(histogram)
                .map_err(|error| format!("failed to add histograms: {error:?}")),
            None => Ok(()),
        }
    }

    fn merge(&mut self, other: &Bucket) -> Result<(), String> {
        for metric in Metric::ALL {
            if let Some(histogram) = other.get(metric) {
                self.add(metric, histogram)?;
            }
        }

        Ok(())
    }
}

/// Log-spaced histograms of one operation
#[derive(Debug, Clone, Default)]
struct Timeline {
    buckets: Vec<Bucket>,
    last_end: Duration,
}

impl Timeline {
    fn add(&mut self, index: usize, metric: Metric, histogram: &Histogram<u64>) -> Result<(), String> {
        if index >= self.buckets.len() {
            self.buckets.resize_with(index + 1, Bucket::default);
        }

        self.buckets[index].add(metric, histogram)
    }

    fn merge(&mut self, other: &Timeline) -> Result<(), String> {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize_with(other.buckets.len(), Bucket::default);
        }
        for (bucket, other_bucket) in self.buckets.iter_mut().zip(&other.buckets) {
            bucket.merge(other_bucket)?;
        }
        self.last_end = self.last_end.max(other.last_end);

        Ok(())
    }

    /// all buckets added into a single one
    fn collapse(&self) -> Result<Bucket, String> {
        let mut collapsed = Bucket::default();
        for bucket in &self.buckets {
            collapsed.merge(bucket)?;
        }

        Ok(collapsed)
    }
}

fn empty_histogram() -> Result<Histogram<u64>, String> {
    let mut histogram =
        Histogram::new_with_bounds(LOWEST_DISCERNIBLE, HIGHEST_TRACKABLE, SIGNIFICANT_FIGURES)
            .map_err(|error| format!("failed to create histogram: {error:?}"))?;
    histogram.auto(true);

    Ok(histogram)
}

/// bucket `i` covers `[(2^i) >> 1, 2^i)` seconds
fn bucket_index(start: Duration) -> usize {
    match start.as_secs().checked_ilog2() {
        Some(log) => log as usize + 1,
        None => 0,
    }
}

fn bucket_end(index: usize) -> Duration {
    Duration::from_secs(1u64.checked_shl(index as u32).unwrap_or(u64::MAX))
}

/// values are recorded in µs, reported in ms
fn millis(value: f64) -> f64 {
    value / 1000.0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDecoder;

impl NativeDecoder {
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn decode(&self, request: &DecodeRequest) -> Result<Vec<DecodedRow>, DecoderError> {
        let operations = request.family.operations();
        let mut timelines = BTreeMap::<String, Timeline>::new();

        for path in request.paths {
            read_log(path, operations, &mut timelines).map_err(|reason| {
                DecoderError::Histogram {
                    path: path.clone(),
                    reason,
                }
            })?;
        }

        let mut all = Timeline::default();
        for timeline in timelines.values() {
            all.merge(timeline)
                .map_err(|reason| DecoderError::Histogram {
                    path: request.paths.first().cloned().unwrap_or_default(),
                    reason,
                })?;
        }
        if !timelines.is_empty() {
            timelines.insert(ALL_OPERATIONS.to_string(), all);
        }

        match request.mode {
            HistogramMode::Timeline => Ok(timeline_rows(&timelines)),
            HistogramMode::Percentiles => {
                percentile_rows(&timelines).map_err(|reason| DecoderError::Histogram {
                    path: request.paths.first().cloned().unwrap_or_default(),
                    reason,
                })
            }
        }
    }
}

/// add the histograms of one interval log into `timelines`
fn read_log(
    path: &Path,
    operations: &[&str],
    timelines: &mut BTreeMap<String, Timeline>,
) -> Result<(), String> {
    let bytes = fs::read(path).map_err(|error| format!("failed to read histogram log: {error}"))?;
    let mut deserializer = Deserializer::new();
    let mut remaining = operations.iter();

    let mut operation: Option<&str> = None;
    let mut seen = BTreeSet::<(usize, Metric)>::new();
    let mut seen_non_zero = false;

    for entry in IntervalLogIterator::new(&bytes) {
        let interval = match entry.map_err(|error| format!("malformed interval log: {error:?}"))? {
            LogEntry::Interval(interval) => interval,
            _ => continue,
        };

        let start = interval.start_timestamp();
        let index = bucket_index(start);
        let metric = interval
            .tag()
            .and_then(|tag| Metric::from_tag(tag.as_str()))
            .ok_or_else(|| "histogram without a processing/sojourn tag".to_string())?;

        // a histogram starting at zero after later buckets (or a second one for the
        // same bucket) belongs to the next operation
        let next_operation = operation.is_none()
            || (start.is_zero() && (seen_non_zero || seen.contains(&(index, metric))));
        if next_operation {
            operation = Some(
                *remaining
                    .next()
                    .ok_or_else(|| "histogram file had trailing histograms".to_string())?,
            );
            seen.clear();
            seen_non_zero = false;
        }
        if !start.is_zero() {
            seen_non_zero = true;
        }
        seen.insert((index, metric));

        let encoded = STANDARD
            .decode(interval.encoded_histogram())
            .map_err(|error| format!("invalid base64 histogram: {error}"))?;
        let histogram: Histogram<u64> = deserializer
            .deserialize(&mut encoded.as_slice())
            .map_err(|error| format!("failed to deserialize histogram: {error:?}"))?;

        let Some(name) = operation else {
            continue;
        };
        let timeline = timelines.entry(name.to_string()).or_default();
        timeline.last_end = timeline.last_end.max(start + interval.duration());
        timeline.add(index, metric, &histogram)?;
    }

    Ok(())
}

fn timeline_rows(timelines: &BTreeMap<String, Timeline>) -> Vec<DecodedRow> {
    let mut rows = Vec::new();

    for (operation, timeline) in timelines {
        for (index, bucket) in timeline.buckets.iter().enumerate() {
            let until = bucket_end(index).min(timeline.last_end).as_secs();

            for metric in Metric::ALL {
                let Some(histogram) = bucket.get(metric).filter(|h| h.max() != 0) else {
                    debug!(operation = operation.as_str(), metric = metric.name(), until, "Skipping empty histogram");
                    continue;
                };

                let stats = [
                    ("mean", millis(histogram.mean())),
                    ("median", millis(histogram.value_at_quantile(0.5) as f64)),
                    ("p25", millis(histogram.value_at_quantile(0.25) as f64)),
                    ("p90", millis(histogram.value_at_quantile(0.90) as f64)),
                    ("p95", millis(histogram.value_at_quantile(0.95) as f64)),
                    ("p99", millis(histogram.value_at_quantile(0.99) as f64)),
                    ("max", millis(histogram.max() as f64)),
                ];

                rows.extend(stats.into_iter().map(|(stat, value)| DecodedRow {
                    operation: operation.clone(),
                    metric: metric.name().to_string(),
                    until,
                    stat: stat.to_string(),
                    value,
                }));
            }
        }
    }

    rows
}

fn percentile_rows(timelines: &BTreeMap<String, Timeline>) -> Result<Vec<DecodedRow>, String> {
    let mut rows = Vec::new();

    for (operation, timeline) in timelines {
        let collapsed = timeline.collapse()?;
        let until = timeline.last_end.as_secs();

        for metric in Metric::ALL {
            let Some(histogram) = collapsed.get(metric).filter(|h| h.max() != 0) else {
                debug!(operation = operation.as_str(), metric = metric.name(), "Skipping empty histogram");
                continue;
            };

            rows.extend(
                histogram
                    .iter_quantiles(TICKS_PER_HALF_DISTANCE)
                    .map(|value| DecodedRow {
                        operation: operation.clone(),
                        metric: metric.name().to_string(),
                        until,
                        stat: value.quantile_iterated_to().to_string(),
                        value: millis(value.value_iterated_to() as f64),
                    }),
            );
        }
    }

    Ok(rows)
}
