pub mod exec;
pub mod native;

#[cfg(test)]
mod exec_test;

use crate::{
    config::{ConfigErrors, DecoderConfig},
    experiment::Family,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Failed to spawn decoder")]
    SpawnDecoder(#[source] io::Error),
    #[error("Failed to wait for the decoder process")]
    ChildError(#[from] io::Error),
    #[error("Decoder timeout after {0:?}")]
    ChildTimeout(Duration),
    #[error("Decoder exited with {status}: {stderr}")]
    ChildStatus { status: String, stderr: String },
    #[error("Failed to parse decoder output")]
    Output(#[from] csv::Error),
    #[error("Decoder output has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("Decoder output has an invalid {column} value '{value}'")]
    InvalidValue { column: String, value: String },
    #[error("Failed to decode histogram log {path:?}: {reason}")]
    Histogram { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("Failed to list histogram side-cars")]
    Listing(#[source] io::Error),
    #[error("Histogram decoder failed")]
    Decoder(#[from] DecoderError),
}

/// Whether a run's histograms are reported per time bucket or as one percentile table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistogramMode {
    #[default]
    Timeline,
    Percentiles,
}

/// One value as emitted by a decoder (long format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRow {
    pub operation: String,
    pub metric: String,
    /// end of the time bucket in seconds since the start of the run
    pub until: u64,
    /// statistic name or percentile
    pub stat: String,
    pub value: f64,
}

/// All statistics of one (operation, time bucket, metric)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramRow {
    pub operation: String,
    pub until: u64,
    pub metric: String,
    pub stats: BTreeMap<String, f64>,
}

/// Histogram files of a single run that are decoded together
#[derive(Debug, Clone)]
pub struct DecodeRequest<'a> {
    pub family: Family,
    pub paths: &'a [PathBuf],
    pub mode: HistogramMode,
}

#[derive(Clone, Debug)]
pub enum Decoders {
    Exec(exec::ExecDecoder),
    Native(native::NativeDecoder),
}

impl Decoders {
    pub fn load(config: &DecoderConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "native" => Ok(Self::Native(native::NativeDecoder)),
            "exec" => exec::ExecDecoder::load(config).map(Self::Exec),
            _ => Err(ConfigErrors::UnsupportedDecoder(config.name.clone())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn decode(&self, request: &DecodeRequest) -> Result<Vec<DecodedRow>, DecoderError> {
        match self {
            Self::Exec(decoder) => decoder.decode(request),
            Self::Native(decoder) => decoder.decode(request),
        }
    }
}

/// select the histogram side-cars of the log at `log_path`
///
/// Lobsters writes a single `<basename>.hist`, vote and redis write one
/// `<basename>-client<N>.hist` per client. Zero-byte files are dropped.
pub fn histogram_files(log_path: &Path, family: Family) -> io::Result<Vec<PathBuf>> {
    let stem = log_path.with_extension("");

    if !family.per_client_histograms() {
        let mut path = stem.into_os_string();
        path.push(".hist");
        let path = PathBuf::from(path);

        return Ok(match fs::metadata(&path) {
            Ok(metadata) if metadata.len() > 0 => vec![path],
            Ok(_) => Vec::new(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(error) => return Err(error),
        });
    }

    let Some(prefix) = stem
        .file_name()
        .and_then(OsStr::to_str)
        .map(|name| format!("{name}-client"))
    else {
        return Ok(Vec::new());
    };
    let directory = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut clients = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let client = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(prefix.as_str()))
            .and_then(|rest| rest.strip_suffix(".hist"))
            .and_then(|client| client.parse::<u32>().ok());

        if let Some(client) = client {
            if entry.metadata()?.len() > 0 {
                clients.push((client, entry.path()));
            } else {
                debug!(path = ?entry.path(), "Dropping empty histogram side-car");
            }
        }
    }
    clients.sort();

    Ok(clients.into_iter().map(|(_, path)| path).collect())
}

/// pivot long decoder rows into one row per (operation, time bucket, metric)
pub fn reshape(rows: Vec<DecodedRow>) -> Vec<HistogramRow> {
    let mut grouped: BTreeMap<(String, u64, String), BTreeMap<String, f64>> = BTreeMap::new();

    for row in rows {
        let stats = grouped
            .entry((row.operation, row.until, row.metric))
            .or_default();

        match stats.entry(row.stat) {
            Entry::Vacant(slot) => {
                slot.insert(row.value);
            }
            Entry::Occupied(slot) => {
                warn!(stat = slot.key(), "Decoder reported a statistic twice, keeping the first");
            }
        }
    }

    grouped
        .into_iter()
        .map(|((operation, until, metric), stats)| HistogramRow {
            operation,
            until,
            metric,
            stats,
        })
        .collect()
}

/// decode all histograms of one run, `None` if the run has no histogram data
pub fn aggregate(
    decoder: &Decoders,
    family: Family,
    log_path: &Path,
    mode: HistogramMode,
) -> Result<Option<Vec<HistogramRow>>, HistogramError> {
    let paths = histogram_files(log_path, family).map_err(HistogramError::Listing)?;
    if paths.is_empty() {
        return Ok(None);
    }

    debug!(files = paths.len(), "Decoding histograms");
    // every client file goes into one decoder call so that counts are added up
    // before any percentile is taken
    let rows = decoder.decode(&DecodeRequest {
        family,
        paths: &paths,
        mode,
    })?;

    Ok(Some(reshape(rows)))
}

/// write decoder rows as the tab separated table external decoders emit
pub fn write_table<W: io::Write>(rows: &[DecodedRow], writer: W) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    writer.write_record(["op", "metric", "until", "stat", "value"])?;
    for row in rows {
        let until = row.until.to_string();
        let value = row.value.to_string();

        writer.write_record([
            row.operation.as_str(),
            row.metric.as_str(),
            until.as_str(),
            row.stat.as_str(),
            value.as_str(),
        ])?;
    }
    writer.flush()?;

    Ok(())
}

/// which operation list a histogram file was written with, judged by its name
pub fn family_of_histogram(path: &Path) -> Family {
    let lobsters = path
        .file_name()
        .and_then(OsStr::to_str)
        .map_or(false, |name| name.contains("lobsters"));

    if lobsters {
        Family::Lobsters
    } else {
        Family::Vote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(operation: &str, until: u64, metric: &str, stat: &str, value: f64) -> DecodedRow {
        DecodedRow {
            operation: operation.to_string(),
            metric: metric.to_string(),
            until,
            stat: stat.to_string(),
            value,
        }
    }

    #[test]
    fn reshape_pivots_statistics_into_columns() {
        let rows = reshape(vec![
            row("writes", 2, "sojourn", "mean", 1.0),
            row("reads", 1, "sojourn", "mean", 3.0),
            row("writes", 2, "sojourn", "p99", 2.0),
            row("writes", 2, "processing", "mean", 0.5),
            row("writes", 2, "sojourn", "mean", 9.0),
        ]);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].operation, "reads");
        assert_eq!(rows[1].metric, "processing");
        assert_eq!(rows[2].operation, "writes");
        assert_eq!(rows[2].metric, "sojourn");
        assert_eq!(rows[2].stats.get("mean"), Some(&1.0));
        assert_eq!(rows[2].stats.get("p99"), Some(&2.0));
    }

    #[test]
    fn selects_client_side_cars_in_client_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("full.5a.10t.20r.2c.0m.uniform.log");
        fs::write(&log, "# generated ops/s: 1\n").unwrap();
        fs::write(dir.path().join("full.5a.10t.20r.2c.0m.uniform-client10.hist"), "x").unwrap();
        fs::write(dir.path().join("full.5a.10t.20r.2c.0m.uniform-client2.hist"), "x").unwrap();
        fs::write(dir.path().join("full.5a.10t.20r.2c.0m.uniform-client3.hist"), "").unwrap();
        fs::write(dir.path().join("full.5a.10t.20r.20c.0m.uniform-client0.hist"), "x").unwrap();

        let files = histogram_files(&log, Family::Vote).unwrap();

        assert_eq!(
            files,
            vec![
                dir.path().join("full.5a.10t.20r.2c.0m.uniform-client2.hist"),
                dir.path().join("full.5a.10t.20r.2c.0m.uniform-client10.hist"),
            ]
        );
    }

    #[test]
    fn selects_single_side_car_for_lobsters() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("lobsters-direct-10-0m.log");

        assert!(histogram_files(&log, Family::Lobsters).unwrap().is_empty());

        fs::write(dir.path().join("lobsters-direct-100-0m.hist"), "x").unwrap();
        assert!(histogram_files(&log, Family::Lobsters).unwrap().is_empty());

        fs::write(dir.path().join("lobsters-direct-10-0m.hist"), "x").unwrap();
        assert_eq!(
            histogram_files(&log, Family::Lobsters).unwrap(),
            vec![dir.path().join("lobsters-direct-10-0m.hist")]
        );
    }

    #[test]
    fn run_without_histograms_has_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("redis.5a.10t.20r.1c.uniform.log");

        let result = aggregate(
            &Decoders::Native(native::NativeDecoder),
            Family::Redis,
            &log,
            HistogramMode::Timeline,
        )
        .unwrap();

        assert!(result.is_none());
    }

    #[test]
    fn written_table_has_contract_header() {
        let mut buffer = Vec::new();
        write_table(&[row("all", 4, "sojourn", "mean", 1.5)], &mut buffer).unwrap();

        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "op\tmetric\tuntil\tstat\tvalue\nall\tsojourn\t4\tmean\t1.5\n"
        );
    }
}
