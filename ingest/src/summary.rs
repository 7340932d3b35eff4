use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Failed to read run log")]
    Io(#[from] io::Error),
    #[error("Line {line}: '{marker}' is not followed by a number")]
    InvalidNumber { line: usize, marker: &'static str },
}

/// Summary lines the harness writes, all prefixed with `#`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Generated,
    Actual,
    Target,
    ServerLoad,
    ClientLoad,
    ServerMemory,
}

// checked in order, the first marker found in a line wins
const MARKERS: [(&str, Marker); 7] = [
    ("generated ops/s", Marker::Generated),
    ("actual ops/s", Marker::Actual),
    ("target ops/s", Marker::Target),
    ("server load", Marker::ServerLoad),
    ("client[0] load", Marker::ClientLoad),
    ("client load", Marker::ClientLoad),
    ("server memory", Marker::ServerMemory),
];

/// Scalar aggregates of a single run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// sum of `generated ops/s` over all clients
    pub generated: f64,
    /// sum of `actual ops/s`
    pub actual: f64,
    /// sum of `target ops/s`
    pub target: f64,
    pub sload1: f64,
    pub sload5: f64,
    pub cload1: f64,
    pub cload5: f64,
    /// resident memory of the server in bytes
    pub vmrss: f64,
    /// number of `generated ops/s` lines, one per client
    pub clients: u32,
}

impl RunSummary {
    pub fn from_path(path: &Path) -> Result<Self, SummaryError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, SummaryError> {
        let mut summary = Self::default();

        for (number, line) in reader.lines().enumerate() {
            summary.accumulate(&line?, number + 1)?;
        }

        Ok(summary)
    }

    /// fold one log line into the summary, non-comment lines are ignored
    pub fn accumulate(&mut self, line: &str, number: usize) -> Result<(), SummaryError> {
        if !line.starts_with('#') {
            return Ok(());
        }

        let Some(&(name, marker)) = MARKERS.iter().find(|(name, _)| line.contains(name)) else {
            return Ok(());
        };
        let invalid = || SummaryError::InvalidNumber { line: number, marker: name };

        match marker {
            Marker::Generated => {
                self.generated += trailing(line, 1).ok_or_else(invalid)?[0];
                self.clients += 1;
            }
            Marker::Actual => self.actual += trailing(line, 1).ok_or_else(invalid)?[0],
            Marker::Target => self.target += trailing(line, 1).ok_or_else(invalid)?[0],
            Marker::ServerLoad => {
                let load = trailing(line, 2).ok_or_else(invalid)?;
                self.sload1 += load[0];
                self.sload5 += load[1];
            }
            Marker::ClientLoad => {
                let load = trailing(line, 2).ok_or_else(invalid)?;
                self.cload1 += load[0];
                self.cload5 += load[1];
            }
            // reported in kB
            Marker::ServerMemory => self.vmrss += trailing(line, 1).ok_or_else(invalid)?[0] * 1024.0,
        }

        trace!(line = number, marker = name, "Accumulated summary line");

        Ok(())
    }

    /// add up the summaries of several client logs belonging to one run
    pub fn merge(&mut self, other: &RunSummary) {
        self.generated += other.generated;
        self.actual += other.actual;
        self.target += other.target;
        self.sload1 += other.sload1;
        self.sload5 += other.sload5;
        self.cload1 += other.cload1;
        self.cload5 += other.cload5;
        self.vmrss += other.vmrss;
        self.clients += other.clients;
    }

    /// a run without a single `generated ops/s` line never produced load
    pub fn is_empty(&self) -> bool {
        self.clients == 0
    }
}

/// parse the last `count` whitespace separated fields of `line` as numbers
fn trailing(line: &str, count: usize) -> Option<Vec<f64>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let start = fields.len().checked_sub(count)?;

    fields[start..]
        .iter()
        .map(|field| field.parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_client_lines() {
        let log = "\
# generated ops/s: 100
# actual ops/s: 98.5
# generated ops/s: 150
# actual ops/s: 149
# server load: 1.5 2.5
# client[0] load: 0.25 0.75
# server memory (kB): 2048
0 some raw line that is ignored
";
        let summary = RunSummary::from_reader(log.as_bytes()).unwrap();

        assert_eq!(summary.generated, 250.0);
        assert_eq!(summary.actual, 247.5);
        assert_eq!(summary.clients, 2);
        assert_eq!((summary.sload1, summary.sload5), (1.5, 2.5));
        assert_eq!((summary.cload1, summary.cload5), (0.25, 0.75));
        assert_eq!(summary.vmrss, 2048.0 * 1024.0);
    }

    #[test]
    fn merges_client_logs() {
        let mut first = RunSummary::from_reader("# generated ops/s: 100\n".as_bytes()).unwrap();
        let second = RunSummary::from_reader("# generated ops/s: 150\n".as_bytes()).unwrap();

        first.merge(&second);

        assert_eq!(first.generated, 250.0);
        assert_eq!(first.clients, 2);
        assert!(!first.is_empty());
    }

    #[test]
    fn lobsters_markers() {
        let log = "\
# target ops/s: 46.0
# generated ops/s: 45.5
# client load: 3 4
";
        let summary = RunSummary::from_reader(log.as_bytes()).unwrap();

        assert_eq!(summary.target, 46.0);
        assert_eq!(summary.generated, 45.5);
        assert_eq!((summary.cload1, summary.cload5), (3.0, 4.0));
    }

    #[test]
    fn uncommented_lines_do_not_count() {
        let summary =
            RunSummary::from_reader("generated ops/s: 100\n# nothing to see\n".as_bytes()).unwrap();

        assert!(summary.is_empty());
        assert_eq!(summary.generated, 0.0);
    }

    #[test]
    fn invalid_number_is_reported() {
        let error =
            RunSummary::from_reader("# ok\n# generated ops/s: lots\n".as_bytes()).unwrap_err();

        assert!(matches!(
            error,
            SummaryError::InvalidNumber {
                line: 2,
                marker: "generated ops/s"
            }
        ));
    }
}
