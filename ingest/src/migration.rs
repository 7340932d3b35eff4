use crate::experiment::MigrationExperiment;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to read migration log")]
    Io(#[from] io::Error),
    #[error("Line {line}: '{marker}' line has no valid time or value")]
    InvalidNumber { line: usize, marker: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// seconds since the start of the run
    pub time: f64,
    pub value: f64,
}

/// Time series of one vote-migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub experiment: MigrationExperiment,
    /// writes/s against the old base
    pub old: Vec<SeriesPoint>,
    /// writes/s against the new base
    pub new: Vec<SeriesPoint>,
    /// fraction of reads that hit in the past second
    pub hitf: Vec<SeriesPoint>,
    /// (start, end) of the migration in seconds, zero if not logged
    pub migration: (f64, f64),
}

#[derive(Debug, Clone, Copy)]
enum Line {
    Old,
    New,
    HitFraction,
    MigrationStart,
    MigrationEnd,
}

const MARKERS: [(&str, Line); 5] = [
    ("OLD", Line::Old),
    ("NEW", Line::New),
    ("HITF", Line::HitFraction),
    ("MIG START", Line::MigrationStart),
    ("MIG FINISHED", Line::MigrationEnd),
];

impl MigrationRun {
    pub fn from_path(path: &Path, experiment: MigrationExperiment) -> Result<Self, MigrationError> {
        Self::from_reader(BufReader::new(File::open(path)?), experiment)
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        experiment: MigrationExperiment,
    ) -> Result<Self, MigrationError> {
        let mut run = Self {
            experiment,
            old: Vec::new(),
            new: Vec::new(),
            hitf: Vec::new(),
            migration: (0.0, 0.0),
        };

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let Some(&(marker, kind)) = MARKERS.iter().find(|(marker, _)| line.contains(marker))
            else {
                continue;
            };
            let invalid = || MigrationError::InvalidNumber {
                line: number + 1,
                marker,
            };

            let mut fields = line.split_whitespace();
            let time = fields
                .next()
                .and_then(|field| field.parse::<f64>().ok())
                .ok_or_else(invalid)?
                / NANOS_PER_SEC;

            match kind {
                Line::MigrationStart => run.migration.0 = time,
                Line::MigrationEnd => run.migration.1 = time,
                Line::Old | Line::New | Line::HitFraction => {
                    let value = fields
                        .last()
                        .and_then(|field| field.parse::<f64>().ok())
                        .ok_or_else(invalid)?;
                    let point = SeriesPoint { time, value };

                    match kind {
                        Line::Old => run.old.push(point),
                        Line::New => run.new.push(point),
                        _ => run.hitf.push(point),
                    }
                }
            }
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Distribution;

    fn experiment() -> MigrationExperiment {
        MigrationExperiment {
            partial: true,
            reuse: false,
            articles: 2_000_000,
            distribution: Distribution::Skewed,
            distribution_tag: "zipf1.08".to_string(),
        }
    }

    #[test]
    fn series_and_window() {
        let log = "\
1000000000 OLD: 250.5
1500000000 HITF: 0.75
2000000000 MIG START
2000000000 NEW: 100
3000000000 OLD: 10
4500000000 MIG FINISHED
populating articles
";
        let run = MigrationRun::from_reader(log.as_bytes(), experiment()).unwrap();

        assert_eq!(
            run.old,
            vec![
                SeriesPoint { time: 1.0, value: 250.5 },
                SeriesPoint { time: 3.0, value: 10.0 },
            ]
        );
        assert_eq!(run.new, vec![SeriesPoint { time: 2.0, value: 100.0 }]);
        assert_eq!(run.hitf, vec![SeriesPoint { time: 1.5, value: 0.75 }]);
        assert_eq!(run.migration, (2.0, 4.5));
    }

    #[test]
    fn window_defaults_to_zero() {
        let run = MigrationRun::from_reader("1000000000 OLD: 1\n".as_bytes(), experiment()).unwrap();

        assert_eq!(run.migration, (0.0, 0.0));
    }

    #[test]
    fn unparsable_time_is_an_error() {
        let result = MigrationRun::from_reader("soon NEW: 1\n".as_bytes(), experiment());

        assert!(matches!(
            result,
            Err(MigrationError::InvalidNumber { line: 1, marker: "NEW" })
        ));
    }
}
