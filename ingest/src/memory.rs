use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// description the server gives to base table nodes
const BASE_NODE: &str = "B";
/// description the server gives to reader nodes
const READER_NODE: &str = "reader node";

#[derive(Debug, Error)]
pub enum MemoryStatsError {
    #[error("Failed to read statistics side-car")]
    Io(#[from] io::Error),
    #[error("Failed to deserialize statistics side-car")]
    Json(#[from] serde_json::Error),
}

/// Materialization state of an operator, decoded once at parse time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Materialization {
    Not,
    Full,
    Partial(serde_json::Value),
}

impl Materialization {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub desc: String,
    pub mem_size: u64,
    pub materialized: Materialization,
}

/// `[domain statistics, {node id: node statistics}]`, only the nodes are of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStats(pub serde_json::Value, pub BTreeMap<String, NodeStats>);

impl DomainStats {
    pub fn nodes(&self) -> &BTreeMap<String, NodeStats> {
        &self.1
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatisticsFile {
    Wrapped {
        domains: BTreeMap<String, DomainStats>,
    },
    Bare(BTreeMap<String, DomainStats>),
}

impl StatisticsFile {
    fn into_domains(self) -> BTreeMap<String, DomainStats> {
        match self {
            Self::Wrapped { domains } | Self::Bare(domains) => domains,
        }
    }
}

/// Memory used by the operator graph, split by node kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBreakdown {
    pub ndomains: u64,
    pub base_mem: u64,
    /// every non-base node
    pub other_mem: u64,
    /// subset of `other_mem` held by reader nodes
    pub reader_mem: u64,
    /// subset of `other_mem` held by nodes that are not partially materialized
    pub full_op_mem: u64,
}

impl MemoryBreakdown {
    pub fn from_domains(domains: &BTreeMap<String, DomainStats>) -> Self {
        let mut breakdown = Self {
            ndomains: domains.len() as u64,
            ..Self::default()
        };

        for node in domains.values().flat_map(|domain| domain.nodes().values()) {
            if node.desc == BASE_NODE {
                breakdown.base_mem += node.mem_size;
                continue;
            }

            breakdown.other_mem += node.mem_size;
            if !node.materialized.is_partial() {
                breakdown.full_op_mem += node.mem_size;
            }
            if node.desc == READER_NODE {
                breakdown.reader_mem += node.mem_size;
            }
        }

        breakdown
    }

    pub fn from_json(json: &str) -> Result<Self, MemoryStatsError> {
        let stats: StatisticsFile = serde_json::from_str(json)?;

        Ok(Self::from_domains(&stats.into_domains()))
    }

    /// load the side-car of `log_path`, `None` if it is missing or empty
    pub fn load(log_path: &Path) -> Result<Option<Self>, MemoryStatsError> {
        let path = statistics_path(log_path);

        match fs::metadata(&path) {
            Ok(metadata) if metadata.len() == 0 => {
                debug!(path = ?path, "Statistics side-car is empty");
                return Ok(None);
            }
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "Statistics side-car is missing");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }

        let stats: StatisticsFile = serde_json::from_reader(BufReader::new(File::open(&path)?))?;

        Ok(Some(Self::from_domains(&stats.into_domains())))
    }
}

/// `<basename>-statistics.json` next to the log file
pub fn statistics_path(log_path: &Path) -> PathBuf {
    let mut path = log_path.with_extension("").into_os_string();
    path.push("-statistics.json");

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_full_operator() {
        let json = r#"{"domains": {"0": [{}, {
            "n1": {"desc": "B", "mem_size": 100, "materialized": "Full"},
            "n2": {"desc": "π[0, 1]", "mem_size": 50, "materialized": "Full"}
        }]}}"#;

        assert_eq!(
            MemoryBreakdown::from_json(json).unwrap(),
            MemoryBreakdown {
                ndomains: 1,
                base_mem: 100,
                other_mem: 50,
                reader_mem: 0,
                full_op_mem: 50,
            }
        );
    }

    #[test]
    fn partial_reader_is_not_full_operator_memory() {
        let json = r#"{
            "0": [null, {
                "n1": {"desc": "B", "mem_size": 100, "materialized": "Not"},
                "n2": {"desc": "reader node", "mem_size": 30,
                       "materialized": {"Partial": {"beyond_materialization_frontier": false}}}
            }],
            "1": [null, {
                "n3": {"desc": "𝛴(2)", "mem_size": 20, "materialized": "Full"}
            }]
        }"#;
        let breakdown = MemoryBreakdown::from_json(json).unwrap();

        assert_eq!(breakdown.ndomains, 2);
        assert_eq!(breakdown.base_mem, 100);
        assert_eq!(breakdown.other_mem, 50);
        assert_eq!(breakdown.reader_mem, 30);
        assert_eq!(breakdown.full_op_mem, 20);
        assert!(breakdown.reader_mem <= breakdown.other_mem);
    }

    #[test]
    fn side_car_path() {
        assert_eq!(
            statistics_path(Path::new("/r/partial.5a.10t.20r.1c.0m.uniform.log")),
            PathBuf::from("/r/partial.5a.10t.20r.1c.0m.uniform-statistics.json")
        );
    }

    #[test]
    fn missing_or_empty_side_car_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("lobsters-direct-1-0m.log");

        assert_eq!(MemoryBreakdown::load(&log).unwrap(), None);

        fs::write(statistics_path(&log), "").unwrap();
        assert_eq!(MemoryBreakdown::load(&log).unwrap(), None);

        fs::write(statistics_path(&log), "{\"domains\": {}}").unwrap();
        assert_eq!(
            MemoryBreakdown::load(&log).unwrap(),
            Some(MemoryBreakdown::default())
        );
    }

    #[test]
    fn malformed_side_car_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("lobsters-direct-1-0m.log");
        fs::write(statistics_path(&log), "{ not json").unwrap();

        assert!(matches!(
            MemoryBreakdown::load(&log),
            Err(MemoryStatsError::Json(_))
        ));
    }
}
