use crate::{
    experiment::{ExperimentDescriptor, Family},
    histogram::HistogramRow,
    memory::MemoryBreakdown,
    summary::RunSummary,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Run of family {found} cannot be added to the {expected} table")]
    FamilyMismatch { expected: Family, found: Family },
    #[error("Family {0} has no indexed table")]
    NotTabular(Family),
    #[error("Index column '{column}' does not resolve for family {family}")]
    UnresolvedColumn { family: Family, column: &'static str },
    #[error("Histogram row has an empty {0}")]
    EmptyField(&'static str),
    #[error("Runs of family {0} require a memory breakdown")]
    MissingMemory(Family),
}

/// Typed value of a single index column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexValue {
    Int(u64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl IndexValue {
    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Float(_) => 1,
            Self::Bool(_) => 2,
            Self::Text(_) => 3,
        }
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<u64> for IndexValue {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for IndexValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Composite index of a record, in the family's column order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<IndexValue>);

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.iter().join(", "))
    }
}

impl ExperimentDescriptor {
    /// resolve a descriptor parameter by column name
    pub fn column(&self, name: &str) -> Option<IndexValue> {
        let value: IndexValue = match (self, name) {
            (Self::Vote(vote), "target") => vote.target.into(),
            (Self::Vote(vote), "partial") => vote.partial.into(),
            (Self::Vote(vote), "distribution") => vote.distribution.name().into(),
            (Self::Vote(vote), "write_every") => vote.write_every.into(),
            (Self::Vote(vote), "clients") => vote.clients.into(),
            (Self::Vote(vote), "articles") => vote.articles.into(),
            (Self::Vote(vote), "memlimit") => vote.memlimit.into(),

            (Self::Redis(redis), "target") => redis.target.into(),
            (Self::Redis(redis), "distribution") => redis.distribution.name().into(),
            (Self::Redis(redis), "write_every") => redis.write_every.into(),
            (Self::Redis(redis), "clients") => redis.clients.into(),
            (Self::Redis(redis), "articles") => redis.articles.into(),
            (Self::Redis(redis), "memlimit") => redis.memlimit?.into(),

            (Self::Lobsters(lobsters), "shards") => lobsters.shards.into(),
            (Self::Lobsters(lobsters), "scale") => lobsters.scale.into(),
            (Self::Lobsters(lobsters), "partial") => lobsters.partial.into(),
            (Self::Lobsters(lobsters), "durable") => lobsters.durable.into(),
            (Self::Lobsters(lobsters), "memlimit") => lobsters.memlimit.into(),

            (Self::Mysql(mysql), "scale") => mysql.scale.into(),

            (Self::Migration(migration), "partial") => migration.partial.into(),
            (Self::Migration(migration), "reuse") => migration.reuse.into(),
            (Self::Migration(migration), "articles") => migration.articles.into(),
            (Self::Migration(migration), "distribution") => migration.distribution.name().into(),

            _ => return None,
        };

        Some(value)
    }
}

/// One (operation, time bucket, metric) of a run, joined with the run's constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub experiment: ExperimentDescriptor,
    pub summary: RunSummary,
    pub memory: Option<MemoryBreakdown>,
    pub operation: String,
    pub until: u64,
    pub metric: String,
    pub stats: BTreeMap<String, f64>,
}

impl AggregatedRecord {
    pub fn family(&self) -> Family {
        self.experiment.family()
    }

    /// resolve an index column
    pub fn column(&self, name: &str) -> Option<IndexValue> {
        match name {
            "operation" => Some(self.operation.as_str().into()),
            "until" => Some(self.until.into()),
            "metric" => Some(self.metric.as_str().into()),
            _ => self.experiment.column(name),
        }
    }

    /// the family's composite index, columns that do not resolve are skipped
    pub fn index(&self) -> IndexKey {
        IndexKey(
            self.family()
                .index_columns()
                .iter()
                .filter_map(|column| self.column(column))
                .collect(),
        )
    }

    /// throughput the run achieved
    pub fn achieved(&self) -> f64 {
        match self.family() {
            Family::Lobsters | Family::Mysql => self.summary.generated,
            _ => self.summary.actual,
        }
    }

    /// throughput the run asked for
    pub fn requested(&self) -> f64 {
        match &self.experiment {
            ExperimentDescriptor::Vote(vote) => vote.target as f64,
            ExperimentDescriptor::Redis(redis) => redis.target as f64,
            ExperimentDescriptor::Lobsters(_)
            | ExperimentDescriptor::Mysql(_)
            | ExperimentDescriptor::Migration(_) => self.summary.target,
        }
    }

    pub fn stat(&self, name: &str) -> Option<f64> {
        self.stats.get(name).copied()
    }

    fn validate(&self) -> Result<(), DatasetError> {
        if self.operation.is_empty() {
            return Err(DatasetError::EmptyField("operation"));
        }
        if self.metric.is_empty() {
            return Err(DatasetError::EmptyField("metric"));
        }

        let family = self.family();
        match family
            .index_columns()
            .iter()
            .find(|column| self.column(column).is_none())
        {
            Some(column) => Err(DatasetError::UnresolvedColumn {
                family,
                column: *column,
            }),
            None => Ok(()),
        }
    }
}

/// join the parts of one run into records, sorted by the family's index
pub fn build_records(
    experiment: &ExperimentDescriptor,
    summary: &RunSummary,
    memory: Option<MemoryBreakdown>,
    histograms: Vec<HistogramRow>,
) -> Result<Vec<AggregatedRecord>, DatasetError> {
    let family = experiment.family();
    if !family.is_tabular() {
        return Err(DatasetError::NotTabular(family));
    }
    let memory = match (family.requires_memory(), memory) {
        (true, None) => return Err(DatasetError::MissingMemory(family)),
        (true, memory) => memory,
        (false, _) => None,
    };

    let mut records = histograms
        .into_iter()
        .map(|row| {
            let record = AggregatedRecord {
                experiment: experiment.clone(),
                summary: summary.clone(),
                memory,
                operation: row.operation,
                until: row.until,
                metric: row.metric,
                stats: row.stats,
            };
            record.validate()?;

            Ok(record)
        })
        .collect::<Result<Vec<_>, DatasetError>>()?;
    records.sort_by_cached_key(AggregatedRecord::index);

    Ok(records)
}

/// Indexed table of all runs of one family, rows are always sorted by index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub family: Family,
    rows: Vec<AggregatedRecord>,
    // index of rows[i], kept in step with rows
    keys: Vec<IndexKey>,
}

impl DataTable {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            rows: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// merge the records of one run into the table
    ///
    /// Rows with an already present index are kept as well. The merge is stable:
    /// rows with equal keys stay in insertion order, earlier runs first.
    pub fn append(&mut self, records: Vec<AggregatedRecord>) -> Result<(), DatasetError> {
        if !self.family.is_tabular() {
            return Err(DatasetError::NotTabular(self.family));
        }
        if let Some(record) = records.iter().find(|record| record.family() != self.family) {
            return Err(DatasetError::FamilyMismatch {
                expected: self.family,
                found: record.family(),
            });
        }
        for record in &records {
            record.validate()?;
        }

        // runs from build_records are already sorted, this only costs a pass
        let mut incoming = records
            .into_iter()
            .map(|record| (record.index(), record))
            .collect::<Vec<_>>();
        incoming.sort_by(|(a, _), (b, _)| a.cmp(b));

        let in_order = match (self.keys.last(), incoming.first()) {
            (Some(last), Some((first, _))) => last <= first,
            _ => true,
        };
        if in_order {
            let (keys, rows): (Vec<_>, Vec<_>) = incoming.into_iter().unzip();
            self.keys.extend(keys);
            self.rows.extend(rows);

            return Ok(());
        }

        let stored = std::mem::take(&mut self.keys)
            .into_iter()
            .zip(std::mem::take(&mut self.rows));
        let (keys, rows): (Vec<_>, Vec<_>) = stored
            .merge_by(incoming, |(left, _), (right, _)| left <= right)
            .unzip();
        self.keys = keys;
        self.rows = rows;

        Ok(())
    }

    /// all rows carrying `key`
    pub fn get(&self, key: &IndexKey) -> &[AggregatedRecord] {
        let start = self.keys.partition_point(|row| row < key);
        let end = start + self.keys[start..].partition_point(|row| row == key);

        &self.rows[start..end]
    }

    pub fn rows(&self) -> &[AggregatedRecord] {
        &self.rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregatedRecord> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
