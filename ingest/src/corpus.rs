use crate::{
    config::{ConfigErrors, IngestConfig},
    dataset::{build_records, AggregatedRecord, DataTable, DatasetError},
    experiment::{classify_path, Classification, ExperimentDescriptor, Family},
    histogram::{self, Decoders, HistogramError, HistogramMode},
    memory::{MemoryBreakdown, MemoryStatsError},
    migration::{MigrationError, MigrationRun},
    summary::{RunSummary, SummaryError},
};
use globset::GlobMatcher;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to inspect log file")]
    Io(#[from] io::Error),
    #[error("Failed to parse run summary")]
    Summary(#[from] SummaryError),
    #[error("Failed to extract memory statistics")]
    Memory(#[from] MemoryStatsError),
    #[error("Failed to aggregate histograms")]
    Histogram(#[from] HistogramError),
    #[error("Failed to build dataset rows")]
    Dataset(#[from] DatasetError),
    #[error("Failed to parse migration series")]
    Migration(#[from] MigrationError),
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Failed to list raw logs")]
    Walk(#[from] ignore::Error),
    #[error("Failed to access corpus cache")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize corpus cache")]
    Serialization(#[from] bincode::Error),
    #[error("Invalid ingest configuration")]
    Config(#[from] ConfigErrors),
}

/// Why a log file did not contribute to the corpus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    Unrecognized,
    EmptyLog,
    NoClients,
    NoMemoryStats,
    NoHistograms,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unrecognized => "file name matches no benchmark family",
            Self::EmptyLog => "log file is empty",
            Self::NoClients => "no client reported generated load",
            Self::NoMemoryStats => "memory statistics are missing",
            Self::NoHistograms => "histograms are missing",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ingested { family: Family, rows: usize },
    Skipped(SkipReason),
}

/// Per-family content of the corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CorpusEntry {
    Table(DataTable),
    Migration(Vec<MigrationRun>),
}

impl CorpusEntry {
    fn empty(family: Family) -> Self {
        if family.is_tabular() {
            Self::Table(DataTable::new(family))
        } else {
            Self::Migration(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Table(table) => table.len(),
            Self::Migration(runs) => runs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All ingested runs of one raw log directory, keyed by family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    families: BTreeMap<Family, CorpusEntry>,
}

impl Default for Corpus {
    fn default() -> Self {
        Self {
            families: Family::ALL
                .into_iter()
                .map(|family| (family, CorpusEntry::empty(family)))
                .collect(),
        }
    }
}

impl Corpus {
    pub fn get(&self, family: Family) -> Option<&CorpusEntry> {
        self.families.get(&family)
    }

    pub fn table(&self, family: Family) -> Option<&DataTable> {
        match self.families.get(&family) {
            Some(CorpusEntry::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn migrations(&self) -> &[MigrationRun] {
        match self.families.get(&Family::Migration) {
            Some(CorpusEntry::Migration(runs)) => runs,
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Family, &CorpusEntry)> {
        self.families.iter().map(|(family, entry)| (*family, entry))
    }

    pub fn append_records(
        &mut self,
        family: Family,
        records: Vec<AggregatedRecord>,
    ) -> Result<(), DatasetError> {
        match self
            .families
            .entry(family)
            .or_insert_with(|| CorpusEntry::empty(family))
        {
            CorpusEntry::Table(table) => table.append(records),
            CorpusEntry::Migration(_) => Err(DatasetError::NotTabular(family)),
        }
    }

    pub fn push_migration(&mut self, run: MigrationRun) {
        if let CorpusEntry::Migration(runs) = self
            .families
            .entry(Family::Migration)
            .or_insert_with(|| CorpusEntry::empty(Family::Migration))
        {
            runs.push(run);
        }
    }

    /// persist as a single blob, replacing any existing file atomically
    pub fn save(&self, path: &Path) -> Result<(), CorpusError> {
        let mut temporary = path.as_os_str().to_owned();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        {
            let mut writer = BufWriter::new(File::create(&temporary)?);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&temporary, path)?;

        debug!(path = ?path, "Persisted corpus");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let reader = BufReader::new(File::open(path)?);

        Ok(bincode::deserialize_from(reader)?)
    }
}

/// Outcome of scanning one raw log directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub scanned: usize,
    pub ingested: BTreeMap<Family, usize>,
    pub skipped: BTreeMap<SkipReason, usize>,
    /// runs that failed hard, with the rendered error
    pub failed: Vec<(PathBuf, String)>,
}

impl ScanReport {
    fn record(&mut self, path: PathBuf, outcome: Result<RunOutcome, IngestError>) {
        self.scanned += 1;

        match outcome {
            Ok(RunOutcome::Ingested { family, .. }) => {
                *self.ingested.entry(family).or_default() += 1;
            }
            Ok(RunOutcome::Skipped(reason)) => {
                *self.skipped.entry(reason).or_default() += 1;
            }
            Err(e) => {
                let rendered = error_chain(&e);
                error!(path = ?path, "Failed to ingest run: {rendered}");
                self.failed.push((path, rendered));
            }
        }
    }

    pub fn ingested_total(&self) -> usize {
        self.ingested.values().sum()
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

/// render an error with all of its sources
fn error_chain(error: &dyn StdError) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }

    rendered
}

fn skip(path: &Path, reason: SkipReason) -> RunOutcome {
    info!(path = ?path, "Skipping run: {reason}");

    RunOutcome::Skipped(reason)
}

/// Ingest a single log file into `corpus`
///
/// Nothing is appended unless every part of the run could be extracted.
#[tracing::instrument(level = "debug", skip(corpus, decoder))]
pub fn ingest_run(
    corpus: &mut Corpus,
    path: &Path,
    decoder: &Decoders,
    mode: HistogramMode,
) -> Result<RunOutcome, IngestError> {
    let descriptor = match classify_path(path)? {
        Classification::Recognized(descriptor) => descriptor,
        Classification::Unrecognized => return Ok(skip(path, SkipReason::Unrecognized)),
        Classification::Empty => return Ok(skip(path, SkipReason::EmptyLog)),
    };
    let family = descriptor.family();

    if let ExperimentDescriptor::Migration(experiment) = &descriptor {
        corpus.push_migration(MigrationRun::from_path(path, experiment.clone())?);

        return Ok(RunOutcome::Ingested { family, rows: 1 });
    }

    let summary = RunSummary::from_path(path)?;
    if summary.is_empty() {
        return Ok(skip(path, SkipReason::NoClients));
    }

    let memory = if family.requires_memory() {
        match MemoryBreakdown::load(path)? {
            Some(memory) => Some(memory),
            None => return Ok(skip(path, SkipReason::NoMemoryStats)),
        }
    } else {
        None
    };

    let histograms = match histogram::aggregate(decoder, family, path, mode)? {
        Some(rows) if !rows.is_empty() => rows,
        _ => return Ok(skip(path, SkipReason::NoHistograms)),
    };

    let records = build_records(&descriptor, &summary, memory, histograms)?;
    let rows = records.len();
    corpus.append_records(family, records)?;

    debug!(family = %family, rows, "Ingested run");
    Ok(RunOutcome::Ingested { family, rows })
}

/// list the files directly inside `dir` whose name matches `include`, sorted
pub fn collect_logs(dir: &Path, include: &GlobMatcher) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.is_dir() {
        return Err(CorpusError::NotADirectory(dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
    {
        let entry = entry?;
        if !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }

        match entry.path().file_name() {
            Some(name) if include.is_match(name) => paths.push(entry.into_path()),
            _ => {}
        }
    }
    paths.sort();

    Ok(paths)
}

/// Scan every log of `dir` once and build a fresh corpus
///
/// Failing runs are reported, they never abort the scan.
pub fn scan(
    dir: &Path,
    include: &GlobMatcher,
    decoder: &Decoders,
    mode: HistogramMode,
) -> Result<(Corpus, ScanReport), CorpusError> {
    let paths = collect_logs(dir, include)?;
    info!("Scanning {} log files in {}", paths.len(), dir.to_string_lossy());

    let mut corpus = Corpus::default();
    let mut report = ScanReport::default();
    for path in paths {
        let outcome = ingest_run(&mut corpus, &path, decoder, mode);
        report.record(path, outcome);
    }

    info!(
        ingested = report.ingested_total(),
        skipped = report.skipped_total(),
        failed = report.failed.len(),
        "Finished scan"
    );

    Ok((corpus, report))
}

/// Load-or-build access to the corpus of one raw log directory
///
/// The blob is never checked against the raw logs, use [`CorpusCache::rebuild`]
/// or [`CorpusCache::invalidate`] after they changed.
#[derive(Debug, Clone)]
pub struct CorpusCache {
    input: PathBuf,
    cache: PathBuf,
    include: GlobMatcher,
    decoder: Decoders,
    mode: HistogramMode,
}

impl CorpusCache {
    pub fn new(
        input: PathBuf,
        cache: PathBuf,
        include: GlobMatcher,
        decoder: Decoders,
        mode: HistogramMode,
    ) -> Self {
        Self {
            input,
            cache,
            include,
            decoder,
            mode,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self, CorpusError> {
        Ok(Self::new(
            config.input.clone(),
            config.cache_path(),
            config.compile_include()?,
            Decoders::load(&config.decoder)?,
            config.histogram,
        ))
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache
    }

    /// reload the blob if present, otherwise scan and persist
    ///
    /// The report is only available if the corpus was built.
    pub fn load_or_build(&self) -> Result<(Corpus, Option<ScanReport>), CorpusError> {
        if self.cache.is_file() {
            info!("Loading cached corpus from {}", self.cache.to_string_lossy());
            return Ok((Corpus::load(&self.cache)?, None));
        }

        let (corpus, report) = self.rebuild()?;
        Ok((corpus, Some(report)))
    }

    /// scan the raw logs and overwrite any existing blob
    pub fn rebuild(&self) -> Result<(Corpus, ScanReport), CorpusError> {
        let (corpus, report) = scan(&self.input, &self.include, &self.decoder, self.mode)?;
        corpus.save(&self.cache)?;
        info!("Saved corpus to {}", self.cache.to_string_lossy());

        Ok((corpus, report))
    }

    /// delete the blob, returns whether there was one
    pub fn invalidate(&self) -> Result<bool, CorpusError> {
        match fs::remove_file(&self.cache) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
