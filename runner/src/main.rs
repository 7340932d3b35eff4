mod report;

use benchlog_ingest::{
    config::IngestConfig,
    corpus::CorpusCache,
    histogram::{self, native::NativeDecoder, DecodeRequest, HistogramMode},
};
use clap::{Parser, Subcommand};
use std::{io, path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "benchlog",
    version,
    about = "Ingest benchmark logs into indexed per-family datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the corpus of a result directory, building it if no cache exists
    Ingest {
        /// YAML config, defaults apply if omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Corpus blob, overrides `cache` of the config
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Ignore and overwrite an existing corpus blob
        #[arg(long)]
        rebuild: bool,

        /// Raw log directory, overrides `input` of the config
        dir: Option<PathBuf>,
    },

    /// Decode histogram logs and print them as a tab separated table
    ExtractHist {
        /// One row per time bucket instead of a single percentile table
        #[arg(long)]
        timeline: bool,

        /// Histogram logs of a single run
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            config,
            cache,
            rebuild,
            dir,
        } => ingest(config, cache, rebuild, dir),
        Commands::ExtractHist { timeline, files } => extract_hist(timeline, files),
    }
}

fn ingest(config: Option<PathBuf>, cache: Option<PathBuf>, rebuild: bool, dir: Option<PathBuf>) {
    let mut config = match config {
        Some(path) => match IngestConfig::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {}: {e}", path.to_string_lossy());
                exit(1);
            }
        },
        None => IngestConfig::default(),
    };

    if let Some(dir) = dir {
        config.input = dir;
    }
    if cache.is_some() {
        config.cache = cache;
    }

    if config.preflight_checks() {
        error!("Config contains errors, aborting");
        exit(1);
    }

    let corpus_cache = match CorpusCache::from_config(&config) {
        Ok(corpus_cache) => corpus_cache,
        Err(e) => {
            error!("Failed to set up corpus cache: {e}");
            exit(1);
        }
    };

    let built = if rebuild {
        info!("Rebuilding corpus, ignoring {}", corpus_cache.cache_path().to_string_lossy());
        corpus_cache
            .rebuild()
            .map(|(corpus, report)| (corpus, Some(report)))
    } else {
        corpus_cache.load_or_build()
    };

    match built {
        Ok((corpus, scan)) => {
            report::print_corpus(&corpus);
            if let Some(scan) = scan {
                report::print_scan(&scan);
            }
        }
        Err(e) => {
            error!("Failed to build corpus: {e}");
            exit(1);
        }
    }
}

fn extract_hist(timeline: bool, files: Vec<PathBuf>) {
    let Some(first) = files.first() else {
        error!("No histogram file given");
        exit(1);
    };

    let request = DecodeRequest {
        family: histogram::family_of_histogram(first),
        paths: &files,
        mode: if timeline {
            HistogramMode::Timeline
        } else {
            HistogramMode::Percentiles
        },
    };

    let rows = match NativeDecoder.decode(&request) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to decode histograms: {e}");
            exit(1);
        }
    };

    if let Err(e) = histogram::write_table(&rows, io::stdout().lock()) {
        error!("Failed to write table: {e}");
        exit(1);
    }
}
