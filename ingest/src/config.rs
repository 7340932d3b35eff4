use crate::histogram::HistogramMode;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

/// name of the corpus blob written next to the raw logs
pub const DEFAULT_CACHE_NAME: &str = "parsed.bin";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Decoder '{0}' not supported")]
    UnsupportedDecoder(String),
    #[error("Decoder failed to load")]
    FailedLoadDecoder,
    #[error("Failed to read config")]
    Io(#[source] io::Error),
    #[error("Failed to deserialize config")]
    Yaml(#[from] serde_yaml::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[source] io::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    // directory holding the raw logs and their side-cars
    #[serde(default = "default_input")]
    pub input: PathBuf,
    // glob selecting the logs inside `input`
    #[serde(default = "default_include")]
    pub include: String,
    // corpus blob, `<input>/parsed.bin` if unset
    #[serde(default)]
    pub cache: Option<PathBuf>,
    #[serde(default)]
    pub histogram: HistogramMode,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    // Name of the selected decoder, see Decoders::load for the selection process
    #[serde(default = "default_decoder")]
    pub name: String,

    // parameters of the decoder, only used by `exec` for now
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            name: default_decoder(),
            parameter: BTreeMap::new(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            include: default_include(),
            cache: None,
            histogram: HistogramMode::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigErrors> {
        let reader = BufReader::new(File::open(path).map_err(ConfigErrors::Io)?);

        Ok(serde_yaml::from_reader(reader)?)
    }

    /// where the corpus blob of this configuration lives
    pub fn cache_path(&self) -> PathBuf {
        self.cache
            .clone()
            .unwrap_or_else(|| self.input.join(DEFAULT_CACHE_NAME))
    }

    /// Compile the glob selecting log files
    pub fn compile_include(&self) -> Result<GlobMatcher, ConfigErrors> {
        Ok(GlobBuilder::new(&self.include)
            .literal_separator(true)
            .build()?
            .compile_matcher())
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.input.is_dir() {
            error!(
                "input ({}) is not a directory",
                self.input.to_string_lossy()
            );
            contains_error = true;
        }

        if let Err(e) = self.compile_include() {
            error!("include '{}' is not a valid glob: {e}", self.include);
            contains_error = true;
        }

        if let Some(parent) = self.cache_path().parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                error!(
                    "cache directory {} does not exist",
                    parent.to_string_lossy()
                );
                contains_error = true;
            }
        }

        self.decoder.name = self.decoder.name.to_lowercase();
        match self.decoder.name.as_str() {
            "native" => {
                if !self.decoder.parameter.is_empty() {
                    warn!("decoder.parameter is ignored by the native decoder");
                }
            }
            "exec" => match self
                .decoder
                .parameter
                .get("exec")
                .and_then(|value| value.as_str())
            {
                Some(exec) => match check_executable(Path::new(exec)) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("decoder.parameter.exec ({exec}) is not executable");
                        contains_error = true;
                    }
                    Err(e) => {
                        error!("Failed to determine if decoder.parameter.exec ({exec}) is an executable: {e}");
                        contains_error = true;
                    }
                },
                None => {
                    error!("decoder.parameter.exec must be a valid path to an executable file");
                    contains_error = true;
                }
            },
            decoder_name => {
                error!("decoder.name ({decoder_name}) is not supported, please use `native` or `exec`");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_input() -> PathBuf {
    PathBuf::from(".")
}

fn default_include() -> String {
    "*.log".to_string()
}

fn default_decoder() -> String {
    "native".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults() {
        let config: IngestConfig = serde_yaml::from_str("input: /data/results\n").unwrap();

        assert_eq!(config.include, "*.log");
        assert_eq!(config.histogram, HistogramMode::Timeline);
        assert_eq!(config.decoder.name, "native");
        assert_eq!(config.cache_path(), PathBuf::from("/data/results/parsed.bin"));
    }

    #[test]
    fn full_config() {
        let config: IngestConfig = serde_yaml::from_str(
            r#"
input: ./results
include: "*.txt"
cache: /tmp/corpus.bin
histogram: percentiles
decoder:
  name: exec
  parameter:
    exec: ./extract-hist
    timeout: 1000
"#,
        )
        .unwrap();

        assert_eq!(config.histogram, HistogramMode::Percentiles);
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/corpus.bin"));
        assert_eq!(config.decoder.parameter.len(), 2);
        assert!(config.compile_include().unwrap().is_match("a.txt"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<IngestConfig>("inputs: ./results\n").is_err());
    }

    #[test]
    fn include_does_not_cross_directories() {
        let config = IngestConfig::default();
        let matcher = config.compile_include().unwrap();

        assert!(matcher.is_match("redis.1a.1t.1r.1c.uniform.log"));
        assert!(!matcher.is_match("nested/redis.1a.1t.1r.1c.uniform.log"));
        assert!(!matcher.is_match("redis.1a.1t.1r.1c.uniform-client0.hist"));
    }

    #[test]
    fn preflight_rejects_unsupported_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IngestConfig {
            input: dir.path().to_path_buf(),
            ..IngestConfig::default()
        };
        assert!(!config.preflight_checks());

        config.decoder.name = "Raw".to_string();
        assert!(config.preflight_checks());
        assert_eq!(config.decoder.name, "raw");
    }

    #[test]
    fn preflight_checks_exec_target() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = dir.path().join("decoder");
        fs::write(&decoder, "").unwrap();

        let mut config = IngestConfig {
            input: dir.path().to_path_buf(),
            ..IngestConfig::default()
        };
        config.decoder.name = "exec".to_string();
        assert!(config.preflight_checks());

        config.decoder.parameter.insert(
            "exec".to_string(),
            serde_yaml::Value::String(decoder.to_string_lossy().into_owned()),
        );
        // exists but lacks the exec bit
        assert!(config.preflight_checks());

        assert!(check_executable(Path::new("/bin/sh")).unwrap());
        assert!(matches!(
            check_executable(&dir.path().join("missing")),
            Err(ConfigErrors::FileNotFound)
        ));
    }

    #[test]
    fn preflight_rejects_missing_input() {
        let mut config = IngestConfig {
            input: PathBuf::from("/nonexistent/results"),
            cache: Some(PathBuf::from("/tmp/corpus.bin")),
            ..IngestConfig::default()
        };

        assert!(config.preflight_checks());
    }
}
