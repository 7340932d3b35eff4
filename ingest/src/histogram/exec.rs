use super::{DecodeRequest, DecodedRow, DecoderError, HistogramMode};
use crate::config::{ConfigErrors, DecoderConfig};
use std::{
    ffi::OsString,
    io::{self, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace, warn};
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Decoder that runs an external tool and reads a tab separated table from its stdout
#[derive(Debug, Clone)]
pub struct ExecDecoder {
    pub decoder: PathBuf,
    pub params: Vec<OsString>,
    pub timeout: Duration,
}

impl ExecDecoder {
    pub fn load(config: &DecoderConfig) -> Result<Self, ConfigErrors> {
        let Some(exec) = config.parameter.get("exec").and_then(|exec| exec.as_str()) else {
            error!("The exec decoder requires decoder.parameter.exec to be a str pointing to the decoder executable");

            return Err(ConfigErrors::FailedLoadDecoder);
        };

        let timeout = Duration::from_millis(match config.parameter.get("timeout") {
            Some(timeout_value) => match timeout_value.as_u64() {
                Some(value) => value,
                None => {
                    warn!("Decoder timeout must be a natural number");
                    return Err(ConfigErrors::FailedLoadDecoder);
                }
            },
            None => DEFAULT_TIMEOUT_MS,
        });

        let params = match config.parameter.get("params") {
            None => Vec::new(),
            Some(serde_yaml::Value::String(params)) => {
                params.split_whitespace().map(OsString::from).collect()
            }
            Some(serde_yaml::Value::Sequence(params)) => {
                let mut collected = Vec::with_capacity(params.len());
                for param in params {
                    match param.as_str() {
                        Some(param) => collected.push(OsString::from(param)),
                        None => {
                            warn!("Decoder params must be strings");
                            return Err(ConfigErrors::FailedLoadDecoder);
                        }
                    }
                }
                collected
            }
            Some(_) => {
                warn!("Decoder params must be a string or a list of strings");
                return Err(ConfigErrors::FailedLoadDecoder);
            }
        };

        Ok(Self {
            decoder: PathBuf::from(exec),
            params,
            timeout,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn decode(&self, request: &DecodeRequest) -> Result<Vec<DecodedRow>, DecoderError> {
        let mut command = Command::new(&self.decoder);
        command.args(&self.params);
        if request.mode == HistogramMode::Timeline {
            command.arg("--timeline");
        }
        command
            .args(request.paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut handle = command.spawn().map_err(DecoderError::SpawnDecoder)?;
        debug!("Decoder running as {}", handle.id());

        // drain both pipes while waiting, a large table would otherwise block the child
        let stdout = drain(handle.stdout.take());
        let stderr = drain(handle.stderr.take());

        let status = match handle.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!("Decoder ran into timeout, killing it");
                handle.kill()?;
                handle.wait()?;

                return Err(DecoderError::ChildTimeout(self.timeout));
            }
            Err(err) => {
                debug!("Waiting for the decoder failed, killing it");
                terminate(&mut handle);

                return Err(DecoderError::ChildError(err));
            }
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            return Err(DecoderError::ChildStatus {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.is_empty() {
            trace!(stderr = %stderr, "Decoder diagnostics");
        }

        parse_table(stdout.as_bytes())
    }
}

/// kill and reap `child`, it may already have exited
pub(crate) fn terminate(child: &mut Child) {
    if let Err(err) = child.kill() {
        trace!(error = %err, "Decoder could not be killed");
    }
    if let Err(err) = child.wait() {
        warn!(error = %err, "Decoder could not be reaped");
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<String>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            pipe.read_to_string(&mut buffer)?;

            Ok(buffer)
        })
    })
}

fn collect(reader: Option<JoinHandle<io::Result<String>>>) -> io::Result<String> {
    match reader {
        Some(reader) => reader
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "decoder pipe reader panicked"))?,
        None => Ok(String::new()),
    }
}

/// Column layout of a decoder table
enum Layout {
    /// one statistic per row
    Long { stat: usize, value: usize },
    /// one column per statistic
    Wide(Vec<(usize, String)>),
}

/// parse a decoder table, either long (`stat`/`value` columns) or wide (one column per statistic)
pub fn parse_table<R: Read>(input: R) -> Result<Vec<DecodedRow>, DecoderError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(input);
    let headers = reader.headers()?.clone();
    let find = |names: &[&str]| headers.iter().position(|header| names.contains(&header.trim()));

    let operation = find(&["op", "operation"]).ok_or(DecoderError::MissingColumn("op"))?;
    let metric = find(&["metric"]).ok_or(DecoderError::MissingColumn("metric"))?;
    let until = find(&["until", "time_bucket", "time-bucket"]);

    let layout = match (
        find(&["stat", "pct", "percentile", "statistic"]),
        find(&["value", "time"]),
    ) {
        (Some(stat), Some(value)) => Layout::Long { stat, value },
        _ => {
            let columns: Vec<(usize, String)> = headers
                .iter()
                .enumerate()
                .filter(|(index, _)| {
                    *index != operation && *index != metric && Some(*index) != until
                })
                .map(|(index, header)| (index, header.trim().to_string()))
                .collect();

            if columns.is_empty() {
                return Err(DecoderError::MissingColumn("value"));
            }

            Layout::Wide(columns)
        }
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |index: usize| record.get(index).unwrap_or("").trim();

        let until = match until {
            Some(index) => parse_field::<u64>("until", field(index))?,
            None => 0,
        };

        match &layout {
            Layout::Long { stat, value } => rows.push(DecodedRow {
                operation: field(operation).to_string(),
                metric: field(metric).to_string(),
                until,
                stat: field(*stat).to_string(),
                value: parse_field("value", field(*value))?,
            }),
            Layout::Wide(columns) => {
                for (index, name) in columns {
                    rows.push(DecodedRow {
                        operation: field(operation).to_string(),
                        metric: field(metric).to_string(),
                        until,
                        stat: name.clone(),
                        value: parse_field(name, field(*index))?,
                    });
                }
            }
        }
    }

    Ok(rows)
}

fn parse_field<T: std::str::FromStr>(column: &str, value: &str) -> Result<T, DecoderError> {
    value.parse().map_err(|_| DecoderError::InvalidValue {
        column: column.to_string(),
        value: value.to_string(),
    })
}
