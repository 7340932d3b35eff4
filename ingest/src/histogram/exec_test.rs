use super::{
    exec::{parse_table, terminate, ExecDecoder},
    DecodeRequest, DecoderError, HistogramMode,
};
use crate::{config::DecoderConfig, experiment::Family};
use std::{
    ffi::OsString,
    fs,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};

/// run `script` through /bin/sh so the file needs no exec bit
fn shell_decoder(dir: &tempfile::TempDir, script: &str, timeout: Duration) -> ExecDecoder {
    let path = dir.path().join("decoder.sh");
    fs::write(&path, script).unwrap();

    ExecDecoder {
        decoder: PathBuf::from("/bin/sh"),
        params: vec![OsString::from(path)],
        timeout,
    }
}

const ECHO_ARGS: &str = r#"printf 'op\tmetric\tuntil\tstat\tvalue\n'
i=0
for arg in "$@"; do
    printf 'args\tsojourn\t%s\t%s\t1\n' "$i" "$arg"
    i=$((i + 1))
done
"#;

#[test]
pub fn long_table() {
    let table = "op\tmetric\tuntil\tstat\tvalue\nwrites\tsojourn\t4\tp90\t1.25\nreads\tprocessing\t1\tmean\t0.5\n";
    let rows = parse_table(table.as_bytes()).unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].operation, "writes");
    assert_eq!(rows[0].metric, "sojourn");
    assert_eq!(rows[0].until, 4);
    assert_eq!(rows[0].stat, "p90");
    assert_eq!(rows[0].value, 1.25);
    assert_eq!(rows[1].stat, "mean");
}

#[test]
pub fn wide_timeline_is_melted() {
    let table = "op\tuntil\tmetric\tmean\tmedian\tp99\nwrites\t2\tsojourn\t1.0\t0.5\t3.0\n";
    let rows = parse_table(table.as_bytes()).unwrap();

    let stats: Vec<(&str, f64)> = rows
        .iter()
        .map(|row| (row.stat.as_str(), row.value))
        .collect();
    assert_eq!(stats, vec![("mean", 1.0), ("median", 0.5), ("p99", 3.0)]);
    assert!(rows
        .iter()
        .all(|row| row.operation == "writes" && row.until == 2 && row.metric == "sojourn"));
}

#[test]
pub fn legacy_percentile_table_without_bucket() {
    let table = "op\tmetric\tpct\ttime\nreads\tsojourn\t0.5\t2\n";
    let rows = parse_table(table.as_bytes()).unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].until, 0);
    assert_eq!(rows[0].stat, "0.5");
    assert_eq!(rows[0].value, 2.0);
}

#[test]
pub fn missing_metric_column() {
    let table = "op\tstat\tvalue\nreads\tmean\t2\n";

    assert!(matches!(
        parse_table(table.as_bytes()),
        Err(DecoderError::MissingColumn("metric"))
    ));
}

#[test]
pub fn unparsable_value() {
    let table = "op\tmetric\tstat\tvalue\nreads\tsojourn\tmean\tfast\n";

    assert!(matches!(
        parse_table(table.as_bytes()),
        Err(DecoderError::InvalidValue { .. })
    ));
}

#[test]
pub fn decoder_receives_flag_and_paths() {
    let dir = tempfile::tempdir().unwrap();
    let decoder = shell_decoder(&dir, ECHO_ARGS, Duration::from_secs(10));
    let paths = vec![
        dir.path().join("run-client0.hist"),
        dir.path().join("run-client1.hist"),
    ];

    let rows = decoder
        .decode(&DecodeRequest {
            family: Family::Vote,
            paths: &paths,
            mode: HistogramMode::Timeline,
        })
        .unwrap();
    let args: Vec<&str> = rows.iter().map(|row| row.stat.as_str()).collect();

    assert_eq!(
        args,
        vec![
            "--timeline",
            paths[0].to_str().unwrap(),
            paths[1].to_str().unwrap(),
        ]
    );

    let rows = decoder
        .decode(&DecodeRequest {
            family: Family::Vote,
            paths: &paths[..1],
            mode: HistogramMode::Percentiles,
        })
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].stat, paths[0].to_str().unwrap());
}

#[test]
pub fn non_zero_exit_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let decoder = shell_decoder(&dir, "echo broken >&2\nexit 3\n", Duration::from_secs(10));

    let result = decoder.decode(&DecodeRequest {
        family: Family::Redis,
        paths: &[],
        mode: HistogramMode::Timeline,
    });

    match result {
        Err(DecoderError::ChildStatus { stderr, .. }) => assert_eq!(stderr, "broken"),
        other => panic!("expected a child status error, got {other:?}"),
    }
}

#[test]
pub fn slow_decoder_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let decoder = shell_decoder(&dir, "exec sleep 5\n", Duration::from_millis(100));

    let result = decoder.decode(&DecodeRequest {
        family: Family::Vote,
        paths: &[],
        mode: HistogramMode::Timeline,
    });

    assert!(matches!(result, Err(DecoderError::ChildTimeout(_))));
}

#[test]
pub fn terminated_decoder_is_reaped() {
    let mut child = Command::new("/bin/sh")
        .args(["-c", "exec sleep 5"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    terminate(&mut child);

    let status = child.try_wait().unwrap().expect("child was reaped");
    assert!(!status.success());

    // a second call on an exited child is harmless
    terminate(&mut child);
}

#[test]
pub fn missing_executable() {
    let decoder = ExecDecoder {
        decoder: PathBuf::from("/nonexistent/extract-hist"),
        params: Vec::new(),
        timeout: Duration::from_secs(1),
    };

    let result = decoder.decode(&DecodeRequest {
        family: Family::Vote,
        paths: &[],
        mode: HistogramMode::Timeline,
    });

    assert!(matches!(result, Err(DecoderError::SpawnDecoder(_))));
}

#[test]
pub fn load_parameters() {
    let config: DecoderConfig = serde_yaml::from_str(
        "name: exec\nparameter:\n  exec: /usr/bin/extract-hist\n  params: [--quiet, -v]\n  timeout: 250\n",
    )
    .unwrap();
    let decoder = ExecDecoder::load(&config).unwrap();

    assert_eq!(decoder.decoder, PathBuf::from("/usr/bin/extract-hist"));
    assert_eq!(
        decoder.params,
        vec![OsString::from("--quiet"), OsString::from("-v")]
    );
    assert_eq!(decoder.timeout, Duration::from_millis(250));

    let config: DecoderConfig =
        serde_yaml::from_str("name: exec\nparameter:\n  exec: ./extract-hist\n  params: -a -b\n")
            .unwrap();
    let decoder = ExecDecoder::load(&config).unwrap();

    assert_eq!(decoder.params.len(), 2);
    assert_eq!(decoder.timeout, Duration::from_secs(60));
}

#[test]
pub fn load_requires_exec() {
    let config: DecoderConfig = serde_yaml::from_str("name: exec\n").unwrap();

    assert!(ExecDecoder::load(&config).is_err());

    let config: DecoderConfig =
        serde_yaml::from_str("name: exec\nparameter:\n  exec: ./x\n  timeout: soon\n").unwrap();

    assert!(ExecDecoder::load(&config).is_err());
}
