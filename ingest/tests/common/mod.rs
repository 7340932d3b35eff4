use hdrhistogram::{
    serialization::{
        interval_log::{IntervalLogWriterBuilder, Tag},
        V2Serializer,
    },
    Histogram,
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

pub const STATISTICS: &str = r#"{"domains": {"0": [{}, {
    "n1": {"desc": "B", "mem_size": 100, "materialized": "Full"},
    "n2": {"desc": "reader node", "mem_size": 30, "materialized": {"Partial": {}}},
    "n3": {"desc": "π[0, 1]", "mem_size": 50, "materialized": "Full"}
}]}}"#;

/// write an interval log with one bucket-0 processing/sojourn pair per operation
pub fn write_histograms(path: &Path, operations: &[&[u64]]) {
    let mut buffer = Vec::new();
    let mut serializer = V2Serializer::new();
    {
        let mut writer = IntervalLogWriterBuilder::new()
            .with_base_time(SystemTime::UNIX_EPOCH)
            .begin_log_with(&mut buffer, &mut serializer)
            .unwrap();

        for values in operations {
            let mut histogram = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
            for &value in values.iter() {
                histogram.record(value).unwrap();
            }

            for tag in ["processing", "sojourn"] {
                writer
                    .write_histogram(
                        &histogram,
                        Duration::ZERO,
                        Duration::from_secs(1),
                        Tag::new(tag),
                    )
                    .unwrap();
            }
        }
    }

    fs::write(path, buffer).unwrap();
}

/// `<dir>/<stem><suffix>`
pub fn side_car(dir: &Path, log: &str, suffix: &str) -> PathBuf {
    let stem = log.strip_suffix(".log").unwrap();

    dir.join(format!("{stem}{suffix}"))
}

/// a complete vote run with two clients
pub fn vote_run(dir: &Path, name: &str) {
    fs::write(
        dir.join(name),
        "# generated ops/s: 100\n# actual ops/s: 99\n# generated ops/s: 150\n# actual ops/s: 149\n",
    )
    .unwrap();
    fs::write(side_car(dir, name, "-statistics.json"), STATISTICS).unwrap();

    let fast = [500u64; 100];
    let slow = [1500u64; 100];
    write_histograms(&side_car(dir, name, "-client0.hist"), &[&fast, &[2000]]);
    write_histograms(&side_car(dir, name, "-client1.hist"), &[&slow, &[2000]]);
}
