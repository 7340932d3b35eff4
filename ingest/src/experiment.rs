use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    fmt, fs, io,
    path::Path,
    str::FromStr,
};
use tracing::trace;

/// bytes per GiB, memory limits are captured in bytes but reported in GiB
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

static VOTE_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(full|partial)\.(\d+)a\.(\d+)t\.(\d+)r\.(\d+)c\.(\d+)m\.(uniform|skewed)\.log$")
        .expect("vote grammar is a valid regex")
});

static REDIS_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^redis\.(\d+)a\.(\d+)t\.(\d+)r\.(\d+)c(?:\.(\d+)m)?\.(uniform|skewed)\.log$")
        .expect("redis grammar is a valid regex")
});

static LOBSTERS_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^lobsters-direct(?:_(\d+))?(_full)?(_durable)?-(\d+)-(\d+)m\.log$")
        .expect("lobsters grammar is a valid regex")
});

static MYSQL_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^lobsters-mysql-(\d+)-0m\.log$").expect("mysql grammar is a valid regex")
});

// the harness writes `-` between the leading components, older notes use `.`
static MIGRATION_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^vote-(partial|no-partial)[-.](stupid|reuse)[-.](\d+(?:\.\d+)?)M\.(uniform|skewed|zipf\d+(?:\.\d+)?)\.log$")
        .expect("vote-migration grammar is a valid regex")
});

/// Benchmark families, each with its own filename grammar and index schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Family {
    Vote,
    Redis,
    Lobsters,
    /// lobsters served by MySQL, the baseline for the lobsters runs
    Mysql,
    Migration,
}

impl Family {
    pub const ALL: [Family; 5] = [
        Family::Vote,
        Family::Redis,
        Family::Lobsters,
        Family::Mysql,
        Family::Migration,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vote => "vote",
            Self::Redis => "redis",
            Self::Lobsters => "lobsters",
            Self::Mysql => "mysql",
            Self::Migration => "vote-migration",
        }
    }

    fn grammar(&self) -> &'static Regex {
        match self {
            Self::Vote => &VOTE_GRAMMAR,
            Self::Redis => &REDIS_GRAMMAR,
            Self::Lobsters => &LOBSTERS_GRAMMAR,
            Self::Mysql => &MYSQL_GRAMMAR,
            Self::Migration => &MIGRATION_GRAMMAR,
        }
    }

    /// match `name` against this family's grammar only
    pub fn parse(&self, name: &str) -> Option<ExperimentDescriptor> {
        let captures = self.grammar().captures(name)?;

        match self {
            Self::Vote => VoteExperiment::from_captures(&captures).map(ExperimentDescriptor::Vote),
            Self::Redis => {
                RedisExperiment::from_captures(&captures).map(ExperimentDescriptor::Redis)
            }
            Self::Lobsters => {
                LobstersExperiment::from_captures(&captures).map(ExperimentDescriptor::Lobsters)
            }
            Self::Mysql => MysqlExperiment::from_captures(&captures).map(ExperimentDescriptor::Mysql),
            Self::Migration => {
                MigrationExperiment::from_captures(&captures).map(ExperimentDescriptor::Migration)
            }
        }
    }

    /// dispatch a file basename over all family grammars
    pub fn classify_name(name: &str) -> Option<ExperimentDescriptor> {
        Self::ALL.iter().find_map(|family| family.parse(name))
    }

    /// columns of the canonical composite index, in sort order
    pub fn index_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Vote => &[
                "target",
                "partial",
                "distribution",
                "write_every",
                "clients",
                "articles",
                "memlimit",
                "operation",
                "until",
                "metric",
            ],
            Self::Redis => &[
                "target",
                "distribution",
                "write_every",
                "clients",
                "articles",
                "operation",
                "until",
                "metric",
            ],
            Self::Lobsters => &[
                "scale",
                "partial",
                "durable",
                "memlimit",
                "operation",
                "until",
                "metric",
            ],
            Self::Mysql => &["scale", "operation", "until", "metric"],
            Self::Migration => &[],
        }
    }

    /// whether runs of this family end up in an indexed table
    pub fn is_tabular(&self) -> bool {
        !matches!(self, Self::Migration)
    }

    /// whether a run is only usable together with its `-statistics.json` side-car
    pub fn requires_memory(&self) -> bool {
        matches!(self, Self::Vote | Self::Lobsters)
    }

    /// whether histograms are written once per client (`-client<N>.hist`)
    pub fn per_client_histograms(&self) -> bool {
        matches!(self, Self::Vote | Self::Redis)
    }

    /// operations in the order the load generator writes their histograms
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            Self::Vote | Self::Redis => &["writes", "reads"],
            Self::Lobsters | Self::Mysql => &[
                "Frontpage",
                "Recent",
                "Comments",
                "User",
                "Story",
                "Login",
                "Logout",
                "StoryVote",
                "CommentVote",
                "Submit",
                "Comment",
            ],
            Self::Migration => &[],
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.name() == s)
            .ok_or_else(|| format!("unknown benchmark family '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Distribution {
    Uniform,
    Skewed,
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Skewed => "skewed",
        }
    }

    fn from_tag(tag: &str) -> Self {
        if tag == "uniform" {
            Self::Uniform
        } else {
            Self::Skewed
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteExperiment {
    pub partial: bool,
    pub articles: u64,
    pub target: u64,
    pub write_every: u64,
    pub clients: u64,
    /// memory limit in GiB, 0 means unlimited
    pub memlimit: f64,
    pub distribution: Distribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisExperiment {
    pub articles: u64,
    pub target: u64,
    pub write_every: u64,
    pub clients: u64,
    /// memory limit in GiB, only present when encoded in the file name
    pub memlimit: Option<f64>,
    pub distribution: Distribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobstersExperiment {
    pub shards: u64,
    pub partial: bool,
    pub durable: bool,
    pub scale: u64,
    /// memory limit in GiB, 0 means unlimited
    pub memlimit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MysqlExperiment {
    pub scale: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationExperiment {
    pub partial: bool,
    pub reuse: bool,
    pub articles: u64,
    pub distribution: Distribution,
    /// distribution tag as written by the harness, e.g. `zipf1.08`
    pub distribution_tag: String,
}

/// Family-tagged experiment parameters, derived purely from a file name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExperimentDescriptor {
    Vote(VoteExperiment),
    Redis(RedisExperiment),
    Lobsters(LobstersExperiment),
    Mysql(MysqlExperiment),
    Migration(MigrationExperiment),
}

impl ExperimentDescriptor {
    pub fn family(&self) -> Family {
        match self {
            Self::Vote(_) => Family::Vote,
            Self::Redis(_) => Family::Redis,
            Self::Lobsters(_) => Family::Lobsters,
            Self::Mysql(_) => Family::Mysql,
            Self::Migration(_) => Family::Migration,
        }
    }

    /// reconstruct the canonical log file name for these parameters
    pub fn file_name(&self) -> String {
        match self {
            Self::Vote(vote) => format!(
                "{}.{}a.{}t.{}r.{}c.{}m.{}.log",
                if vote.partial { "partial" } else { "full" },
                vote.articles,
                vote.target,
                vote.write_every,
                vote.clients,
                gib_to_bytes(vote.memlimit),
                vote.distribution,
            ),
            Self::Redis(redis) => format!(
                "redis.{}a.{}t.{}r.{}c{}.{}.log",
                redis.articles,
                redis.target,
                redis.write_every,
                redis.clients,
                redis
                    .memlimit
                    .map(|limit| format!(".{}m", gib_to_bytes(limit)))
                    .unwrap_or_default(),
                redis.distribution,
            ),
            Self::Lobsters(lobsters) => format!(
                "lobsters-direct{}{}{}-{}-{}m.log",
                if lobsters.shards > 0 {
                    format!("_{}", lobsters.shards)
                } else {
                    String::new()
                },
                if lobsters.partial { "" } else { "_full" },
                if lobsters.durable { "_durable" } else { "" },
                lobsters.scale,
                gib_to_bytes(lobsters.memlimit),
            ),
            Self::Mysql(mysql) => format!("lobsters-mysql-{}-0m.log", mysql.scale),
            Self::Migration(migration) => format!(
                "vote-{}-{}-{}M.{}.log",
                if migration.partial {
                    "partial"
                } else {
                    "no-partial"
                },
                if migration.reuse { "reuse" } else { "stupid" },
                migration.articles as f64 / 1_000_000.0,
                migration.distribution_tag,
            ),
        }
    }
}

impl VoteExperiment {
    fn from_captures(captures: &Captures) -> Option<Self> {
        Some(Self {
            partial: &captures[1] == "partial",
            articles: captures[2].parse().ok()?,
            target: captures[3].parse().ok()?,
            write_every: captures[4].parse().ok()?,
            clients: captures[5].parse().ok()?,
            memlimit: bytes_to_gib(&captures[6])?,
            distribution: Distribution::from_tag(&captures[7]),
        })
    }
}

impl RedisExperiment {
    fn from_captures(captures: &Captures) -> Option<Self> {
        let memlimit = match captures.get(5) {
            Some(limit) => Some(bytes_to_gib(limit.as_str())?),
            None => None,
        };

        Some(Self {
            articles: captures[1].parse().ok()?,
            target: captures[2].parse().ok()?,
            write_every: captures[3].parse().ok()?,
            clients: captures[4].parse().ok()?,
            memlimit,
            distribution: Distribution::from_tag(&captures[6]),
        })
    }
}

impl LobstersExperiment {
    fn from_captures(captures: &Captures) -> Option<Self> {
        let shards = match captures.get(1) {
            Some(shards) => shards.as_str().parse().ok()?,
            None => 0,
        };

        Some(Self {
            shards,
            // partial state is the default, `_full` turns it off
            partial: captures.get(2).is_none(),
            durable: captures.get(3).is_some(),
            scale: captures[4].parse().ok()?,
            memlimit: bytes_to_gib(&captures[5])?,
        })
    }
}

impl MysqlExperiment {
    fn from_captures(captures: &Captures) -> Option<Self> {
        Some(Self {
            scale: captures[1].parse().ok()?,
        })
    }
}

impl MigrationExperiment {
    fn from_captures(captures: &Captures) -> Option<Self> {
        let millions: f64 = captures[3].parse().ok()?;

        Some(Self {
            partial: &captures[1] == "partial",
            reuse: &captures[2] == "reuse",
            articles: (millions * 1_000_000.0).round() as u64,
            distribution: Distribution::from_tag(&captures[4]),
            distribution_tag: captures[4].to_string(),
        })
    }
}

fn bytes_to_gib(captured: &str) -> Option<f64> {
    captured.parse::<u64>().ok().map(|bytes| bytes as f64 / GIB)
}

fn gib_to_bytes(gib: f64) -> u64 {
    (gib * GIB).round() as u64
}

/// Result of looking at a single file in the raw log directory
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Recognized(ExperimentDescriptor),
    Unrecognized,
    Empty,
}

/// classify a log file by name, rejecting zero-byte files regardless of the name
pub fn classify_path(path: &Path) -> io::Result<Classification> {
    let Some(descriptor) = path
        .file_name()
        .and_then(OsStr::to_str)
        .and_then(Family::classify_name)
    else {
        return Ok(Classification::Unrecognized);
    };

    if fs::metadata(path)?.len() == 0 {
        return Ok(Classification::Empty);
    }

    trace!(path = ?path, family = %descriptor.family(), "Classified log file");

    Ok(Classification::Recognized(descriptor))
}
