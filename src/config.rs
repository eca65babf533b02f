use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "clap")]
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Rank;

/// Environment variable set by the launcher with the rank of the spawned process.
pub const RANK_ENV_VAR: &str = "TEMPSCATTER_RANK";
/// Environment variable set by the launcher with the TOML configuration of the run.
pub const CONFIG_ENV_VAR: &str = "TEMPSCATTER_CONFIG";

/// Number of records generated when nothing else is asked.
pub const DEFAULT_RECORDS: usize = 100_000;
/// Directory the reports are written to when nothing else is asked.
pub const DEFAULT_REPORT_DIR: &str = "performance_reports";
/// Maximum time a rank waits for a message before giving up.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(300);

/// The configuration of a run.
///
/// ## Local runtime
///
/// All the ranks are threads of the current process:
///
/// ```
/// # use tempscatter::config::EnvironmentConfig;
/// let config = EnvironmentConfig::local(4);
/// assert_eq!(config.processes(), 4);
/// ```
///
/// ## Remote runtime
///
/// Every rank is a separate process, the coordinator listens on a TCP address the other ranks
/// connect to. The configuration is usually read from a TOML file:
///
/// ```toml
/// records = 1000000
///
/// [runtime]
/// type = "remote"
/// coordinator = "10.0.0.1:7420"
/// processes = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub runtime: RuntimeConfig,
    /// Number of records generated by the coordinator.
    #[serde(default = "default_records")]
    pub records: usize,
    /// Seed of the record generator, random if missing.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Where to write the performance report.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    /// Seconds a rank waits for a message before declaring the peer lost.
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_secs: u64,
}

fn default_records() -> usize {
    DEFAULT_RECORDS
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(DEFAULT_REPORT_DIR)
}

fn default_recv_timeout() -> u64 {
    DEFAULT_RECV_TIMEOUT.as_secs()
}

/// Which runtime to use for running the ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// Use only the local machine: every rank is a thread.
    Local(LocalConfig),
    /// Use TCP connections: every rank is a process.
    Remote(RemoteConfig),
}

/// Configuration of the local runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub processes: usize,
}

/// Configuration of the remote runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Address the coordinator listens on and the other ranks connect to.
    pub coordinator: String,
    pub processes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the number of processes must be at least 1")]
    NoProcesses,
    #[error("the receive timeout must be at least one second")]
    ZeroTimeout,
    #[error("rank {rank} is out of range for {processes} processes")]
    RankOutOfRange { rank: Rank, processes: usize },
    #[error("invalid rank {0:?}")]
    InvalidRank(String),
    #[error("the remote runtime needs the rank of this process")]
    MissingRank,
    #[error("the configuration is not for the {expected} runtime")]
    WrongRuntime { expected: &'static str },
    #[error("cannot read the configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize the configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl EnvironmentConfig {
    /// Local environment with `processes` ranks.
    pub fn local(processes: usize) -> Self {
        Self::with_runtime(RuntimeConfig::Local(LocalConfig { processes }))
    }

    /// Remote environment where the coordinator listens on `coordinator`.
    pub fn remote(coordinator: impl Into<String>, processes: usize) -> Self {
        Self::with_runtime(RuntimeConfig::Remote(RemoteConfig {
            coordinator: coordinator.into(),
            processes,
        }))
    }

    fn with_runtime(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            records: DEFAULT_RECORDS,
            seed: None,
            report_dir: default_report_dir(),
            recv_timeout_secs: default_recv_timeout(),
        }
    }

    /// Read a remote configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// The configuration passed by the launcher, if this process was spawned by it.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(content) => content.parse().map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn processes(&self) -> usize {
        match &self.runtime {
            RuntimeConfig::Local(local) => local.processes,
            RuntimeConfig::Remote(remote) => remote.processes,
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }

    /// Check that the configuration describes a run that can be performed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processes() == 0 {
            return Err(ConfigError::NoProcesses);
        }
        if self.recv_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Check that `rank` is one of the ranks of this configuration.
    pub fn check_rank(&self, rank: Rank) -> Result<Rank, ConfigError> {
        if rank >= self.processes() {
            return Err(ConfigError::RankOutOfRange {
                rank,
                processes: self.processes(),
            });
        }
        Ok(rank)
    }
}

impl FromStr for EnvironmentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: EnvironmentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Display for EnvironmentConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.runtime {
            RuntimeConfig::Local(local) => write!(f, "local[{}]", local.processes)?,
            RuntimeConfig::Remote(remote) => {
                write!(f, "remote[{}@{}]", remote.processes, remote.coordinator)?
            }
        }
        write!(f, " {} records", self.records)
    }
}

/// The rank of this process as set by the launcher, if any.
pub fn rank_from_env() -> Result<Option<Rank>, ConfigError> {
    match std::env::var(RANK_ENV_VAR) {
        Ok(value) => parse_rank(&value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_rank(value: &str) -> Result<Rank, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidRank(value.to_string()))
}

/// Options of the `run` command.
#[cfg(feature = "clap")]
#[derive(Debug, Clone, Parser)]
#[clap(group = clap::ArgGroup::new("runtime").required(false))]
pub struct RunOptions {
    /// Run all the ranks as threads of this process.
    #[clap(short, long, group = "runtime", value_name = "PROCESSES")]
    pub local: Option<usize>,

    /// Run with the remote runtime described by the TOML file.
    #[clap(short, long, group = "runtime", value_name = "FILE")]
    pub remote: Option<PathBuf>,

    /// Spawn every rank of the remote runtime as a process of this machine.
    #[clap(long, requires = "remote")]
    pub spawn: bool,

    /// Rank of this process in the remote runtime.
    #[clap(long)]
    pub rank: Option<Rank>,

    /// Number of records to generate.
    #[clap(short = 'n', long)]
    pub records: Option<usize>,

    /// Seed of the record generator.
    #[clap(long)]
    pub seed: Option<u64>,

    /// Directory of the performance report.
    #[clap(long)]
    pub report_dir: Option<PathBuf>,

    /// Seconds to wait for a message before failing.
    #[clap(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[cfg(feature = "clap")]
impl RunOptions {
    /// Build the configuration of the run.
    ///
    /// The configuration passed by the launcher takes precedence over everything else. Without a
    /// runtime on the command line a local run with a single rank is performed.
    pub fn into_config(self) -> Result<EnvironmentConfig, ConfigError> {
        if let Some(config) = EnvironmentConfig::from_env()? {
            return Ok(config);
        }
        let mut config = match (self.local, &self.remote) {
            (_, Some(path)) => EnvironmentConfig::from_file(path)?,
            (Some(processes), None) => EnvironmentConfig::local(processes),
            (None, None) => EnvironmentConfig::local(1),
        };
        if let Some(records) = self.records {
            config.records = records;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(dir) = self.report_dir {
            config.report_dir = dir;
        }
        if let Some(timeout) = self.timeout {
            config.recv_timeout_secs = timeout;
        }
        config.validate()?;
        Ok(config)
    }

    /// The rank of this process: from the launcher if spawned, otherwise from the command line.
    pub fn rank(&self, config: &EnvironmentConfig) -> Result<Rank, ConfigError> {
        let rank = rank_from_env()?
            .or(self.rank)
            .ok_or(ConfigError::MissingRank)?;
        config.check_rank(rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_from_toml() {
        let config: EnvironmentConfig = r#"
            records = 42
            seed = 7

            [runtime]
            type = "remote"
            coordinator = "127.0.0.1:7420"
            processes = 3
        "#
        .parse()
        .unwrap();
        assert_eq!(config.records, 42);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.processes(), 3);
        assert_eq!(config.report_dir, PathBuf::from(DEFAULT_REPORT_DIR));
        assert_eq!(config.recv_timeout(), DEFAULT_RECV_TIMEOUT);
        assert_eq!(
            config.runtime,
            RuntimeConfig::Remote(RemoteConfig {
                coordinator: "127.0.0.1:7420".into(),
                processes: 3
            })
        );
    }

    #[test]
    fn toml_round_trip() {
        let mut config = EnvironmentConfig::remote("localhost:9000", 5);
        config.seed = Some(1);
        let parsed: EnvironmentConfig = config.to_toml().unwrap().parse().unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn zero_processes_rejected() {
        let err = "[runtime]\ntype = \"local\"\nprocesses = 0\n"
            .parse::<EnvironmentConfig>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoProcesses));

        let mut config = EnvironmentConfig::local(2);
        config.recv_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn unknown_runtime_rejected() {
        let err = "[runtime]\ntype = \"cluster\"\nprocesses = 2\n"
            .parse::<EnvironmentConfig>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn ranks() {
        let config = EnvironmentConfig::local(3);
        assert_eq!(config.check_rank(2).unwrap(), 2);
        assert!(matches!(
            config.check_rank(3),
            Err(ConfigError::RankOutOfRange {
                rank: 3,
                processes: 3
            })
        ));
        assert_eq!(parse_rank(" 4\n").unwrap(), 4);
        assert!(matches!(parse_rank("x"), Err(ConfigError::InvalidRank(_))));
    }

    #[test]
    fn display() {
        let mut config = EnvironmentConfig::local(4);
        config.records = 10;
        assert_eq!(config.to_string(), "local[4] 10 records");
    }

    #[cfg(feature = "clap")]
    #[test]
    fn command_line() {
        let options = RunOptions::parse_from(["run", "--local", "3", "-n", "500", "--seed", "9"]);
        let config = options.into_config().unwrap();
        assert_eq!(config.processes(), 3);
        assert_eq!(config.records, 500);
        assert_eq!(config.seed, Some(9));

        let options = RunOptions::parse_from(["run"]);
        assert_eq!(options.into_config().unwrap().processes(), 1);

        assert!(RunOptions::try_parse_from(["run", "--local", "2", "--remote", "x.toml"]).is_err());
    }
}
