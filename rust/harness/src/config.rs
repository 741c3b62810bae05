//! Job file parsing.
//!
//! The job file is TOML with a `[harness]` table for staging settings and a
//! `[job]` table holding the [`JobDescriptor`] template shared by every run.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use klynge_params::{ConfigParser, Delimiter};
use serde::{Deserialize, Serialize};

/// Job file read when none is given on the command line.
pub const DEFAULT_JOB_FILE: &str = "klynge.toml";

/// Top-level job file after validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub job: JobDescriptor,
}

/// Settings for staging and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    /// Directory that receives one subdirectory per job.
    #[serde(default = "default_jobdir")]
    pub jobdir: PathBuf,
    /// Parameter file, relative to the project root.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Files and directories copied into every job directory.
    #[serde(default)]
    pub project_paths: Vec<PathBuf>,
    /// Override for the profile's submission command.
    #[serde(default)]
    pub submit_command: Option<Vec<String>>,
    /// Separator between key and value in the parameter file; any
    /// whitespace when unset.
    #[serde(default)]
    pub delimiter: Option<String>,
    /// Starts a comment in the parameter file.
    #[serde(default = "default_comment")]
    pub comment: char,
    /// Marks a directive line in the parameter file.
    #[serde(default = "default_metachar")]
    pub metachar: char,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            jobdir: default_jobdir(),
            config_path: None,
            project_paths: Vec::new(),
            submit_command: None,
            delimiter: None,
            comment: default_comment(),
            metachar: default_metachar(),
        }
    }
}

impl HarnessSettings {
    /// Parameter file parser for these settings.
    #[must_use]
    pub fn parser(&self) -> ConfigParser {
        let delimiter = self
            .delimiter
            .clone()
            .map_or(Delimiter::Whitespace, Delimiter::Literal);
        ConfigParser::new()
            .with_delimiter(delimiter)
            .with_comment(self.comment)
            .with_metachar(self.metachar)
    }
}

/// Known cluster back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterProfile {
    /// Slurm on the Abel cluster: `jobsetup`, `$SCRATCH`, and `chkfile`.
    #[default]
    Abel,
}

impl fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abel => write!(f, "abel"),
        }
    }
}

impl FromStr for ClusterProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abel" => Ok(Self::Abel),
            _ => Err(ConfigError::UnknownProfile(s.to_string())),
        }
    }
}

/// Scheduler-facing job metadata.
///
/// One template is shared across a sweep; the runner sets `name` and
/// prepends the staged inputs to `infiles` per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    /// Base name; jobs are named `{name}{index}`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Cluster profile name, resolved with [`JobDescriptor::profile`].
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_account")]
    pub account: String,
    /// Wall-clock budget in seconds.
    #[serde(default = "default_wall_time")]
    pub wall_time: u64,
    #[serde(default = "default_mem_per_cpu")]
    pub mem_per_cpu: String,
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    /// Environment modules to load.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Commands run inside the job directory, in order.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Extra paths copied into scratch before the commands run. Remote jobs
    /// copy the staged inputs first, then these.
    #[serde(default)]
    pub infiles: Vec<String>,
    /// Paths copied back from scratch when the job ends.
    #[serde(default)]
    pub outfiles: Vec<String>,
    /// Request whole nodes.
    #[serde(default)]
    pub exclusive: bool,
    /// Scheduler mail notifications, e.g. `ALL` or `END`.
    #[serde(default)]
    pub mail_type: Option<String>,
}

impl Default for JobDescriptor {
    fn default() -> Self {
        Self {
            name: default_name(),
            cluster: default_cluster(),
            account: default_account(),
            wall_time: default_wall_time(),
            mem_per_cpu: default_mem_per_cpu(),
            cpus_per_task: default_cpus_per_task(),
            modules: Vec::new(),
            commands: Vec::new(),
            infiles: Vec::new(),
            outfiles: Vec::new(),
            exclusive: false,
            mail_type: None,
        }
    }
}

impl JobDescriptor {
    /// Resolve the cluster profile, failing on unknown names.
    pub fn profile(&self) -> Result<ClusterProfile, ConfigError> {
        self.cluster.parse()
    }

    /// Wall time decomposed into hours, minutes and seconds.
    #[must_use]
    pub fn wall_time_hms(&self) -> (u64, u64, u64) {
        let (minutes, seconds) = (self.wall_time / 60, self.wall_time % 60);
        (minutes / 60, minutes % 60, seconds)
    }
}

fn default_jobdir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_comment() -> char {
    '#'
}

fn default_metachar() -> char {
    '¤'
}

fn default_name() -> String {
    "job".to_string()
}

fn default_cluster() -> String {
    ClusterProfile::Abel.to_string()
}

fn default_account() -> String {
    "uio".to_string()
}

fn default_wall_time() -> u64 {
    24 * 60 * 60
}

fn default_mem_per_cpu() -> String {
    "3600M".to_string()
}

fn default_cpus_per_task() -> u32 {
    16
}

impl HarnessConfig {
    /// Load and validate a job file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        let config = Self::parse(&content)?;
        tracing::debug!("Loaded job file {}", path.as_ref().display());
        Ok(config)
    }

    /// Load `path`, or [`DEFAULT_JOB_FILE`] if it exists, or fall back to
    /// defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_JOB_FILE).is_file() => Self::load(DEFAULT_JOB_FILE),
            None => {
                tracing::debug!("No {DEFAULT_JOB_FILE}, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse and validate job file contents.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        // Fail fast, before anything is staged
        config.job.profile()?;
        Ok(config)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read job file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse job file: {0}")]
    Parse(String),
    #[error("cluster not recognized: {0}")]
    UnknownProfile(String),
}
