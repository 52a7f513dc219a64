//! Configuration management for webd.
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_yaml::Value;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};

use crate::{
    address::BindAddress,
    constants::{
        DEFAULT_ARGS, DEFAULT_CONFIG_FILE, DEFAULT_HOST, DEFAULT_KILL_TIMEOUT, DEFAULT_PORT,
        DEFAULT_PROGRAM, DEFAULT_STOP_TIMEOUT, DEFAULT_TARGET, DEFAULT_UMASK,
        DEFAULT_WORKING_DIRECTORY, DEV_NULL, POLL_INTERVAL, SYSTEM_PIDFILE, USER_PIDFILE,
    },
    daemonize::StreamRedirection,
    error::{AddressError, ConfigError},
    workload::WorkloadDescriptor,
};

/// What `stop` does when the daemon outlives the graceful shutdown budget.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Escalate to SIGKILL.
    #[default]
    Kill,
    /// Report a shutdown timeout and leave the process and pidfile in place.
    Fail,
}

/// What `start` does with a pidfile whose process is gone.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StalePolicy {
    /// Remove the stale pidfile and start.
    #[default]
    Reclaim,
    /// Refuse to start until an operator removes the pidfile.
    Refuse,
}

/// A value written either as a YAML number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    fn text(&self) -> String {
        match self {
            NumberOrString::Number(value) => value.to_string(),
            NumberOrString::Text(value) => value.clone(),
        }
    }
}

/// Timing and escalation rules for `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Budget for the process to honour SIGTERM.
    pub stop_timeout: Duration,
    /// Budget for the process to disappear after SIGKILL.
    pub kill_timeout: Duration,
    /// Behaviour once `stop_timeout` elapses.
    pub on_timeout: TimeoutPolicy,
    /// Interval between liveness probes.
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            on_timeout: TimeoutPolicy::default(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application the server loads.
    pub target: String,
    /// Host the server binds to.
    pub host: String,
    /// Port the server binds to.
    pub port: NumberOrString,
    /// Server program.
    pub program: String,
    /// Argument template for the server program.
    pub args: Vec<String>,
    /// Pidfile location; see [`default_pidfile`] when unset.
    pub pidfile: Option<PathBuf>,
    /// Target for the daemon's stdin.
    pub stdin: PathBuf,
    /// Target for the daemon's stdout.
    pub stdout: PathBuf,
    /// Target for the daemon's stderr.
    pub stderr: PathBuf,
    /// Truncate output targets instead of appending.
    pub overwrite_output: bool,
    /// Working directory of the daemon.
    pub working_directory: PathBuf,
    /// File-creation mask of the daemon. Strings are read as octal.
    pub umask: NumberOrString,
    /// Graceful shutdown budget, e.g. `10s`.
    pub stop_timeout: String,
    /// Budget after SIGKILL, e.g. `5s`.
    pub kill_timeout: String,
    /// Behaviour when the graceful budget elapses.
    pub on_timeout: TimeoutPolicy,
    /// Behaviour when `start` finds a stale pidfile.
    pub stale_pidfile: StalePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: NumberOrString::Number(u64::from(DEFAULT_PORT)),
            program: DEFAULT_PROGRAM.to_string(),
            args: DEFAULT_ARGS.iter().map(|arg| arg.to_string()).collect(),
            pidfile: None,
            stdin: PathBuf::from(DEV_NULL),
            stdout: PathBuf::from(DEV_NULL),
            stderr: PathBuf::from(DEV_NULL),
            overwrite_output: false,
            working_directory: PathBuf::from(DEFAULT_WORKING_DIRECTORY),
            umask: NumberOrString::Text(format!("{DEFAULT_UMASK:o}")),
            stop_timeout: format!("{}s", DEFAULT_STOP_TIMEOUT.as_secs()),
            kill_timeout: format!("{}s", DEFAULT_KILL_TIMEOUT.as_secs()),
            on_timeout: TimeoutPolicy::default(),
            stale_pidfile: StalePolicy::default(),
        }
    }
}

impl Config {
    /// Pidfile path, falling back to [`default_pidfile`].
    pub fn pidfile(&self) -> PathBuf {
        self.pidfile.clone().unwrap_or_else(default_pidfile)
    }

    /// Validates the configured host and port.
    pub fn bind(&self) -> Result<BindAddress, AddressError> {
        BindAddress::parse(&self.host, &self.port.text())
    }

    /// Validates the bind address and builds the workload descriptor.
    pub fn descriptor(&self) -> Result<WorkloadDescriptor, AddressError> {
        Ok(WorkloadDescriptor::new(self.target.clone(), &self.bind()?))
    }

    /// Stream targets for the daemon.
    pub fn streams(&self) -> StreamRedirection {
        StreamRedirection {
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            overwrite_output: self.overwrite_output,
        }
    }

    /// Parsed file-creation mask.
    pub fn umask(&self) -> Result<u32, ConfigError> {
        let invalid = || ConfigError::Umask {
            value: self.umask.text(),
        };
        let mask = match &self.umask {
            NumberOrString::Number(value) => u32::try_from(*value).map_err(|_| invalid())?,
            NumberOrString::Text(text) => {
                let digits = text.trim();
                let digits = digits.strip_prefix("0o").unwrap_or(digits);
                u32::from_str_radix(digits, 8).map_err(|_| invalid())?
            }
        };
        if mask > 0o777 {
            return Err(invalid());
        }
        Ok(mask)
    }

    /// Parsed shutdown timings.
    pub fn shutdown_policy(&self) -> Result<ShutdownPolicy, ConfigError> {
        Ok(ShutdownPolicy {
            stop_timeout: parse_duration(&self.stop_timeout)?,
            kill_timeout: parse_duration(&self.kill_timeout)?,
            on_timeout: self.on_timeout,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Makes every relative path absolute against `base`.
    ///
    /// The daemon changes directory before it opens its streams or writes the pidfile, so
    /// relative paths must be pinned while the operator's directory is still known.
    pub fn resolve_paths(&mut self, base: &Path) {
        let absolute = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        if let Some(pidfile) = self.pidfile.as_mut() {
            absolute(pidfile);
        }
        absolute(&mut self.stdin);
        absolute(&mut self.stdout);
        absolute(&mut self.stderr);
        absolute(&mut self.working_directory);
    }
}

/// Default pidfile: a system path for root, otherwise under `$HOME`.
pub fn default_pidfile() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(SYSTEM_PIDFILE);
    }

    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(USER_PIDFILE))
        .unwrap_or_else(|| env::temp_dir().join("webd.pid"))
}

/// Parses a duration in the format `<number>[ms|s|m|h]`; a bare number means seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Duration {
        value: raw.to_string(),
    };
    let value = raw.trim();
    if value.is_empty() {
        return Err(invalid());
    }

    if let Some(millis) = value.strip_suffix("ms") {
        let amount: u64 = millis.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("environment variable pattern is valid")
});

/// Expands `${VAR}` and `$VAR` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_VAR.replace_all(input, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        env::var(name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar { name }),
        None => Ok(expanded.into_owned()),
    }
}

/// Expands environment variables in every string value of a parsed document.
///
/// Keys, comments and non-string scalars are left alone.
fn expand_values(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(text) => *text = expand_env_vars(text)?,
        Value::Sequence(items) => {
            for item in items {
                expand_values(item)?;
            }
        }
        Value::Mapping(entries) => {
            for (_, item) in entries.iter_mut() {
                expand_values(item)?;
            }
        }
        Value::Tagged(tagged) => expand_values(&mut tagged.value)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// With no explicit path, `webd.yaml` in the current directory is used when present and
/// built-in defaults otherwise. Relative paths are resolved against the file's directory.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let cwd = env::current_dir().map_err(ConfigError::CurrentDir)?;
    let config_path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()),
    };

    let Some(config_path) = config_path else {
        let mut config = Config::default();
        config.resolve_paths(&cwd);
        return Ok(config);
    };

    let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let mut document: Value = serde_yaml::from_str(&content)?;
    expand_values(&mut document)?;
    let mut config: Config = match document {
        Value::Null => Config::default(),
        document => serde_yaml::from_value(document)?,
    };

    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    };
    config.resolve_paths(&base);

    Ok(config)
}
