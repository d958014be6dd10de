//! Configuration file for the Skiff CLI.

use serde::{Deserialize, Serialize};
use skiff_core::{
    Endpoint, NetworkOptions, RetryPolicy, Schedule, SessionOptions, TimeOfDay, ToolPaths,
    TransferTarget,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Skiff configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// External executables
    #[serde(default)]
    pub rsync: ToolPaths,
    /// Retry policy shared by all profiles
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Connectivity watching (daemon mode)
    #[serde(default)]
    pub network: NetworkOptions,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Transfer history
    #[serde(default)]
    pub history: HistoryConfig,
    /// Named transfer profiles
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// History configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Record finished transfers
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSON-lines history file
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

/// A named transfer with optional extra destinations and schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique name used on the command line
    pub name: String,
    /// Primary destination
    pub target: TransferTarget,
    /// Further hosts receiving the same paths, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_destinations: Vec<Endpoint>,
    /// Recurrence for daemon mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl Profile {
    /// Every destination of the profile, primary first
    #[must_use]
    pub fn targets(&self) -> Vec<TransferTarget> {
        let mut targets = Vec::with_capacity(1 + self.extra_destinations.len());
        targets.push(self.target.clone());
        for endpoint in &self.extra_destinations {
            let mut target = self.target.clone();
            target.endpoint = endpoint.clone();
            targets.push(target);
        }
        targets
    }
}

// Default values

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("skiff/history.jsonl")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_history_path(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("skiff/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Default configuration plus one example profile
    #[must_use]
    pub fn example() -> Self {
        let mut target = TransferTarget::new(
            Endpoint::new("nas.local", "backup"),
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/home"))
                .join("Documents"),
            "/volume1/backup/documents",
        );
        target.filters = vec!["--exclude=*.tmp".to_string()];
        target.flags.resume_partial = true;

        let schedule = TimeOfDay::new(2, 30).ok().map(Schedule::daily);

        Self {
            profiles: vec![Profile {
                name: "documents".to_string(),
                target,
                extra_destinations: Vec::new(),
                schedule,
            }],
            ..Self::default()
        }
    }

    /// Look up a profile by name
    ///
    /// # Errors
    ///
    /// Returns an error if no profile has that name.
    pub fn profile(&self, name: &str) -> anyhow::Result<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                let known: Vec<&str> = self.profiles.iter().map(|p| p.name.as_str()).collect();
                if known.is_empty() {
                    anyhow::anyhow!("Unknown profile '{name}' (no profiles configured)")
                } else {
                    anyhow::anyhow!("Unknown profile '{name}'. Known: {}", known.join(", "))
                }
            })
    }

    /// Session options derived from the global sections
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            tools: self.rsync.clone(),
            retry: self.retry,
            ..SessionOptions::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.retry.validate()?;

        if self.network.probe_interval_secs == 0 || self.network.probe_timeout_secs == 0 {
            anyhow::bail!("Network probe interval and timeout must be at least 1 second");
        }

        for tool in [&self.rsync.rsync, &self.rsync.ssh, &self.rsync.sshpass] {
            if tool.trim().is_empty() {
                anyhow::bail!("Tool paths in [rsync] must not be empty");
            }
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                anyhow::bail!("Profile names must not be empty");
            }
            if !names.insert(profile.name.as_str()) {
                anyhow::bail!("Duplicate profile name: {}", profile.name);
            }
            for target in profile.targets() {
                target.validate().map_err(|e| {
                    anyhow::anyhow!("Profile '{}' ({}): {e}", profile.name, target.endpoint.host)
                })?;
            }
            if let Some(schedule) = &profile.schedule {
                schedule
                    .validate()
                    .map_err(|e| anyhow::anyhow!("Profile '{}' schedule: {e}", profile.name))?;
            }
        }

        Ok(())
    }
}
