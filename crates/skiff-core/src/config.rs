//! Transfer configuration and command-line construction
//!
//! [`TransferTarget`] is the persisted user intent for one destination.
//! Every attempt turns it into a fresh, immutable [`TransferConfig`] (the
//! target plus the credential looked up for that attempt), which in turn
//! renders the [`CommandSpec`] handed to the process launcher. Retries
//! rebuild the config from the same target; nothing is mutated in between.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, SessionError};

/// Remote endpoint reached over ssh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,

    /// Login name; empty means the ssh default
    #[serde(default)]
    pub username: String,

    /// ssh port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint on the default ssh port
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: default_port(),
        }
    }

    /// rsync remote path syntax: `user@host:path`
    #[must_use]
    pub fn remote_spec(&self, path: &str) -> String {
        if self.username.is_empty() {
            format!("{}:{}", self.host, path)
        } else {
            format!("{}@{}:{}", self.username, self.host, path)
        }
    }
}

/// Transfer direction relative to the local machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local to remote
    #[default]
    Push,
    /// Remote to local
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

/// Boolean transfer options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFlags {
    /// Report what would change without changing it
    #[serde(default)]
    pub dry_run: bool,

    /// Send whole files instead of deltas (faster on fast links)
    #[serde(default)]
    pub whole_file: bool,

    /// Delete destination files missing from the source
    #[serde(default)]
    pub delete_extraneous: bool,

    /// Keep partially transferred files so a retry can resume
    #[serde(default)]
    pub resume_partial: bool,

    /// Refuse unknown or changed host keys
    #[serde(default = "default_true")]
    pub strict_host_key_check: bool,
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self {
            dry_run: false,
            whole_file: false,
            delete_extraneous: false,
            resume_partial: false,
            strict_host_key_check: true,
        }
    }
}

/// Paths of the external executables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// rsync binary
    #[serde(default = "default_rsync")]
    pub rsync: String,

    /// ssh binary used as rsync's remote shell
    #[serde(default = "default_ssh")]
    pub ssh: String,

    /// sshpass binary, used only when a password is supplied
    #[serde(default = "default_sshpass")]
    pub sshpass: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rsync: default_rsync(),
            ssh: default_ssh(),
            sshpass: default_sshpass(),
        }
    }
}

/// Persisted description of one transfer destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTarget {
    /// Remote endpoint
    pub endpoint: Endpoint,

    /// Local file or directory
    pub local_path: PathBuf,

    /// Remote file or directory
    pub remote_path: String,

    /// Push or pull
    #[serde(default)]
    pub direction: Direction,

    /// Pre-built filter tokens (`--exclude=*.tmp`, ...), passed in order
    #[serde(default)]
    pub filters: Vec<String>,

    /// Boolean options
    #[serde(default)]
    pub flags: TransferFlags,

    /// Bandwidth cap in KiB/s, 0 = unlimited
    #[serde(default)]
    pub bandwidth_limit_kbps: u32,

    /// File receiving the raw output of every attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// ssh connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u32,
}

impl TransferTarget {
    /// Create a push target with default options
    pub fn new(
        endpoint: Endpoint,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction: Direction::Push,
            filters: Vec::new(),
            flags: TransferFlags::default(),
            bandwidth_limit_kbps: 0,
            log_file: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Filters as a single descriptor for history records
    #[must_use]
    pub fn filter_descriptor(&self) -> String {
        self.filters.join(" ")
    }

    /// Validate the target before any attempt is made
    pub fn validate(&self) -> Result<()> {
        let host = &self.endpoint.host;
        if host.is_empty() {
            return Err(SessionError::invalid_config("endpoint host is empty"));
        }
        if host.chars().any(char::is_whitespace) || host.starts_with('-') {
            return Err(SessionError::InvalidConfig(
                format!("endpoint host '{host}' is not a valid host name").into(),
            ));
        }
        if self.endpoint.port == 0 {
            return Err(SessionError::invalid_config("endpoint port must not be 0"));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(SessionError::invalid_config("local path is empty"));
        }
        if self.remote_path.is_empty() {
            return Err(SessionError::invalid_config("remote path is empty"));
        }
        if self.filters.iter().any(|f| f.trim().is_empty()) {
            return Err(SessionError::invalid_config("filter tokens must not be blank"));
        }
        Ok(())
    }
}

/// Immutable per-attempt configuration
#[derive(Clone)]
pub struct TransferConfig {
    target: TransferTarget,
    credential: Zeroizing<String>,
}

impl TransferConfig {
    /// Bind a target to the credential fetched for this attempt
    ///
    /// An empty credential means key or agent authentication.
    pub fn new(target: &TransferTarget, credential: String) -> Self {
        Self {
            target: target.clone(),
            credential: Zeroizing::new(credential),
        }
    }

    /// The target this attempt was built from
    #[must_use]
    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    /// Whether password authentication is used
    #[must_use]
    pub fn has_credential(&self) -> bool {
        !self.credential.is_empty()
    }

    /// Render the command line for this attempt
    #[must_use]
    pub fn command(&self, tools: &ToolPaths) -> CommandSpec {
        let target = &self.target;
        let flags = &target.flags;

        let mut args: Vec<String> = vec!["-a".into(), "-v".into(), "--progress".into()];
        if flags.dry_run {
            args.push("--dry-run".into());
        }
        if flags.whole_file {
            args.push("--whole-file".into());
        }
        if flags.delete_extraneous {
            args.push("--delete".into());
        }
        if flags.resume_partial {
            args.push("--partial".into());
        }
        if target.bandwidth_limit_kbps > 0 {
            args.push(format!("--bwlimit={}", target.bandwidth_limit_kbps));
        }

        args.push("-e".into());
        args.push(self.remote_shell(tools));
        args.extend(target.filters.iter().cloned());

        let local = target.local_path.to_string_lossy().into_owned();
        let remote = target.endpoint.remote_spec(&target.remote_path);
        match target.direction {
            Direction::Push => {
                args.push(local);
                args.push(remote);
            }
            Direction::Pull => {
                args.push(remote);
                args.push(local);
            }
        }

        let mut env = BTreeMap::new();
        env.insert("LC_ALL".to_string(), Zeroizing::new("C".to_string()));

        if self.has_credential() {
            env.insert("SSHPASS".to_string(), self.credential.clone());
            let mut wrapped = vec!["-e".to_string(), tools.rsync.clone()];
            wrapped.extend(args);
            CommandSpec {
                program: tools.sshpass.clone(),
                args: wrapped,
                env,
            }
        } else {
            CommandSpec {
                program: tools.rsync.clone(),
                args,
                env,
            }
        }
    }

    fn remote_shell(&self, tools: &ToolPaths) -> String {
        let target = &self.target;
        let strict = if target.flags.strict_host_key_check {
            "yes"
        } else {
            "no"
        };
        let mut shell = format!(
            "{} -p {} -o StrictHostKeyChecking={} -o ConnectTimeout={}",
            tools.ssh, target.endpoint.port, strict, target.connect_timeout_secs
        );
        if !self.has_credential() {
            // Never block on an interactive password prompt
            shell.push_str(" -o BatchMode=yes");
        }
        shell
    }
}

impl fmt::Debug for TransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferConfig")
            .field("target", &self.target)
            .field("credential", &if self.has_credential() { "<set>" } else { "<empty>" })
            .finish()
    }
}

/// Fully resolved process invocation
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Extra environment variables, wiped when the spec is dropped
    pub env: BTreeMap<String, Zeroizing<String>>,
}

impl CommandSpec {
    /// Create a command without extra environment
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Shell-like rendering for logs; environment values are never shown
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("'{arg}'")
                } else {
                    arg.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

// Default values

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u32 {
    30
}

fn default_rsync() -> String {
    "rsync".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_sshpass() -> String {
    "sshpass".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TransferTarget {
        TransferTarget::new(Endpoint::new("nas.local", "backup"), "/home/me/photos/", "/srv/photos")
    }

    #[test]
    fn test_push_command_key_auth() {
        let config = TransferConfig::new(&target(), String::new());
        let spec = config.command(&ToolPaths::default());

        assert_eq!(spec.program, "rsync");
        assert_eq!(&spec.args[..3], &["-a", "-v", "--progress"]);
        assert_eq!(spec.args[3], "-e");
        assert_eq!(
            spec.args[4],
            "ssh -p 22 -o StrictHostKeyChecking=yes -o ConnectTimeout=30 -o BatchMode=yes"
        );
        assert_eq!(spec.args[5], "/home/me/photos/");
        assert_eq!(spec.args[6], "backup@nas.local:/srv/photos");
        assert_eq!(spec.env.get("LC_ALL").map(|v| v.as_str()), Some("C"));
        assert!(!spec.env.contains_key("SSHPASS"));
    }

    #[test]
    fn test_pull_command_with_flags_and_filters() {
        let mut target = target();
        target.direction = Direction::Pull;
        target.filters = vec!["--exclude=*.tmp".into(), "--include=*.jpg".into()];
        target.flags = TransferFlags {
            dry_run: true,
            whole_file: true,
            delete_extraneous: true,
            resume_partial: true,
            strict_host_key_check: false,
        };
        target.bandwidth_limit_kbps = 512;
        target.endpoint.port = 2222;

        let spec = TransferConfig::new(&target, String::new()).command(&ToolPaths::default());
        let args = &spec.args;

        for flag in ["--dry-run", "--whole-file", "--delete", "--partial", "--bwlimit=512"] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        assert!(args.iter().any(|a| a.contains("-p 2222") && a.contains("StrictHostKeyChecking=no")));

        let n = args.len();
        assert_eq!(args[n - 4], "--exclude=*.tmp");
        assert_eq!(args[n - 3], "--include=*.jpg");
        assert_eq!(args[n - 2], "backup@nas.local:/srv/photos");
        assert_eq!(args[n - 1], "/home/me/photos/");
    }

    #[test]
    fn test_password_wraps_with_sshpass() {
        let config = TransferConfig::new(&target(), "hunter2".to_string());
        let spec = config.command(&ToolPaths::default());

        assert_eq!(spec.program, "sshpass");
        assert_eq!(&spec.args[..2], &["-e", "rsync"]);
        assert_eq!(spec.env.get("SSHPASS").map(|v| v.as_str()), Some("hunter2"));
        assert!(!spec.display().contains("hunter2"));
        assert!(!spec.args.iter().any(|a| a.contains("BatchMode")));
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(!format!("{spec:?}").contains("hunter2"));
    }

    #[test]
    fn test_password_in_spec_stays_zeroizing() {
        let config = TransferConfig::new(&target(), "hunter2".to_string());
        let mut spec = config.command(&ToolPaths::default());
        drop(config);

        let secret: &mut Zeroizing<String> = spec.env.get_mut("SSHPASS").unwrap();
        assert_eq!(secret.as_str(), "hunter2");

        // What the wrapper runs on drop
        zeroize::Zeroize::zeroize(&mut **secret);
        assert!(spec.env["SSHPASS"].is_empty());
        assert_eq!(spec.env["LC_ALL"].as_str(), "C");
    }

    #[test]
    fn test_remote_spec_without_username() {
        let endpoint = Endpoint::new("nas.local", "");
        assert_eq!(endpoint.remote_spec("/srv"), "nas.local:/srv");
    }

    #[test]
    fn test_display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("rsync", ["-e", "ssh -p 22", "a b", "c"]);
        assert_eq!(spec.display(), "rsync -e 'ssh -p 22' 'a b' c");
    }

    #[test]
    fn test_validate() {
        assert!(target().validate().is_ok());

        let mut bad = target();
        bad.endpoint.host = String::new();
        assert!(bad.validate().is_err());

        let mut bad = target();
        bad.endpoint.host = "-oProxyCommand=x".into();
        assert!(bad.validate().is_err());

        let mut bad = target();
        bad.remote_path = String::new();
        assert!(bad.validate().is_err());

        let mut bad = target();
        bad.filters = vec!["  ".into()];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_target_serde_defaults() {
        let json = r#"{
            "endpoint": { "host": "nas.local" },
            "local_path": "/data",
            "remote_path": "/backup"
        }"#;
        let target: TransferTarget = serde_json::from_str(json).unwrap();
        assert_eq!(target.endpoint.port, 22);
        assert_eq!(target.direction, Direction::Push);
        assert!(target.flags.strict_host_key_check);
        assert_eq!(target.connect_timeout_secs, 30);
        assert_eq!(target.filter_descriptor(), "");
    }
}
