//! Configuration for a backup run.
//!
//! Loaded once from a JSON settings file, validated, then shared read-only
//! by every pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::process::{RetryPolicy, MAX_RETRIES};
use crate::utils::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote-shell binary
    #[serde(default = "default_ssh")]
    pub ssh: String,

    /// Delta-transfer binary
    #[serde(default = "default_rsync")]
    pub rsync: String,

    /// Exclude patterns applied to every backup set
    #[serde(default)]
    pub excludes: Vec<ExcludeRule>,

    #[serde(flatten)]
    pub smtp: SmtpConfig,

    pub backuptargets: Vec<BackupTarget>,

    pub backupsets: Vec<BackupSetConfig>,

    /// Timeout in seconds for each remote shell call (none by default)
    #[serde(default)]
    pub commandtimeout: Option<u64>,

    /// Timeout in seconds for each rsync transfer (none by default)
    #[serde(default)]
    pub transfertimeout: Option<u64>,

    /// Extra attempts for a failed external call (0 = no retries)
    #[serde(default)]
    pub retries: u32,

    /// Initial retry backoff in seconds, doubled per attempt
    #[serde(default = "default_retry_backoff")]
    pub retrybackoff: u64,

    /// Maximum pipelines running at once across all targets
    #[serde(default = "default_parallelism")]
    pub maxparallel: usize,

    /// Maximum pipelines running at once against one target
    #[serde(default = "default_parallelism")]
    pub maxpertarget: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub smtpserver: String,
    pub smtpport: u16,
    pub smtpuser: String,
    pub smtppassword: String,
    pub smtpfrom: String,
    pub smtpto: String,
}

/// A remote host that receives snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub address: String,
    pub user: String,
    pub port: u16,
    /// Private key passed to ssh with `-i`
    pub key: PathBuf,
}

impl BackupTarget {
    /// `user@address`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeRule {
    pub exclude: String,
}

/// A backup set as written in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSetConfig {
    pub localdir: PathBuf,
    pub remotedir: String,
    #[serde(default)]
    pub excludes: Vec<ExcludeRule>,
    /// `<int><y|w|d|h|m>`
    #[serde(default)]
    pub retention: Option<String>,
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_rsync() -> String {
    "rsync".to_string()
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_parallelism() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load, normalize and validate a JSON settings file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for set in &mut self.backupsets {
            let trimmed = set.remotedir.trim_end_matches('/');
            if !trimmed.is_empty() {
                set.remotedir = trimmed.to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.ssh.trim().is_empty() {
            return invalid("ssh binary path is empty".into());
        }
        if self.rsync.trim().is_empty() {
            return invalid("rsync binary path is empty".into());
        }
        if self.backuptargets.is_empty() {
            return invalid("no backuptargets configured".into());
        }
        if self.backupsets.is_empty() {
            return invalid("no backupsets configured".into());
        }

        for (i, target) in self.backuptargets.iter().enumerate() {
            if target.address.trim().is_empty() {
                return invalid(format!("backuptargets[{i}]: address is empty"));
            }
            if target.user.trim().is_empty() {
                return invalid(format!("backuptargets[{i}]: user is empty"));
            }
            if target.port == 0 {
                return invalid(format!("backuptargets[{i}]: port must be non-zero"));
            }
        }

        let mut seen = HashSet::new();
        for (i, set) in self.backupsets.iter().enumerate() {
            if set.remotedir.is_empty() {
                return invalid(format!("backupsets[{i}]: remotedir is empty"));
            }
            if set.remotedir == "/" {
                return invalid(format!("backupsets[{i}]: remotedir must not be the filesystem root"));
            }
            if set.localdir.as_os_str().is_empty() {
                return invalid(format!("backupsets[{i}]: localdir is empty"));
            }
            if !seen.insert(set.remotedir.as_str()) {
                return invalid(format!(
                    "backupsets[{i}]: remotedir {} is used by more than one backup set",
                    set.remotedir
                ));
            }
        }

        if self.retries > MAX_RETRIES {
            return invalid(format!("retries must be at most {MAX_RETRIES}"));
        }
        if self.maxparallel == 0 || self.maxpertarget == 0 {
            return invalid("maxparallel and maxpertarget must be at least 1".into());
        }

        Ok(())
    }

    /// Global exclude patterns, in file order.
    pub fn global_excludes(&self) -> impl Iterator<Item = &str> {
        self.excludes.iter().map(|e| e.exclude.as_str())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.commandtimeout.map(Duration::from_secs)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfertimeout.map(Duration::from_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retrybackoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "smtpserver": "smtp.example.net", "smtpport": 465,
        "smtpuser": "u", "smtppassword": "p",
        "smtpfrom": "backup@example.net", "smtpto": "ops@example.net",
        "backuptargets": [ { "address": "nas", "user": "backup", "port": 22, "key": "/root/.ssh/id" } ],
        "backupsets": [ { "localdir": "/home", "remotedir": "/srv/home/" } ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.ssh, "ssh");
        assert_eq!(config.rsync, "rsync");
        assert!(config.excludes.is_empty());
        assert_eq!(config.retries, 0);
        assert_eq!(config.maxparallel, 1);
        assert_eq!(config.maxpertarget, 1);
        assert_eq!(config.command_timeout(), None);
        assert_eq!(config.loglevel, "info");
        assert_eq!(config.backupsets[0].retention, None);
        assert_eq!(config.smtp.smtpport, 465);
    }

    #[test]
    fn test_remotedir_trailing_slash_stripped() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.backupsets[0].remotedir, "/srv/home");
    }

    #[test]
    fn test_full_settings() {
        let json = r#"{
            "ssh": "/usr/bin/ssh", "rsync": "/usr/local/bin/rsync",
            "excludes": [ { "exclude": "*.swp" } ],
            "smtpserver": "smtp", "smtpport": 465, "smtpuser": "u", "smtppassword": "p",
            "smtpfrom": "a@b", "smtpto": "c@d",
            "backuptargets": [
                { "address": "nas1", "user": "backup", "port": 22, "key": "/k1" },
                { "address": "nas2", "user": "backup", "port": 2222, "key": "/k2" }
            ],
            "backupsets": [
                { "localdir": "/home", "remotedir": "/srv/home",
                  "excludes": [ { "exclude": ".cache" } ], "retention": "8w" }
            ],
            "commandtimeout": 60, "retries": 2, "maxparallel": 4, "maxpertarget": 2
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.ssh, "/usr/bin/ssh");
        assert_eq!(config.global_excludes().collect::<Vec<_>>(), vec!["*.swp"]);
        assert_eq!(config.backuptargets[1].destination(), "backup@nas2");
        assert_eq!(config.backupsets[0].retention.as_deref(), Some("8w"));
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.retry_policy().retries, 2);
    }

    #[test]
    fn test_missing_required_field() {
        let json = MINIMAL.replace(r#""smtpserver": "smtp.example.net","#, "");
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_duplicate_remotedir_rejected() {
        let json = MINIMAL.replace(
            r#""backupsets": [ { "localdir": "/home", "remotedir": "/srv/home/" } ]"#,
            r#""backupsets": [ { "localdir": "/home", "remotedir": "/srv/home" },
                              { "localdir": "/etc", "remotedir": "/srv/home/" } ]"#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_root_remotedir_rejected() {
        let json = MINIMAL.replace(r#""remotedir": "/srv/home/""#, r#""remotedir": "/""#);
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_too_many_retries_rejected() {
        let json = MINIMAL.replacen('{', r#"{ "retries": 9,"#, 1);
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.backuptargets[0].address, "nas");
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/snapback.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_unparseable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        match Config::from_file(file.path()).unwrap_err() {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
