//! Layered configuration for depotsync.
//!
//! Sources are merged in order, later sources winning:
//!
//! 1. Built-in defaults.
//! 2. `depotsync.{toml,yaml,json}` in the platform configuration directory.
//! 3. An explicit file (format picked from its extension).
//! 4. `DEPOTSYNC_*` environment variables (e.g. `DEPOTSYNC_RETRY_COUNT=5`).

pub mod error;
pub mod tickets;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::tickets::{ServerInfo, Servers};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APPLICATION: &str = "depotsync";
const ENV_PREFIX: &str = "DEPOTSYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retries after the first attempt of every remote operation.
    pub retry_count: u32,
    /// Initial per-attempt timeout for interrogation commands.
    pub command_timeout_seconds: u64,
    /// Cap on the linear timeout escalation between attempts.
    pub max_attempt_multiplier: u32,
    /// Sync and submit commands start at this multiple of the interrogation
    /// timeout.
    pub sync_timeout_multiplier: u32,
    /// Directory depth at which discovery switches from `*` to `...`.
    pub folder_recursion_depth: usize,
    pub max_files_per_chunk: usize,
    pub max_chunk_size_kb: u64,
    /// How many changelists to list when browsing history or pending work.
    pub changes_to_receive: usize,
    /// Where `.revisions` and `.reconcile` artifacts live. Defaults to the
    /// platform data directory.
    pub settings_dir: Option<PathBuf>,
    pub server: Option<String>,
    pub user: Option<String>,
    pub workspace: Option<String>,
    /// Ticket file used to look up a ticket for `server`/`user`.
    pub tickets_file: Option<PathBuf>,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            retry_count: 3,
            command_timeout_seconds: 30,
            max_attempt_multiplier: 5,
            sync_timeout_multiplier: 6,
            folder_recursion_depth: 2,
            max_files_per_chunk: 100,
            max_chunk_size_kb: 50_000,
            changes_to_receive: 300,
            settings_dir: None,
            server: None,
            user: None,
            workspace: None,
            tickets_file: None,
        }
    }
}

impl Config {
    /// Load configuration from every source, validating the result.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(explicit)?)
    }

    /// The merged (but not yet extracted) configuration sources.
    pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(dirs) = ProjectDirs::from("", "", APPLICATION) {
            let dir = dirs.config_dir();
            tracing::debug!(dir = %dir.display(), "Looking for configuration files");
            figment = figment
                .merge(Toml::file(dir.join("depotsync.toml")))
                .merge(Yaml::file(dir.join("depotsync.yaml")))
                .merge(Json::file(dir.join("depotsync.json")));
        }
        if let Some(path) = explicit {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_seconds == 0 {
            exn::bail!(ErrorKind::Invalid("command_timeout_seconds"));
        }
        if self.max_attempt_multiplier < 1 {
            exn::bail!(ErrorKind::Invalid("max_attempt_multiplier"));
        }
        if self.sync_timeout_multiplier < 1 {
            exn::bail!(ErrorKind::Invalid("sync_timeout_multiplier"));
        }
        if self.folder_recursion_depth == 0 {
            exn::bail!(ErrorKind::Invalid("folder_recursion_depth"));
        }
        if self.max_files_per_chunk == 0 {
            exn::bail!(ErrorKind::Invalid("max_files_per_chunk"));
        }
        if self.max_chunk_size_kb == 0 {
            exn::bail!(ErrorKind::Invalid("max_chunk_size_kb"));
        }
        if self.changes_to_receive == 0 {
            exn::bail!(ErrorKind::Invalid("changes_to_receive"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// The configured artifact directory, or the platform data directory, or
    /// the current directory as a last resort.
    pub fn settings_dir(&self) -> PathBuf {
        if let Some(dir) = &self.settings_dir {
            return dir.clone();
        }
        ProjectDirs::from("", "", APPLICATION)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// The ticket file to consult: configured, or `p4tickets.txt` in the home
    /// directory.
    pub fn tickets_file(&self) -> Option<PathBuf> {
        self.tickets_file
            .clone()
            .or_else(|| directories::BaseDirs::new().map(|dirs| dirs.home_dir().join("p4tickets.txt")))
    }

    /// Ticket for the configured server and user, from the ticket file.
    /// Empty when either is unset or no ticket is stored.
    pub fn ticket(&self) -> Result<String> {
        let (Some(server), Some(user), Some(file)) = (&self.server, &self.user, self.tickets_file()) else {
            return Ok(String::new());
        };
        Ok(Servers::from_file(file)?.ticket_for(server, user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use std::ops::Deref;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_files_per_chunk, 100);
        assert_eq!(config.max_chunk_size_kb, 50_000);
    }

    #[rstest]
    #[case("max_files_per_chunk = 0", "max_files_per_chunk")]
    #[case("max_chunk_size_kb = 0", "max_chunk_size_kb")]
    #[case("max_attempt_multiplier = 0", "max_attempt_multiplier")]
    #[case("command_timeout_seconds = 0", "command_timeout_seconds")]
    fn test_invalid_values_rejected(#[case] toml: &str, #[case] field: &str) {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml));
        let err = Config::from_figment(figment).unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::Invalid(f) if *f == field));
    }

    #[test]
    fn test_explicit_file_and_environment_layering() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "retry_count = 7\nmax_files_per_chunk = 10\nuser = \"alice\"")?;
            jail.set_env("DEPOTSYNC_MAX_FILES_PER_CHUNK", "25");
            let config = Config::load(Some(Path::new("custom.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.retry_count, 7);
            assert_eq!(config.max_files_per_chunk, 25);
            assert_eq!(config.user.as_deref(), Some("alice"));
            assert_eq!(config.sync_timeout_multiplier, 6);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_ticket_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("p4tickets.txt");
        std::fs::write(&file, "perforce:1666=alice:0123456789ABCDEF0123456789ABCDEF\n").unwrap();
        let config = Config {
            server: Some("perforce:1666".into()),
            user: Some("Alice".into()),
            tickets_file: Some(file),
            ..Config::default()
        };
        assert_eq!(config.ticket().unwrap(), "0123456789ABCDEF0123456789ABCDEF");
        assert_eq!(Config { user: None, ..config }.ticket().unwrap(), "");
    }

    #[test]
    fn test_explicit_settings_dir() {
        let config = Config { settings_dir: Some(PathBuf::from("/tmp/depotsync")), ..Config::default() };
        assert_eq!(config.settings_dir(), Path::new("/tmp/depotsync"));
    }
}
