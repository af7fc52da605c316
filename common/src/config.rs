//! Collection configuration: servers, directories and engine settings
//!
//! The configuration file is TOML. Every table rejects unknown keys and every optional key has an
//! explicit default, so a typo is reported at load time rather than silently ignored.
//!
//! ```toml
//! [settings]
//! default_download_path = "./downloads"
//! max_concurrent_transfers = 2
//!
//! [[servers]]
//! name = "web-1"
//! host = "10.0.0.1"
//! username = "ops"
//! key_file = "~/.ssh/id_ed25519"
//!
//! [[directories]]
//! name = "nginx"
//! server = "web-1"
//! path = "/var/log/nginx"
//! file_pattern = "*.log"
//! ```

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// How a server is authenticated; exactly one method per server.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

// secrets never end up in logs
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
            Auth::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub banner: Duration,
    pub auth: Duration,
}

/// Immutable description of one remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
    pub timeouts: Timeouts,
}

/// A remote directory to collect from.
#[derive(Debug, Clone)]
pub struct DirectorySpec {
    pub name: String,
    pub server: String,
    pub path: String,
    pub pattern: String,
    pub recursive: bool,
    matcher: globset::GlobMatcher,
}

impl DirectorySpec {
    pub fn new(
        name: &str,
        server: &str,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Self, Error> {
        let matcher = globset::GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| {
                Error::Config(format!(
                    "directory '{name}': invalid file_pattern '{pattern}': {err}"
                ))
            })?
            .compile_matcher();
        Ok(Self {
            name: name.to_string(),
            server: server.to_string(),
            path: path.to_string(),
            pattern: pattern.to_string(),
            recursive,
            matcher,
        })
    }

    /// Matches the pattern against a bare file name.
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        self.matcher.is_match(file_name)
    }
}

/// Engine settings, the `[settings]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_download_path")]
    pub default_download_path: PathBuf,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay", deserialize_with = "de_duration")]
    pub retry_base_delay: Duration,
    #[serde(default = "default_connection_timeout", deserialize_with = "de_seconds")]
    pub connection_timeout: Duration,
    #[serde(default = "default_ssh_timeout", deserialize_with = "de_seconds")]
    pub ssh_banner_timeout: Duration,
    #[serde(default = "default_ssh_timeout", deserialize_with = "de_seconds")]
    pub ssh_auth_timeout: Duration,
    #[serde(default = "default_keepalive_interval", deserialize_with = "de_seconds")]
    pub keepalive_interval: Duration,
    #[serde(default = "default_window_size", deserialize_with = "de_bytes")]
    pub window_size: u64,
    #[serde(default = "default_chunk_size", deserialize_with = "de_bytes")]
    pub chunk_size: u64,
    #[serde(default = "default_large_file_threshold", deserialize_with = "de_bytes")]
    pub large_file_threshold: u64,
    #[serde(default = "default_pace_every", deserialize_with = "de_bytes")]
    pub pace_every: u64,
    #[serde(default = "default_pace_delay", deserialize_with = "de_duration")]
    pub pace_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: default_download_path(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay: default_retry_base_delay(),
            connection_timeout: default_connection_timeout(),
            ssh_banner_timeout: default_ssh_timeout(),
            ssh_auth_timeout: default_ssh_timeout(),
            keepalive_interval: default_keepalive_interval(),
            window_size: default_window_size(),
            chunk_size: default_chunk_size(),
            large_file_threshold: default_large_file_threshold(),
            pace_every: default_pace_every(),
            pace_delay: default_pace_delay(),
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_transfers == 0 {
            return Err(Error::Config(
                "max_concurrent_transfers must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(Error::Config("retry_attempts must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than 0".to_string()));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Config(
                "connection_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn transfer(&self) -> crate::transfer::Settings {
        crate::transfer::Settings {
            chunk_size: self.chunk_size,
            large_file_threshold: self.large_file_threshold,
            pace_every: self.pace_every,
            pace_delay: self.pace_delay,
        }
    }

    #[must_use]
    pub fn retry(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
        }
    }

    #[must_use]
    pub fn tuning(&self) -> crate::ssh::TransportTuning {
        crate::ssh::TransportTuning {
            keepalive_interval: self.keepalive_interval,
            window_size: u32::try_from(self.window_size).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    name: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    password: Option<String>,
    key_file: Option<String>,
    passphrase: Option<String>,
    /// connect timeout override in seconds
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirectory {
    name: String,
    server: String,
    path: String,
    #[serde(default = "default_file_pattern")]
    file_pattern: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    directories: Vec<RawDirectory>,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub servers: Vec<Arc<ServerProfile>>,
    pub directories: Vec<DirectorySpec>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("cannot read configuration file {path:?}: {err}"))
        })?;
        contents.parse()
    }

    #[must_use]
    pub fn server(&self, name: &str) -> Option<&Arc<ServerProfile>> {
        self.servers.iter().find(|server| server.name == name)
    }

    /// Keeps only the named servers and directories; empty selections keep everything.
    pub fn select(&mut self, servers: &[String], directories: &[String]) -> Result<(), Error> {
        for name in servers {
            if self.server(name).is_none() {
                return Err(Error::Config(format!("unknown server '{name}'")));
            }
        }
        for name in directories {
            if !self.directories.iter().any(|dir| dir.name == *name) {
                return Err(Error::Config(format!("unknown directory '{name}'")));
            }
        }
        if !servers.is_empty() {
            self.servers.retain(|server| servers.contains(&server.name));
            self.directories.retain(|dir| servers.contains(&dir.server));
        }
        if !directories.is_empty() {
            self.directories.retain(|dir| directories.contains(&dir.name));
        }
        if self.directories.is_empty() {
            return Err(Error::Config(
                "selection does not contain any directory".to_string(),
            ));
        }
        Ok(())
    }

    fn build_server(raw: RawServer, settings: &Settings) -> Result<ServerProfile, Error> {
        let name = raw.name;
        if name.trim().is_empty() {
            return Err(Error::Config("server name must not be empty".to_string()));
        }
        if raw.host.trim().is_empty() {
            return Err(Error::Config(format!("server '{name}': host must not be empty")));
        }
        let auth = match (raw.password, raw.key_file, raw.passphrase) {
            (Some(password), None, None) => Auth::Password(password),
            (None, Some(key_file), passphrase) => Auth::KeyFile {
                path: expand_tilde(&key_file),
                passphrase,
            },
            (Some(_), Some(_), _) => {
                return Err(Error::Config(format!(
                    "server '{name}': specify either password or key_file, not both"
                )));
            }
            (Some(_), None, Some(_)) => {
                return Err(Error::Config(format!(
                    "server '{name}': passphrase is only valid together with key_file"
                )));
            }
            (None, None, _) => {
                return Err(Error::Config(format!(
                    "server '{name}': no authentication method, set password or key_file"
                )));
            }
        };
        let connect = match raw.timeout {
            Some(0) => {
                return Err(Error::Config(format!(
                    "server '{name}': timeout must be greater than 0"
                )));
            }
            Some(secs) => Duration::from_secs(secs),
            None => settings.connection_timeout,
        };
        Ok(ServerProfile {
            name,
            host: raw.host,
            port: raw.port,
            username: raw.username,
            auth,
            timeouts: Timeouts {
                connect,
                banner: settings.ssh_banner_timeout,
                auth: settings.ssh_auth_timeout,
            },
        })
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let raw: RawConfig = toml::from_str(contents)
            .map_err(|err| Error::Config(format!("cannot parse configuration: {err}")))?;
        raw.settings.validate()?;
        if raw.servers.is_empty() {
            return Err(Error::Config("no servers configured".to_string()));
        }
        if raw.directories.is_empty() {
            return Err(Error::Config("no directories configured".to_string()));
        }
        let mut servers: Vec<Arc<ServerProfile>> = Vec::with_capacity(raw.servers.len());
        for raw_server in raw.servers {
            let server = Config::build_server(raw_server, &raw.settings)?;
            if servers.iter().any(|existing| existing.name == server.name) {
                return Err(Error::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            servers.push(Arc::new(server));
        }
        let mut directories = Vec::with_capacity(raw.directories.len());
        for raw_dir in raw.directories {
            if !servers.iter().any(|server| server.name == raw_dir.server) {
                return Err(Error::Config(format!(
                    "directory '{}' references unknown server '{}'",
                    raw_dir.name, raw_dir.server
                )));
            }
            if raw_dir.path.is_empty() {
                return Err(Error::Config(format!(
                    "directory '{}': path must not be empty",
                    raw_dir.name
                )));
            }
            directories.push(DirectorySpec::new(
                &raw_dir.name,
                &raw_dir.server,
                &raw_dir.path,
                &raw_dir.file_pattern,
                raw_dir.recursive,
            )?);
        }
        Ok(Config {
            settings: raw.settings,
            servers,
            directories,
        })
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").filter(|_| path == "~" || path.starts_with("~/"));
    match home {
        Some(home) => PathBuf::from(home).join(path.trim_start_matches('~').trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}

// Default values

fn default_download_path() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent_transfers() -> usize {
    2
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ssh_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_window_size() -> u64 {
    2 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    32 * 1024
}

fn default_large_file_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_pace_every() -> u64 {
    1024 * 1024
}

fn default_pace_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_port() -> u16 {
    22
}

fn default_file_pattern() -> String {
    "*".to_string()
}

// numbers are accepted next to human-readable strings
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

fn de_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(secs) => Ok(Duration::from_secs(secs)),
        NumberOrString::String(text) => {
            humantime::parse_duration(&text).map_err(serde::de::Error::custom)
        }
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(millis) => Ok(Duration::from_millis(millis)),
        NumberOrString::String(text) => {
            humantime::parse_duration(&text).map_err(serde::de::Error::custom)
        }
    }
}

fn de_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(bytes) => Ok(bytes),
        NumberOrString::String(text) => text
            .parse::<bytesize::ByteSize>()
            .map(|size| size.as_u64())
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[settings]
default_download_path = "/tmp/logs"
retry_attempts = 3
retry_base_delay = "2s"
chunk_size = "64KiB"

[[servers]]
name = "web-1"
host = "10.0.0.1"
username = "ops"
password = "secret"

[[servers]]
name = "db-1"
host = "10.0.0.2"
port = 2222
username = "ops"
key_file = "/keys/id_ed25519"
passphrase = "pw"
timeout = 5

[[directories]]
name = "nginx"
server = "web-1"
path = "/var/log/nginx"
file_pattern = "*.log"

[[directories]]
name = "postgres"
server = "db-1"
path = "/var/log/postgresql"
recursive = true
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = BASIC.parse().unwrap();
        assert_eq!(config.settings.default_download_path, PathBuf::from("/tmp/logs"));
        assert_eq!(config.settings.retry_attempts, 3);
        assert_eq!(config.settings.retry_base_delay, Duration::from_secs(2));
        assert_eq!(config.settings.chunk_size, 64 * 1024);
        // untouched keys fall back to defaults
        assert_eq!(config.settings.max_concurrent_transfers, 2);
        assert_eq!(config.settings.large_file_threshold, 10 * 1024 * 1024);
        assert_eq!(config.settings.pace_delay, Duration::from_millis(10));
        let web = config.server("web-1").unwrap();
        assert_eq!(web.port, 22);
        assert_eq!(web.auth, Auth::Password("secret".to_string()));
        assert_eq!(web.timeouts.connect, Duration::from_secs(30));
        assert_eq!(web.timeouts.banner, Duration::from_secs(60));
        let db = config.server("db-1").unwrap();
        assert_eq!(db.port, 2222);
        assert_eq!(db.timeouts.connect, Duration::from_secs(5));
        assert!(matches!(&db.auth, Auth::KeyFile { passphrase: Some(p), .. } if p == "pw"));
        assert_eq!(config.directories.len(), 2);
        assert_eq!(config.directories[1].pattern, "*");
        assert!(config.directories[1].recursive);
        assert!(config.directories[0].matches("access.log"));
        assert!(!config.directories[0].matches("access.log.1.gz"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = BASIC.replace("retry_attempts = 3", "retry_atempts = 3");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("retry_atempts"), "{err}");
    }

    #[test]
    fn rejects_both_auth_methods() {
        let text = BASIC.replace(
            "password = \"secret\"",
            "password = \"secret\"\nkey_file = \"/k\"",
        );
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("not both"), "{err}");
    }

    #[test]
    fn rejects_missing_auth() {
        let text = BASIC.replace("password = \"secret\"\n", "");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("no authentication method"), "{err}");
    }

    #[test]
    fn rejects_unknown_server_reference() {
        let text = BASIC.replace("server = \"db-1\"", "server = \"db-9\"");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("unknown server 'db-9'"), "{err}");
    }

    #[test]
    fn rejects_duplicate_servers() {
        let text = BASIC.replace("name = \"db-1\"", "name = \"web-1\"");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("duplicate server name"), "{err}");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let text = BASIC.replace("retry_attempts = 3", "max_concurrent_transfers = 0");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_transfers"), "{err}");
    }

    #[test]
    fn rejects_bad_glob() {
        let text = BASIC.replace("\"*.log\"", "\"[.log\"");
        let err = text.parse::<Config>().unwrap_err();
        assert!(err.to_string().contains("invalid file_pattern"), "{err}");
    }

    #[test]
    fn select_narrows_servers_and_directories() {
        let mut config: Config = BASIC.parse().unwrap();
        config.select(&["db-1".to_string()], &[]).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.directories.len(), 1);
        assert_eq!(config.directories[0].name, "postgres");
        let mut config: Config = BASIC.parse().unwrap();
        assert!(config.select(&[], &["nope".to_string()]).is_err());
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config: Config = BASIC.parse().unwrap();
        let debug = format!("{:?}", config.servers);
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("\"pw\""));
    }
}
