use serde::{Deserialize, Serialize};
use std::{env, fmt, num::ParseIntError, str::FromStr, time::Duration};
use thiserror::Error;

const DEFAULT_DEST_REPO: &str = "generic-local";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Named deployment the job runs against. Each one binds its own endpoints
/// and credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Prod,
}

impl Environment {
    fn env_prefix(self) -> &'static str {
        match self {
            Self::Test => "REPOMIGRATE_TEST_",
            Self::Prod => "REPOMIGRATE_PROD_",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            other => Err(ConfigError::UnknownEnvironment(other.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing env var: {0}")]
    MissingEnv(String),
    #[error("invalid integer in env var {name}: {source}")]
    InvalidInteger { name: String, source: ParseIntError },
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub base_url: String,
    /// Repository key on the source service.
    pub repo: String,
    /// Path prefix inside `repo` that is stripped when re-rooting artifacts.
    pub root: String,
    pub user: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationEndpoint {
    pub base_url: String,
    pub project: String,
    pub repo: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Endpoints and credentials for one migration job. Built once and handed to
/// every client at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub source: SourceEndpoint,
    pub destination: DestinationEndpoint,
    pub request_timeout: Duration,
}

/// Per-environment values read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub environment: Environment,
    pub source_url: String,
    pub source_repo: String,
    pub source_root: String,
    pub source_user: String,
    pub source_token: String,
    pub dest_url: String,
    pub dest_repo: String,
    pub dest_access_key: String,
    pub dest_secret_key: String,
    pub request_timeout: Duration,
}

impl EnvironmentConfig {
    pub fn from_env(environment: Environment) -> Result<Self, ConfigError> {
        Self::from_lookup(environment, |name| env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(
        environment: Environment,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let prefix = environment.env_prefix();
        let name = |key: &str| format!("{prefix}{key}");
        let required = |key: &str| {
            let name = name(key);
            lookup(&name).ok_or(ConfigError::MissingEnv(name))
        };

        let request_timeout_secs = match lookup(&name("REQUEST_TIMEOUT_SECS")) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|source| ConfigError::InvalidInteger {
                    name: name("REQUEST_TIMEOUT_SECS"),
                    source,
                })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            environment,
            source_url: required("SOURCE_URL")?,
            source_repo: required("SOURCE_REPO")?,
            source_root: lookup(&name("SOURCE_ROOT")).unwrap_or_default(),
            source_user: required("SOURCE_USER")?,
            source_token: required("SOURCE_TOKEN")?,
            dest_url: required("DEST_URL")?,
            dest_repo: lookup(&name("DEST_REPO")).unwrap_or_else(|| DEFAULT_DEST_REPO.to_owned()),
            dest_access_key: required("DEST_ACCESS_KEY")?,
            dest_secret_key: required("DEST_SECRET_KEY")?,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    pub fn into_migration_config(self, project: &str) -> MigrationConfig {
        MigrationConfig {
            source: SourceEndpoint {
                base_url: self.source_url.trim_end_matches('/').to_owned(),
                repo: self.source_repo,
                root: self.source_root.trim_matches('/').to_owned(),
                user: self.source_user,
                token: self.source_token,
            },
            destination: DestinationEndpoint {
                base_url: self.dest_url.trim_end_matches('/').to_owned(),
                project: project.to_owned(),
                repo: self.dest_repo,
                access_key: self.dest_access_key,
                secret_key: self.dest_secret_key,
            },
            request_timeout: self.request_timeout,
        }
    }
}

/// Run-time knobs that do not affect where data is read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Re-send artifacts even when the destination already holds them.
    pub overwrite: bool,
    /// Upper bound on units in flight, and therefore on open content streams.
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            concurrency: 1,
        }
    }
}
