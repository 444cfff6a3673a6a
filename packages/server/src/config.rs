//! Daemon configuration read from the environment.

use db::DbConfig;
use job_manager::ManagerConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("{var} must be set as well")]
    Missing { var: &'static str },
}

/// Settings for one daemon run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub manager: ManagerConfig,
    /// Number of demo jobs to push through the simulated services.
    pub demo_jobs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).and_then(non_empty);

        let mut db = match get("JOBMGR_DB_ENDPOINT") {
            Some(endpoint) => DbConfig::endpoint(endpoint),
            None => DbConfig::memory(),
        };
        if let Some(namespace) = get("JOBMGR_DB_NAMESPACE") {
            db = db.with_namespace(namespace);
        }
        if let Some(database) = get("JOBMGR_DB_DATABASE") {
            db = db.with_database(database);
        }
        match (get("JOBMGR_DB_USER"), get("JOBMGR_DB_PASS")) {
            (Some(user), Some(pass)) => db = db.with_credentials(user, pass),
            (None, None) => {}
            (Some(_), None) => {
                return Err(ConfigError::Missing {
                    var: "JOBMGR_DB_PASS",
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    var: "JOBMGR_DB_USER",
                });
            }
        }

        let mut manager = ManagerConfig::default();
        if let Some(ms) = parse(get("JOBMGR_BATCH_TIMEOUT_MS"), "JOBMGR_BATCH_TIMEOUT_MS")? {
            manager = manager.with_batch_timeout_ms(ms);
        }
        if let Some(limit) = parse(get("JOBMGR_ALLOC_LIMIT"), "JOBMGR_ALLOC_LIMIT")? {
            manager = manager.with_alloc_limit(limit);
        }

        let demo_jobs = parse(get("JOBMGR_DEMO_JOBS"), "JOBMGR_DEMO_JOBS")?.unwrap_or(4);

        Ok(Self {
            db,
            manager,
            demo_jobs,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| v.parse().map_err(|_| ConfigError::Invalid { var, value: v }))
        .transpose()
}
