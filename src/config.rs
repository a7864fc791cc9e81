//! Service configuration, read from the environment (and `.env`).

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Number of training workers
    pub workers: usize,
    pub bind_addr: String,
    /// Trained models are written here as `model_<job id>.json`
    pub models_dir: PathBuf,
    /// SQLite file holding the durable job records
    pub database_path: PathBuf,
    /// Heartbeat of the progress websocket when nothing changes
    pub poll_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            bind_addr: "0.0.0.0:8002".to_string(),
            models_dir: PathBuf::from("models"),
            database_path: PathBuf::from("dsrules.db"),
            poll_timeout: Duration::from_millis(1000),
        }
    }
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => Ok(Some(raw.trim().parse().with_context(|| format!("Invalid value for {}: {:?}", name, raw))?)),
        Err(_) => Ok(None),
    }
}

impl ServiceConfig {
    /// Loads `.env` if present, then overrides defaults with `DSRULES_*`
    /// variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        if let Some(workers) = parsed::<usize>("DSRULES_WORKERS")? {
            config.workers = workers.max(1);
        }
        if let Ok(bind) = env::var("DSRULES_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(dir) = env::var("DSRULES_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(db) = env::var("DSRULES_DB") {
            config.database_path = PathBuf::from(db);
        }
        if let Some(ms) = parsed::<u64>("DSRULES_POLL_TIMEOUT_MS")? {
            config.poll_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}
