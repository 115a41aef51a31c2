/*!
 * Server Configuration
 *
 * Defaults, a chainable builder, and an environment overlay
 * (`CINDERKV_ADDR`, `CINDERKV_AOF`, `CINDERKV_FSYNC`, `CINDERKV_WORKERS`).
 */

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Default listen address - Redis-compatible port 7379
pub const DEFAULT_ADDR: &str = "0.0.0.0:7379";

/// Default append-only log file
pub const DEFAULT_AOF_PATH: &str = "cinderkv.aof";

/// When the log is forced to stable storage after an append
///
/// Every policy writes and flushes to the OS before `append` returns;
/// they differ only in how often `sync_data` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// `sync_data` after every record
    #[default]
    Always,
    /// `sync_data` at most once per second, on the next append
    EverySec,
    /// Leave syncing to the OS
    Never,
}

impl FromStr for FsyncPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "never" | "no" => Ok(FsyncPolicy::Never),
            other => Err(anyhow!("unknown fsync policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen address
    pub listen_addr: String,

    /// Append-only log; `None` runs purely in memory
    pub aof_path: Option<PathBuf>,

    pub fsync: FsyncPolicy,

    /// Event-loop threads
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR.to_string(),
            aof_path: Some(PathBuf::from(DEFAULT_AOF_PATH)),
            fsync: FsyncPolicy::default(),
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overlaid with whatever `CINDERKV_*` variables are set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(addr) = lookup("CINDERKV_ADDR") {
            builder = builder.listen_addr(addr);
        }
        if let Some(path) = lookup("CINDERKV_AOF") {
            // An empty path turns persistence off
            builder = if path.is_empty() { builder.no_aof() } else { builder.aof_path(path) };
        }
        if let Some(policy) = lookup("CINDERKV_FSYNC") {
            builder = builder.fsync(policy.parse::<FsyncPolicy>().context("CINDERKV_FSYNC")?);
        }
        if let Some(workers) = lookup("CINDERKV_WORKERS") {
            let n = workers
                .parse::<usize>()
                .with_context(|| format!("CINDERKV_WORKERS: invalid number '{}'", workers))?;
            if n == 0 {
                return Err(anyhow!("CINDERKV_WORKERS must be at least 1"));
            }
            builder = builder.workers(n);
        }

        Ok(builder.build())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn aof_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.aof_path = Some(path.into());
        self
    }

    /// Run without a log: nothing is replayed or appended
    pub fn no_aof(mut self) -> Self {
        self.config.aof_path = None;
        self
    }

    pub fn fsync(mut self, policy: FsyncPolicy) -> Self {
        self.config.fsync = policy;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
