use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quarry_reconcile::{DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};

use crate::operations::{DEFAULT_RESYNC_INTERVAL, RECOVERY_DELAY};
use crate::resources::{CpuCores, MegaBytes, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT};

/// Capacity of the pod watch channel.
pub const DEFAULT_UPDATES_BACKLOG: usize = 2048;

/// How long an unclaimed offer stays usable.
pub const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(5);

/// Settings the scheduler core runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub initial_pod_backoff: Duration,
    pub max_pod_backoff: Duration,
    pub default_container_cpu_limit: CpuCores,
    pub default_container_mem_limit: MegaBytes,
    pub updates_backlog: usize,
    pub offer_ttl: Duration,
    pub recovery_delay: Duration,
    pub resync_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_pod_backoff: DEFAULT_INITIAL_BACKOFF,
            max_pod_backoff: DEFAULT_MAX_BACKOFF,
            default_container_cpu_limit: DEFAULT_CONTAINER_CPU_LIMIT,
            default_container_mem_limit: DEFAULT_CONTAINER_MEM_LIMIT,
            updates_backlog: DEFAULT_UPDATES_BACKLOG,
            offer_ttl: DEFAULT_OFFER_TTL,
            recovery_delay: RECOVERY_DELAY,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr =
            parse_or(&lookup, "QUARRY_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 10251)))?;

        let log_level = lookup("QUARRY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            initial_pod_backoff: millis_or(
                &lookup,
                "QUARRY_INITIAL_POD_BACKOFF_MS",
                defaults.initial_pod_backoff,
            )?,
            max_pod_backoff: millis_or(&lookup, "QUARRY_MAX_POD_BACKOFF_MS", defaults.max_pod_backoff)?,
            default_container_cpu_limit: CpuCores(parse_or(
                &lookup,
                "QUARRY_DEFAULT_CONTAINER_CPU_LIMIT",
                defaults.default_container_cpu_limit.0,
            )?),
            default_container_mem_limit: MegaBytes(parse_or(
                &lookup,
                "QUARRY_DEFAULT_CONTAINER_MEM_LIMIT",
                defaults.default_container_mem_limit.0,
            )?),
            updates_backlog: parse_or(&lookup, "QUARRY_UPDATES_BACKLOG", defaults.updates_backlog)?,
            offer_ttl: Duration::from_secs(parse_or(
                &lookup,
                "QUARRY_OFFER_TTL_SECS",
                defaults.offer_ttl.as_secs(),
            )?),
            recovery_delay: millis_or(&lookup, "QUARRY_RECOVERY_DELAY_MS", defaults.recovery_delay)?,
            resync_interval: Duration::from_secs(parse_or(
                &lookup,
                "QUARRY_RESYNC_INTERVAL_SECS",
                defaults.resync_interval.as_secs(),
            )?),
        };
        scheduler.validate()?;

        Ok(Self {
            listen_addr,
            log_level,
            scheduler,
        })
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_pod_backoff.is_zero() {
            bail!("initial pod backoff must be positive");
        }
        if self.max_pod_backoff < self.initial_pod_backoff {
            bail!(
                "max pod backoff ({:?}) is shorter than the initial backoff ({:?})",
                self.max_pod_backoff,
                self.initial_pod_backoff
            );
        }
        if self.default_container_cpu_limit.0 <= 0.0 || self.default_container_mem_limit.0 <= 0.0 {
            bail!("default container limits must be positive");
        }
        if self.offer_ttl.is_zero() || self.resync_interval.is_zero() {
            bail!("offer TTL and resync interval must be positive");
        }
        if self.updates_backlog == 0 {
            bail!("updates backlog must be at least 1");
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let ms = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
