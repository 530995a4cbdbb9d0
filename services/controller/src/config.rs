use std::time::Duration;

use anyhow::{bail, Context, Result};
use clusterinfo_reconcile::{DEFAULT_ACCOUNTING_PERIOD, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_INTERVAL};
use clusterinfo_resource::GIGABYTE;

use crate::accounting::{AccountingPolicy, Threshold, DEFAULT_VIRTUAL_NODE};
use crate::db::DbConfig;
use crate::reconciler::Strategy;
use crate::snapshot::DEFAULT_CLUSTER_ID;

const DEFAULT_STARTUP_ATTEMPTS: u32 = 5;

const DEFAULT_FEED_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_id: String,
    pub period: Duration,
    pub virtual_node: String,
    pub strategy: Strategy,
    pub cpu_thresholds: Vec<Threshold>,
    pub memory_thresholds: Vec<Threshold>,

    /// Attempts per queued event before it is dropped.
    pub max_retries: u32,

    /// Attempts to reach the snapshot store at startup.
    pub startup_attempts: u32,

    /// How often the change log is polled.
    pub feed_poll_interval: Duration,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let cluster_id = lookup("CLUSTERINFO_CLUSTER_ID")
            .unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string());

        let period = match lookup("CLUSTERINFO_PERIOD_MS") {
            Some(ms) => {
                let ms: u64 = ms.parse().context("invalid CLUSTERINFO_PERIOD_MS")?;
                if ms == 0 {
                    bail!("CLUSTERINFO_PERIOD_MS must be positive");
                }
                Duration::from_millis(ms)
            }
            None => DEFAULT_ACCOUNTING_PERIOD,
        };

        let virtual_node =
            lookup("CLUSTERINFO_VIRTUAL_NODE").unwrap_or_else(|| DEFAULT_VIRTUAL_NODE.to_string());

        let resync_interval = match lookup("CLUSTERINFO_RESYNC_INTERVAL") {
            Some(v) => v.parse().context("invalid CLUSTERINFO_RESYNC_INTERVAL")?,
            None => DEFAULT_RESYNC_INTERVAL,
        };
        let strategy = match lookup("CLUSTERINFO_STRATEGY").as_deref() {
            None | Some("incremental") => Strategy::Incremental { resync_interval },
            Some("full") => Strategy::Full,
            Some(other) => bail!("unknown CLUSTERINFO_STRATEGY '{other}' (expected full or incremental)"),
        };

        let defaults = AccountingPolicy::default();
        let cpu_thresholds = match lookup("CLUSTERINFO_CPU_THRESHOLDS") {
            Some(list) => parse_thresholds(&list).context("invalid CLUSTERINFO_CPU_THRESHOLDS")?,
            None => defaults.cpu_thresholds,
        };
        let memory_thresholds = match lookup("CLUSTERINFO_MEMORY_THRESHOLDS") {
            Some(list) => {
                parse_thresholds(&list).context("invalid CLUSTERINFO_MEMORY_THRESHOLDS")?
            }
            None => defaults.memory_thresholds,
        };

        let max_retries = match lookup("CLUSTERINFO_MAX_RETRIES") {
            Some(v) => v.parse().context("invalid CLUSTERINFO_MAX_RETRIES")?,
            None => DEFAULT_MAX_RETRIES,
        };

        let startup_attempts = match lookup("CLUSTERINFO_STARTUP_ATTEMPTS") {
            Some(v) => {
                let attempts: u32 = v.parse().context("invalid CLUSTERINFO_STARTUP_ATTEMPTS")?;
                if attempts == 0 {
                    bail!("CLUSTERINFO_STARTUP_ATTEMPTS must be positive");
                }
                attempts
            }
            None => DEFAULT_STARTUP_ATTEMPTS,
        };

        let feed_poll_interval = match lookup("CLUSTERINFO_FEED_POLL_MS") {
            Some(ms) => {
                let ms: u64 = ms.parse().context("invalid CLUSTERINFO_FEED_POLL_MS")?;
                if ms == 0 {
                    bail!("CLUSTERINFO_FEED_POLL_MS must be positive");
                }
                Duration::from_millis(ms)
            }
            None => DEFAULT_FEED_POLL_INTERVAL,
        };

        let log_level = lookup("CLUSTERINFO_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("CLUSTERINFO_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_lookup(&lookup)?;

        Ok(Self {
            cluster_id,
            period,
            virtual_node,
            strategy,
            cpu_thresholds,
            memory_thresholds,
            max_retries,
            startup_attempts,
            feed_poll_interval,
            log_level,
            dev_mode,
            database,
        })
    }

    pub fn accounting_policy(&self) -> AccountingPolicy {
        AccountingPolicy {
            virtual_node: self.virtual_node.clone(),
            cpu_thresholds: self.cpu_thresholds.clone(),
            memory_thresholds: self.memory_thresholds.clone(),
            memory_granularity: GIGABYTE,
        }
    }
}

/// Parse a comma-separated, strictly ascending list of quantities.
fn parse_thresholds(list: &str) -> Result<Vec<Threshold>> {
    let thresholds = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Threshold>().with_context(|| format!("bad threshold '{s}'")))
        .collect::<Result<Vec<_>>>()?;

    if !thresholds
        .windows(2)
        .all(|w| w[0].quantity() < w[1].quantity())
    {
        bail!("thresholds must be strictly ascending");
    }
    Ok(thresholds)
}
