use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;
use study_core::WorkerLayout;

pub const SLEEP_ENV: &str = "STUDYD_SLEEP_SECONDS";
pub const LOCK_TIMEOUT_ENV: &str = "STUDYD_LOCK_TIMEOUT_SECONDS";
pub const LAUNCH_LOCK_TIMEOUT_ENV: &str = "STUDYD_LAUNCH_LOCK_TIMEOUT_SECONDS";
pub const DRAIN_LOCK_TIMEOUT_ENV: &str = "STUDYD_DRAIN_LOCK_TIMEOUT_SECONDS";
pub const SENTINEL_LOCK_TIMEOUT_ENV: &str = "STUDYD_SENTINEL_LOCK_TIMEOUT_SECONDS";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub layout: WorkerLayout,
    pub sleep: Duration,
    /// Ordinary history commits.
    pub lock_timeout: Duration,
    /// Commits in a cycle that launched studies.
    pub launch_lock_timeout: Duration,
    /// Final flush of pending entries on shutdown.
    pub drain_lock_timeout: Duration,
    pub sentinel_lock_timeout: Duration,
}

impl DaemonConfig {
    pub fn new(layout: WorkerLayout) -> Self {
        Self {
            layout,
            sleep: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(30),
            launch_lock_timeout: Duration::from_secs(300),
            drain_lock_timeout: Duration::from_secs(600),
            sentinel_lock_timeout: Duration::from_secs(10),
        }
    }

    /// Applies any `STUDYD_*` overrides present in the environment.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        let slots: [(&str, &mut Duration); 5] = [
            (SLEEP_ENV, &mut self.sleep),
            (LOCK_TIMEOUT_ENV, &mut self.lock_timeout),
            (LAUNCH_LOCK_TIMEOUT_ENV, &mut self.launch_lock_timeout),
            (DRAIN_LOCK_TIMEOUT_ENV, &mut self.drain_lock_timeout),
            (SENTINEL_LOCK_TIMEOUT_ENV, &mut self.sentinel_lock_timeout),
        ];
        for (name, slot) in slots {
            if let Some(secs) = parse_optional_positive_u64_env(name)? {
                *slot = Duration::from_secs(secs);
            }
        }
        Ok(self)
    }
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => parse_positive_u64(name, &raw),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn parse_positive_u64(name: &str, raw: &str) -> Result<Option<u64>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed
        .parse::<u64>()
        .map_err(|_| anyhow!("{} must be a positive integer when set (got: {})", name, raw))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(Some(parsed))
}
