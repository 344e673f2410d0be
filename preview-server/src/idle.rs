//! Idle timeout management - stops previews nobody has touched for a while

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;

use crate::orchestrator::Orchestrator;

/// Configuration for the idle reaper
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// How often to look for idle previews
    pub check_interval: Duration,
    /// Previews idle longer than this are stopped
    pub idle_timeout: Duration,
}

impl IdleConfig {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            // Faster feedback in debug/test; production can be coarser.
            check_interval: if cfg!(debug_assertions) {
                crate::defaults::IDLE_CHECK_INTERVAL_DEBUG
            } else {
                crate::defaults::IDLE_CHECK_INTERVAL_RELEASE
            },
            idle_timeout,
        }
    }
}

/// Stops running previews whose last activity is older than the timeout
pub struct IdleMonitor {
    config: IdleConfig,
    orchestrator: Arc<Orchestrator>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub async fn run(&self) {
        let mut check_interval = interval(self.config.check_interval);
        loop {
            check_interval.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over the registry. Returns the sites that were stopped.
    pub async fn sweep(&self) -> Vec<String> {
        let candidates = self
            .orchestrator
            .registry()
            .idle_sites(Utc::now(), self.config.idle_timeout);

        let mut stopped = Vec::new();
        for site_id in candidates {
            // Activity may have arrived while waiting for the site lock.
            if self
                .orchestrator
                .stop_if_idle(&site_id, self.config.idle_timeout)
                .await
            {
                stopped.push(site_id);
            }
        }
        stopped
    }
}
