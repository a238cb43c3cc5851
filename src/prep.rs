//! Prep phase orchestration.
//!
//! - [`dispatcher`]: per-reconcile entry point deciding to start, poll, or finalize
//! - [`pipeline`]: ordered steps executed by the background worker
//! - [`task`]: state shared between the dispatcher and the worker

pub mod dispatcher;
pub mod pipeline;
pub mod seed;
pub mod task;
pub mod version;

use std::time::Duration;

use crate::config::Config;

/// Worker settings that do not change between runs.
#[derive(Debug, Clone)]
pub struct PrepSettings {
    /// Namespace holding the operator pod and seed pull secrets.
    pub namespace: String,
    /// Container whose literal env is passed to the precaching job.
    pub container_name: String,
    pub precache_poll_interval: Duration,
    pub precache_status_retries: u32,
}

impl PrepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.namespace.clone(),
            container_name: config.container_name.clone(),
            precache_poll_interval: Duration::from_secs(config.precache_poll_interval_secs),
            precache_status_retries: config.precache_status_retries,
        }
    }
}

#[cfg(test)]
impl Default for PrepSettings {
    fn default() -> Self {
        Self {
            namespace: "ibuo".to_string(),
            container_name: "manager".to_string(),
            precache_poll_interval: Duration::from_secs(30),
            precache_status_retries: 5,
        }
    }
}
