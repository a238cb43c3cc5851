//! Operator configuration from flags and environment.

use clap::Parser;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
    pub const METRICS_PORT: &str = "METRICS_PORT";
    pub const HOST_ROOT: &str = "HOST_ROOT";
    pub const WORKSPACE_DIR: &str = "WORKSPACE_DIR";
    pub const NAMESPACE: &str = "NAMESPACE";
    pub const MY_POD_NAME: &str = "MY_POD_NAME";
    pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
    pub const REQUEUE_INTERVAL_SECS: &str = "REQUEUE_INTERVAL_SECS";
    pub const PRECACHE_POLL_INTERVAL_SECS: &str = "PRECACHE_POLL_INTERVAL_SECS";
    pub const PRECACHE_STATUS_RETRIES: &str = "PRECACHE_STATUS_RETRIES";
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ibuo",
    version = const_format::formatcp!("{} (commit: {}, build date: {})", VERSION, COMMIT, BUILD_DATE),
    about = "Image-based upgrade operator",
    long_about = "Watches ImageBasedUpgrade resources and runs the prep stage of an image-based upgrade: seed image pull, stateroot setup, and image precaching."
)]
pub struct Config {
    /// Log format: json or pretty
    #[arg(long, env = env::LOG_FORMAT, default_value = "json")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Health check server port
    #[arg(long, env = env::HEALTH_PORT, default_value = "8080")]
    pub health_port: u16,

    /// Prometheus metrics server port
    #[arg(long, env = env::METRICS_PORT, default_value = "8081")]
    pub metrics_port: u16,

    /// Where the host root filesystem is mounted
    #[arg(long, env = env::HOST_ROOT, default_value = "/host")]
    pub host_root: String,

    /// Operator workspace directory on the host
    #[arg(long, env = env::WORKSPACE_DIR, default_value = "/var/ibu")]
    pub workspace_dir: String,

    /// Namespace of the operator pod
    #[arg(long, env = env::NAMESPACE, default_value = "ibuo")]
    pub namespace: String,

    /// Name of the operator pod
    #[arg(long, env = env::MY_POD_NAME, default_value = "")]
    pub pod_name: String,

    /// Operator container name in the pod
    #[arg(long, env = env::CONTAINER_NAME, default_value = "manager")]
    pub container_name: String,

    /// Requeue interval while the prep stage runs, in seconds
    #[arg(long, env = env::REQUEUE_INTERVAL_SECS, default_value = "5")]
    pub requeue_interval_secs: u64,

    /// Interval between precaching job status checks, in seconds
    #[arg(long, env = env::PRECACHE_POLL_INTERVAL_SECS, default_value = "30")]
    pub precache_poll_interval_secs: u64,

    /// Status fetch attempts per precaching poll round
    #[arg(long, env = env::PRECACHE_STATUS_RETRIES, default_value = "5", value_parser = clap::value_parser!(u32).range(1..))]
    pub precache_status_retries: u32,
}
