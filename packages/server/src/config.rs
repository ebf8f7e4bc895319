use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
///
/// `JOB_QUEUE_URL` is deliberately optional: when it is absent the process
/// still starts, and stage generation runs inline on the caller instead of
/// through the durable queue. See [`crate::kernel::jobs::JobDispatcher`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the workflow aggregate store.
    pub database_url: String,
    /// Connection string for the durable job queue. Absent = inline mode.
    pub job_queue_url: Option<String>,
    /// Maximum number of jobs a runner claims per poll.
    pub job_batch_size: i64,
    /// Seconds to sleep when no jobs are ready.
    pub job_poll_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            job_queue_url: env::var("JOB_QUEUE_URL").ok(),
            job_batch_size: env::var("JOB_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("JOB_BATCH_SIZE must be a valid number")?,
            job_poll_interval_secs: env::var("JOB_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("JOB_POLL_INTERVAL_SECS must be a valid number")?,
        })
    }
}
