use serde::{Deserialize, Serialize};

/// Job runner pool sizing and phase timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Concurrent job runners.
    /// TOML: `runner.max_concurrency`. Default: `2`.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of the queued-job channel feeding the pool.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Overall budget for the submit-phase open-with-retry, seconds.
    #[serde(default = "default_submit_open_overall_secs")]
    pub submit_open_overall_secs: u64,

    /// Total progress-phase budget, seconds. Default: 20 minutes.
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,

    /// Progress poll interval, seconds.
    #[serde(default = "default_progress_poll_secs")]
    pub progress_poll_secs: u64,

    /// Budget for generation-id capture, seconds. Default: 20 minutes.
    #[serde(default = "default_genid_timeout_secs")]
    pub genid_timeout_secs: u64,

    /// Total attempts (including the first) for heavy-load auto-retry
    /// across profiles. Clamped to 1..=10.
    #[serde(default = "default_heavy_load_max_attempts")]
    pub heavy_load_max_attempts: u32,
}

impl RunnerConfig {
    pub fn heavy_load_attempt_cap(&self) -> u32 {
        self.heavy_load_max_attempts.clamp(1, 10)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue_capacity: default_queue_capacity(),
            submit_open_overall_secs: default_submit_open_overall_secs(),
            progress_timeout_secs: default_progress_timeout_secs(),
            progress_poll_secs: default_progress_poll_secs(),
            genid_timeout_secs: default_genid_timeout_secs(),
            heavy_load_max_attempts: default_heavy_load_max_attempts(),
        }
    }
}

fn default_max_concurrency() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    256
}

fn default_submit_open_overall_secs() -> u64 {
    30
}

fn default_progress_timeout_secs() -> u64 {
    20 * 60
}

fn default_progress_poll_secs() -> u64 {
    6
}

fn default_genid_timeout_secs() -> u64 {
    20 * 60
}

fn default_heavy_load_max_attempts() -> u32 {
    4
}
