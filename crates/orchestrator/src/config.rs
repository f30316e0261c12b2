use std::time::Duration;

/// Tuning knobs for one [`Queen`](crate::Queen) instance.
#[derive(Debug, Clone)]
pub struct QueenConfig {
    /// Ceiling on concurrently executing phases.
    pub max_concurrent: usize,
    /// Idle wait between poll cycles.
    pub poll_interval: Duration,
    /// Applied to phases that do not set `timeout_secs`. `None` waits forever.
    pub default_phase_timeout: Option<Duration>,
    /// How long in-flight work may take to wind down on shutdown.
    pub shutdown_grace: Duration,
    /// How often open runs get their heartbeat refreshed. Reclaim thresholds
    /// must stay well above this.
    pub heartbeat_interval: Duration,
    /// Shell used to run phase commands.
    pub worker_shell: String,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(1),
            default_phase_timeout: Some(Duration::from_secs(30 * 60)),
            shutdown_grace: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            worker_shell: "sh".to_string(),
        }
    }
}

impl QueenConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_phase_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.worker_shell = shell.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueenConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.default_phase_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.worker_shell, "sh");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(QueenConfig::default().with_max_concurrent(0).max_concurrent, 1);
    }
}
