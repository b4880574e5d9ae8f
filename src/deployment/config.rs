//! Deployment settings

use crate::network::{DialPolicy, TcpNetwork};
use crate::service::ServiceSettings;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Deployment-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// How long a stop waits before killing a service
    pub stop_timeout: Duration,
    /// Dial retry policy for connecting ports
    pub dial_policy: DialPolicy,
    /// How long output may keep arriving after a service exits
    pub output_drain_interval: Duration,
    /// Services launched at the same time
    pub launch_concurrency: usize,
    /// Ports reserved for listeners on remote hosts
    pub port_range: RangeInclusive<u16>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(60),
            dial_policy: DialPolicy::default(),
            output_drain_interval: Duration::from_millis(500),
            launch_concurrency: num_cpus::get(),
            port_range: 20000..=29999,
        }
    }
}

impl DeploymentConfig {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the number of dial attempts
    pub fn dial_attempts(mut self, attempts: u32) -> Self {
        self.dial_policy.attempts = attempts.max(1);
        self
    }

    /// Set the delay between dial attempts
    pub fn dial_delay(mut self, delay: Duration) -> Self {
        self.dial_policy.delay = delay;
        self
    }

    /// Set the output drain interval
    pub fn output_drain_interval(mut self, interval: Duration) -> Self {
        self.output_drain_interval = interval;
        self
    }

    /// Set the launch concurrency
    pub fn launch_concurrency(mut self, concurrency: usize) -> Self {
        self.launch_concurrency = concurrency.max(1);
        self
    }

    /// Set the remote port range
    pub fn port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub(crate) fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            stop_timeout: self.stop_timeout,
            output_drain_interval: self.output_drain_interval,
        }
    }

    pub(crate) fn tcp_network(&self) -> TcpNetwork {
        TcpNetwork::new()
            .dial_policy(self.dial_policy)
            .port_range(self.port_range.clone())
    }
}
