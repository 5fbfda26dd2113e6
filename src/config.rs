// MIT License

use std::time::Duration;

use crate::classify::AddressTable;

/// How reconnect delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Reconnect behavior after a connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub kind: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: BackoffKind::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// No reconnection at all; the session stays down after a loss.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(4);
                self.base_delay.saturating_mul(1 << shift)
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Session configuration, created through [`SessionConfigBuilder`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub address_table: AddressTable,
    pub event_capacity: usize,
    pub tick_interval: Duration,
}

impl SessionConfig {
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(host)
    }
}

/// Fluent builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: SessionConfig {
                host: host.into(),
                port: 8234,
                connect_timeout: Duration::from_secs(10),
                command_timeout: Duration::from_secs(5),
                reconnect: ReconnectPolicy::default(),
                address_table: AddressTable::default(),
                event_capacity: 256,
                tick_interval: Duration::from_millis(200),
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn address_table(mut self, table: AddressTable) -> Self {
        self.config.address_table = table;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
