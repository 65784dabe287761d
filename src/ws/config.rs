#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;

const DEFAULT_KEEPALIVE_INTERVAL_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_millis(500);

/// Configuration for WebSocket client behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Interval between `{"ping":1}` frames while a connection is open
    #[builder(default = DEFAULT_KEEPALIVE_INTERVAL_DURATION)]
    pub keepalive_interval: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Re-send subscribe frames for every live subscription after a reconnect.
    ///
    /// When `false`, subscriptions are invalidated on an unexpected close and
    /// consumers are expected to subscribe again from their reconnect callback.
    #[builder(default)]
    pub resubscribe_on_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay is fixed: there is no jitter and no growth between attempts.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Delay before every reconnection attempt
    #[builder(default = DEFAULT_RECONNECT_DELAY_DURATION)]
    pub delay: Duration,
    /// Maximum number of consecutive failed attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    /// Whether `attempt` consecutive failures exhaust this policy.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl From<ReconnectConfig> for Constant {
    fn from(config: ReconnectConfig) -> Self {
        Constant::new(config.delay)
    }
}
