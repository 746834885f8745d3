use std::time::Duration;

/// Expressions the console sends on its own behalf. The bodies are opaque to the
/// console; they only have to evaluate to the kind each reply is decoded as.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeScripts {
    /// Text snapshot of the remote state flags.
    pub state_flags: String,
    /// Text snapshot of the current location.
    pub location: String,
    /// Boolean: has the remote game/session started.
    pub game_started: String,
    /// Text: comma separated list of remote script properties.
    pub properties: String,
    /// Integer: stores `{token}` in remote state and returns it.
    pub token_write: String,
    /// Integer: reads back the stored session token.
    pub token_read: String,
}

impl Default for ProbeScripts {
    fn default() -> Self {
        Self {
            state_flags: "console.state_flags()".to_string(),
            location: "console.location()".to_string(),
            game_started: "console.game_started()".to_string(),
            properties: "table.concat(console.properties(), \",\")".to_string(),
            token_write: "console.set_session_token({token})".to_string(),
            token_read: "console.session_token".to_string(),
        }
    }
}

impl ProbeScripts {
    pub fn token_write_for(&self, token: i64) -> String {
        self.token_write.replace("{token}", &token.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Period of the request queue tick (dispatch + timeout detection).
    pub queue_tick: Duration,
    /// Delay before a scheduled inbound drain runs.
    pub drain_delay: Duration,
    /// Period of the value polling scheduler.
    pub poll_tick: Duration,
    /// Retry period for the game-started heartbeat while awaiting the session.
    pub heartbeat_retry: Duration,
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    /// How long a timed-out probe stays recognizable before it is purged.
    pub abort_after: Duration,
    /// How long a cyclic poll may stay unanswered before it is abandoned.
    pub poll_expiry: Duration,
    /// Maximum alias polls issued per poll tick.
    pub poll_cap: usize,
    /// One session heartbeat is interleaved every this many poll ticks.
    pub heartbeat_every: u32,
    pub initial_batch_size: usize,
    pub scripts: ProbeScripts,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            queue_tick: Duration::from_millis(50),
            drain_delay: Duration::from_millis(10),
            poll_tick: Duration::from_millis(500),
            heartbeat_retry: Duration::from_secs(1),
            short_timeout: Duration::from_secs(2),
            long_timeout: Duration::from_secs(4),
            abort_after: Duration::from_secs(15),
            poll_expiry: Duration::from_secs(5),
            poll_cap: 5,
            heartbeat_every: 3,
            initial_batch_size: 10,
            scripts: ProbeScripts::default(),
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.queue_tick = env_millis("CONSOLE_QUEUE_TICK_MS").unwrap_or(config.queue_tick);
        config.drain_delay = env_millis("CONSOLE_DRAIN_DELAY_MS").unwrap_or(config.drain_delay);
        config.poll_tick = env_millis("CONSOLE_POLL_TICK_MS").unwrap_or(config.poll_tick);
        config.heartbeat_retry =
            env_millis("CONSOLE_HEARTBEAT_RETRY_MS").unwrap_or(config.heartbeat_retry);
        config.short_timeout =
            env_millis("CONSOLE_SHORT_TIMEOUT_MS").unwrap_or(config.short_timeout);
        config.long_timeout = env_millis("CONSOLE_LONG_TIMEOUT_MS").unwrap_or(config.long_timeout);
        config.abort_after = env_millis("CONSOLE_ABORT_AFTER_MS").unwrap_or(config.abort_after);
        config.poll_expiry = env_millis("CONSOLE_POLL_EXPIRY_MS").unwrap_or(config.poll_expiry);
        config.poll_cap = env_count("CONSOLE_POLL_CAP").unwrap_or(config.poll_cap);
        config.initial_batch_size =
            env_count("CONSOLE_BATCH_SIZE").unwrap_or(config.initial_batch_size);

        config
    }

    /// Period of the drain timer; never zero so a re-armed drain cannot spin.
    pub fn drain_period(&self) -> Duration {
        self.drain_delay.max(Duration::from_millis(1))
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_count(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsoleConfig::default();
        assert_eq!(config.queue_tick, Duration::from_millis(50));
        assert_eq!(config.short_timeout, Duration::from_secs(2));
        assert_eq!(config.long_timeout, Duration::from_secs(4));
        assert_eq!(config.abort_after, Duration::from_secs(15));
        assert_eq!(config.poll_expiry, Duration::from_secs(5));
        assert_eq!(config.poll_cap, 5);
        assert_eq!(config.heartbeat_every, 3);
    }

    #[test]
    fn test_token_write_substitution() {
        let scripts = ProbeScripts::default();
        assert_eq!(
            scripts.token_write_for(-42),
            "console.set_session_token(-42)"
        );
    }

    #[test]
    fn test_from_env_overrides_and_fallbacks() {
        std::env::set_var("CONSOLE_SHORT_TIMEOUT_MS", "750");
        std::env::set_var("CONSOLE_POLL_CAP", "8");
        std::env::set_var("CONSOLE_ABORT_AFTER_MS", "not-a-number");
        std::env::set_var("CONSOLE_BATCH_SIZE", "0");

        let config = ConsoleConfig::from_env();
        assert_eq!(config.short_timeout, Duration::from_millis(750));
        assert_eq!(config.poll_cap, 8);
        assert_eq!(config.abort_after, Duration::from_secs(15));
        assert_eq!(config.initial_batch_size, 10);

        std::env::remove_var("CONSOLE_SHORT_TIMEOUT_MS");
        std::env::remove_var("CONSOLE_POLL_CAP");
        std::env::remove_var("CONSOLE_ABORT_AFTER_MS");
        std::env::remove_var("CONSOLE_BATCH_SIZE");
    }
}
