//! Session configuration.

use std::time::Duration;

use flywire::CodecConfig;
use flywire::DEFAULT_MAX_PAYLOAD;

use crate::serializer::Serializer;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Knobs shared by every session built from it. Both peers must agree on
/// `serializer`, `multiplexed` and `max_payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Deadline for `Context::call` when none is given.
    pub call_timeout: Duration,
    pub ping_timeout: Duration,
    /// Calls allowed in flight at once. Capped by the sequence space.
    pub max_pending: usize,
    pub max_payload: u64,
    pub multiplexed: bool,
    pub serializer: Serializer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            max_payload: DEFAULT_MAX_PAYLOAD,
            multiplexed: false,
            serializer: Serializer::Json,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Defaults overridden by `FLYRPC_*` environment variables.
    ///
    /// Unset or unparsable variables keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        let mut config = Self::default();
        if let Some(ms) = parse::<u64>(lookup("FLYRPC_CALL_TIMEOUT_MS")) {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(lookup("FLYRPC_PING_TIMEOUT_MS")) {
            config.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(lookup("FLYRPC_MAX_PENDING")) {
            config.max_pending = n;
        }
        if let Some(n) = parse(lookup("FLYRPC_MAX_PAYLOAD")) {
            config.max_payload = n;
        }
        if let Some(s) = parse(lookup("FLYRPC_SERIALIZER")) {
            config.serializer = s;
        }
        config
    }

    /// The framing half of this configuration.
    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            multiplexed: self.multiplexed,
            max_payload: self.max_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.serializer, Serializer::Json);
        assert_eq!(config.codec(), CodecConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FLYRPC_CALL_TIMEOUT_MS", "250"),
            ("FLYRPC_MAX_PENDING", "16"),
            ("FLYRPC_SERIALIZER", "msgpack"),
        ]));
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.max_pending, 16);
        assert_eq!(config.serializer, Serializer::MsgPack);
        assert_eq!(config.ping_timeout, DEFAULT_PING_TIMEOUT);
    }

    #[test]
    fn test_bad_env_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("FLYRPC_CALL_TIMEOUT_MS", "soon"),
            ("FLYRPC_SERIALIZER", "xml"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_builders() {
        let config = Config::new()
            .with_multiplexed(true)
            .with_max_payload(1024)
            .with_call_timeout(Duration::from_millis(5));
        assert!(config.codec().multiplexed);
        assert_eq!(config.codec().max_payload, 1024);
        assert_eq!(config.call_timeout, Duration::from_millis(5));
    }
}
