//! Configuration types for the worker client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WorkerError};

/// Configuration for the Client (reservation loop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// beanstalkd address, `host:port`.
    pub addr: String,
    /// Tube reserved from when the handler does not route by tube.
    pub default_tube: String,
    /// How long to wait after a cycle that found no job on any tube.
    #[serde(with = "duration_millis")]
    pub idle_wait: Duration,
    /// Wait passed to each per-tube reserve-with-timeout.
    #[serde(with = "duration_millis")]
    pub reserve_timeout: Duration,
    /// Stop on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11300".to_string(),
            default_tube: "default".to_string(),
            idle_wait: Duration::from_secs(1),
            reserve_timeout: Duration::ZERO,
            handle_signals: true,
        }
    }
}

impl ClientConfig {
    /// Create a new ClientConfig for the given address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Create a new builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Check the configuration before a run.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(WorkerError::Config("address must not be empty".to_string()));
        }
        if self.default_tube.is_empty() {
            return Err(WorkerError::Config(
                "default tube must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Set the default tube.
    pub fn default_tube(mut self, tube: impl Into<String>) -> Self {
        self.config.default_tube = tube.into();
        self
    }

    /// Set the idle wait between empty cycles.
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.config.idle_wait = wait;
        self
    }

    /// Set the per-tube reserve timeout.
    pub fn reserve_timeout(mut self, timeout: Duration) -> Self {
        self.config.reserve_timeout = timeout;
        self
    }

    /// Enable or disable the SIGINT/SIGTERM listener.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    /// Build the ClientConfig.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Serde module for Duration as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.addr, "127.0.0.1:11300");
        assert_eq!(config.default_tube, "default");
        assert_eq!(config.idle_wait, Duration::from_secs(1));
        assert_eq!(config.reserve_timeout, Duration::ZERO);
        assert!(config.handle_signals);
    }

    #[test]
    fn test_client_config_new_keeps_defaults() {
        let config = ClientConfig::new("10.0.0.5:11300");
        assert_eq!(config.addr, "10.0.0.5:11300");
        assert_eq!(config.default_tube, "default");
    }

    #[test]
    fn test_client_config_builder_fluent_chain() {
        let config = ClientConfig::builder()
            .addr("beanstalk:11300")
            .default_tube("emails")
            .idle_wait(Duration::from_millis(250))
            .reserve_timeout(Duration::from_secs(1))
            .handle_signals(false)
            .build();

        assert_eq!(config.addr, "beanstalk:11300");
        assert_eq!(config.default_tube, "emails");
        assert_eq!(config.idle_wait, Duration::from_millis(250));
        assert_eq!(config.reserve_timeout, Duration::from_secs(1));
        assert!(!config.handle_signals);
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        assert!(ClientConfig::default().validate().is_ok());

        let err = ClientConfig::builder().addr("").build().validate();
        assert!(matches!(err, Err(WorkerError::Config(_))));

        let err = ClientConfig::builder().default_tube("").build().validate();
        assert!(matches!(err, Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"addr":"queue:11300","idle_wait":500}"#).unwrap();
        assert_eq!(config.addr, "queue:11300");
        assert_eq!(config.idle_wait, Duration::from_millis(500));
        assert_eq!(config.default_tube, "default");
        assert!(config.handle_signals);
    }

    #[test]
    fn test_serialize_durations_as_millis() {
        let config = ClientConfig::builder()
            .idle_wait(Duration::from_secs(2))
            .build();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["idle_wait"], 2000);
        assert_eq!(json["reserve_timeout"], 0);
    }
}
