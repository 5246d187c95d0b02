//! `ManagerConfig` collects every option enumerated for manager construction. It is plain data:
//! validation happens once, at construction, via `ManagerConfig::validate`.

use serde_derive::Deserialize;

/// Selects which family of server this manager backs, and whether it uses a blocking
/// (`Socket`) or non-blocking (`Channel`) transport implementation. Only `Socket` transports
/// are implemented by this crate; selecting `Channel` is a configuration error (see
/// `ManagerConfig::validate`) rather than a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Internal,
    Tcp,
    Udp,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Socket,
    Channel,
}

impl Default for TransportKind {
    fn default() -> TransportKind {
        TransportKind::Socket
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid manager configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub server_type: ServerType,
    pub transport: TransportKind,
    pub connection_check_timeout_ms: u64,
    pub global_connection_check: bool,
    pub use_handler_thread: bool,
    pub packet_queue_capacity: Option<usize>,
    pub encode_buffer_initial_size: usize,
    pub datagram_packet_max_size: usize,
    pub use_encoder_thread_pool: bool,
    pub use_decoder_thread_pool: bool,
    pub register_internal_server: bool,
    pub allow_detection: bool,
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            server_type: ServerType::Tcp,
            transport: TransportKind::Socket,
            connection_check_timeout_ms: 30_000,
            global_connection_check: true,
            use_handler_thread: false,
            packet_queue_capacity: None,
            encode_buffer_initial_size: 256,
            datagram_packet_max_size: 65_507,
            use_encoder_thread_pool: false,
            use_decoder_thread_pool: false,
            register_internal_server: false,
            allow_detection: false,
        }
    }
}

impl ManagerConfig {
    /// Loads a `ManagerConfig` from a TOML fragment, following the same `serdeconv` pattern
    /// used for logging config.
    pub fn from_toml_str(toml: &str) -> Result<ManagerConfig, serdeconv::Error> {
        netsupport::config::from_toml_str(toml)
    }

    /// Validates this configuration, surfacing configuration errors at manager construction
    /// rather than as a later runtime condition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport == TransportKind::Channel {
            return Err(ConfigError(
                "transport = \"channel\" selects the non-blocking implementation, which this build does not provide; use transport = \"socket\"".to_string(),
            ));
        }

        if self.connection_check_timeout_ms == 0 {
            return Err(ConfigError("connection_check_timeout_ms must be greater than zero".to_string()));
        }

        if self.datagram_packet_max_size == 0 {
            return Err(ConfigError("datagram_packet_max_size must be greater than zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn channel_transport_is_rejected() {
        let config = ManagerConfig {
            transport: TransportKind::Channel,
            ..ManagerConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ManagerConfig {
            connection_check_timeout_ms: 0,
            ..ManagerConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let config: ManagerConfig = ManagerConfig::from_toml_str(
            r#"
            server_type = "tcp"
            connection_check_timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.server_type, ServerType::Tcp);
        assert_eq!(config.connection_check_timeout_ms, 5000);
        // Untouched fields keep their defaults.
        assert_eq!(config.datagram_packet_max_size, 65_507);
    }
}
