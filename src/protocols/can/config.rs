//! CAN client configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{CanbusError, Result};

/// Maximum interface name length including the terminating NUL (`IFNAMSIZ`).
pub const IFNAMSIZ: usize = 16;

/// CAN client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanConfig {
    /// CAN interface name (e.g., "can0").
    pub can_interface: String,

    /// Deliver protocol error frames to `read` (`CAN_RAW_ERR_FILTER`).
    pub receive_error_frames: bool,

    /// Deliver this socket's own transmitted frames to `read` (`CAN_RAW_RECV_OWN_MSGS`).
    pub receive_own_messages: bool,

    /// Receive timeout applied at connect time (`SO_RCVTIMEO`). `None` blocks forever.
    pub read_timeout: Option<Duration>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            can_interface: "can0".to_string(),
            receive_error_frames: true,
            receive_own_messages: true,
            read_timeout: None,
        }
    }
}

impl CanConfig {
    /// Default configuration for the given interface.
    pub fn new(can_interface: impl Into<String>) -> Self {
        Self {
            can_interface: can_interface.into(),
            ..Default::default()
        }
    }

    /// Set the receive timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Check the interface name against kernel limits.
    pub fn validate(&self) -> Result<()> {
        if self.can_interface.is_empty() {
            return Err(CanbusError::config("CAN interface name is empty"));
        }
        if self.can_interface.len() >= IFNAMSIZ {
            return Err(CanbusError::config(format!(
                "CAN interface name {:?} exceeds {} bytes",
                self.can_interface,
                IFNAMSIZ - 1
            )));
        }
        if self.can_interface.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
            return Err(CanbusError::config(format!(
                "CAN interface name {:?} contains invalid characters",
                self.can_interface
            )));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(CanbusError::config("read timeout must be non-zero"));
        }
        Ok(())
    }

    /// Parse a `[can]` table (or a bare parameter table) from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            can: Option<CanChannelParamsConfig>,
            #[serde(flatten)]
            bare: CanChannelParamsConfig,
        }

        let wrapper: Wrapper = toml::from_str(s)
            .map_err(|e| CanbusError::config(format!("Invalid CAN configuration: {}", e)))?;
        let params = wrapper.can.unwrap_or(wrapper.bare);
        let config = params.to_config();
        config.validate()?;
        Ok(config)
    }

    /// Build from a JSON parameter object.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let params: CanChannelParamsConfig = serde_json::from_value(value)
            .map_err(|e| CanbusError::config(format!("Invalid CAN parameters: {}", e)))?;
        let config = params.to_config();
        config.validate()?;
        Ok(config)
    }
}

/// CAN channel parameters configuration (deserialized from TOML or JSON).
///
/// # Example JSON
/// ```json
/// {
///     "interface": "can0",
///     "receive_error_frames": true,
///     "receive_own_messages": true,
///     "read_timeout_ms": 500
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanChannelParamsConfig {
    /// CAN interface name (e.g., "can0").
    #[serde(default = "default_can_interface")]
    pub interface: String,

    /// Deliver protocol error frames.
    #[serde(default = "default_true")]
    pub receive_error_frames: bool,

    /// Deliver own transmitted frames.
    #[serde(default = "default_true")]
    pub receive_own_messages: bool,

    /// Receive timeout in milliseconds (absent = block forever).
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

fn default_can_interface() -> String {
    "can0".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CanChannelParamsConfig {
    fn default() -> Self {
        Self {
            interface: default_can_interface(),
            receive_error_frames: true,
            receive_own_messages: true,
            read_timeout_ms: None,
        }
    }
}

impl CanChannelParamsConfig {
    /// Convert to CanConfig.
    pub fn to_config(&self) -> CanConfig {
        CanConfig {
            can_interface: self.interface.clone(),
            receive_error_frames: self.receive_error_frames,
            receive_own_messages: self.receive_own_messages,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Example configuration printed by `canbus example-config`.
pub const EXAMPLE_CONFIG: &str = r#"# canbus configuration

[can]
interface = "vcan0"
receive_error_frames = true
receive_own_messages = true
read_timeout_ms = 500
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CanConfig::default();
        assert_eq!(config.can_interface, "can0");
        assert!(config.receive_error_frames);
        assert!(config.receive_own_messages);
        assert_eq!(config.read_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(CanConfig::new("").validate().is_err());
        assert!(CanConfig::new("a_very_long_ifname").validate().is_err());
        assert!(CanConfig::new("can 0").validate().is_err());
        assert!(CanConfig::new("vcan0").validate().is_ok());

        let mut config = CanConfig::new("vcan0");
        config.read_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = CanConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.can_interface, "vcan0");
        assert_eq!(config.read_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_bare_toml_table() {
        let config = CanConfig::from_toml_str("interface = \"can1\"\nreceive_own_messages = false\n")
            .unwrap();
        assert_eq!(config.can_interface, "can1");
        assert!(!config.receive_own_messages);
        assert!(config.receive_error_frames);
    }

    #[test]
    fn test_json_params() {
        let config = CanConfig::from_json_value(serde_json::json!({
            "interface": "vcan1",
            "read_timeout_ms": 250
        }))
        .unwrap();
        assert_eq!(config.can_interface, "vcan1");
        assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));

        let err = CanConfig::from_json_value(serde_json::json!({ "interface": "" })).unwrap_err();
        assert!(matches!(err, CanbusError::Config(_)));
    }
}
