//! Connector settings resolved from an event-bus instance config.
//!
//! The instance config is an untyped map. Parsing happens once, here, and
//! produces immutable settings. Synonym precedence (later wins when both
//! keys are present):
//!
//! | Setting  | Keys, lowest to highest precedence |
//! |----------|------------------------------------|
//! | address  | `url`, `server`                    |
//! | user     | `user`, `username`                 |
//! | password | `pass`, `password`                 |
//! | token    | `token`                            |
//! | stream   | `stream` (JetStream only)          |
//!
//! Unrecognized keys are ignored. A recognized key holding a non-string
//! value is rejected.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::ConfigError;
use crate::transport::ConnectOptions;

/// Default broker address.
pub const DEFAULT_URL: &str = "nats://localhost:4222";
/// Stream prefix used when neither the instance nor the application names one.
pub const DEFAULT_STREAM_PREFIX: &str = "EVENTWIRE";
/// Suffix separating the event stream from a queue stream with the same prefix.
pub const EVENT_STREAM_SUFFIX: &str = "E";

/// Configuration of one named event-bus connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Driver name the connection is created with (`nats`, `natsjs`, ...).
    pub driver: String,
    /// Name prefix configured for the instance.
    pub prefix: String,
    /// Driver-specific settings.
    pub setting: HashMap<String, Value>,
}

impl InstanceConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.setting.insert(key.into(), value.into());
        self
    }

    /// String value of `key`, if present. `null` counts as absent.
    fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.setting.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ConfigError::InvalidType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// First present value among `keys`, scanning from highest precedence.
    fn first_of(&self, keys: &[&str]) -> Result<Option<String>, ConfigError> {
        for key in keys.iter().rev() {
            if let Some(value) = self.string(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Settings shared by both connectors.
#[derive(Clone, PartialEq, Eq)]
pub struct NatsSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl std::fmt::Debug for NatsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            username: None,
            password: None,
            token: None,
        }
    }
}

impl NatsSettings {
    pub fn from_instance(instance: &InstanceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            url: instance
                .first_of(&["url", "server"])?
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            username: instance.first_of(&["user", "username"])?,
            password: instance.first_of(&["pass", "password"])?,
            token: instance.string("token")?,
        })
    }

    /// Connection options for the broker client.
    ///
    /// Empty credentials are not sent. Username/password are only applied
    /// when both are set.
    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.url.clone());
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            options = options.with_token(token.clone());
        }
        let user = self.username.as_ref().filter(|u| !u.is_empty());
        let password = self.password.as_ref().filter(|p| !p.is_empty());
        if let (Some(user), Some(password)) = (user, password) {
            options = options.with_user_password(user.clone(), password.clone());
        }
        options
    }
}

/// Settings for the JetStream connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetStreamSettings {
    pub connection: NatsSettings,
    /// Stream name; also the first token of every subject the connector uses.
    pub stream: String,
}

impl JetStreamSettings {
    /// Resolve settings. Stream prefix precedence, lowest first: the
    /// default, `app_name`, the instance prefix, the `stream` setting.
    /// The chosen prefix is uppercased and suffixed with `E`.
    pub fn from_instance(
        instance: &InstanceConfig,
        app_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut prefix = DEFAULT_STREAM_PREFIX.to_string();
        if let Some(name) = app_name.filter(|n| !n.is_empty()) {
            prefix = name.to_uppercase();
        }
        if !instance.prefix.is_empty() {
            prefix = instance.prefix.to_uppercase();
        }
        if let Some(stream) = instance.string("stream")? {
            prefix = stream.to_uppercase();
        }

        Ok(Self {
            connection: NatsSettings::from_instance(instance)?,
            stream: format!("{}{}", prefix, EVENT_STREAM_SUFFIX),
        })
    }

    /// Subject pattern the stream captures.
    pub fn subject_pattern(&self) -> String {
        format!("{}.*", self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_settings_empty() {
        let settings = NatsSettings::from_instance(&InstanceConfig::new("nats")).unwrap();
        assert_eq!(settings, NatsSettings::default());
        assert_eq!(settings.url, "nats://localhost:4222");
    }

    #[test]
    fn test_server_overrides_url() {
        let instance = InstanceConfig::new("nats")
            .with_setting("url", "nats://a:4222")
            .with_setting("server", "nats://b:4222");
        let settings = NatsSettings::from_instance(&instance).unwrap();
        assert_eq!(settings.url, "nats://b:4222");
    }

    #[test]
    fn test_long_credential_keys_override_short_ones() {
        let instance = InstanceConfig::new("nats")
            .with_setting("user", "short")
            .with_setting("username", "long")
            .with_setting("pass", "p1")
            .with_setting("password", "p2");
        let settings = NatsSettings::from_instance(&instance).unwrap();
        assert_eq!(settings.username.as_deref(), Some("long"));
        assert_eq!(settings.password.as_deref(), Some("p2"));
    }

    #[test]
    fn test_short_keys_used_alone() {
        let instance = InstanceConfig::new("nats")
            .with_setting("user", "u")
            .with_setting("pass", "p");
        let settings = NatsSettings::from_instance(&instance).unwrap();
        assert_eq!(
            settings.connect_options().user_password,
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[test]
    fn test_non_string_value_rejected() {
        let instance = InstanceConfig::new("nats").with_setting("url", json!(4222));
        let err = NatsSettings::from_instance(&instance).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { ref key, .. } if key == "url"));
    }

    #[test]
    fn test_null_treated_as_absent() {
        let instance = InstanceConfig::new("nats").with_setting("url", Value::Null);
        let settings = NatsSettings::from_instance(&instance).unwrap();
        assert_eq!(settings.url, DEFAULT_URL);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let instance = InstanceConfig::new("nats").with_setting("replicas", json!(3));
        assert!(NatsSettings::from_instance(&instance).is_ok());
    }

    #[test]
    fn test_user_without_password_not_sent() {
        let instance = InstanceConfig::new("nats").with_setting("username", "u");
        let options = NatsSettings::from_instance(&instance)
            .unwrap()
            .connect_options();
        assert!(options.user_password.is_none());
    }

    #[test]
    fn test_token_sent() {
        let instance = InstanceConfig::new("natsjs").with_setting("token", "t0k");
        let options = NatsSettings::from_instance(&instance)
            .unwrap()
            .connect_options();
        assert_eq!(options.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn test_stream_defaults_with_suffix() {
        let settings =
            JetStreamSettings::from_instance(&InstanceConfig::new("natsjs"), None).unwrap();
        assert_eq!(settings.stream, "EVENTWIREE");
        assert_eq!(settings.subject_pattern(), "EVENTWIREE.*");
    }

    #[test]
    fn test_stream_prefix_precedence() {
        let instance = InstanceConfig::new("natsjs");
        let settings = JetStreamSettings::from_instance(&instance, Some("shop")).unwrap();
        assert_eq!(settings.stream, "SHOPE");

        let instance = instance.with_prefix("app");
        let settings = JetStreamSettings::from_instance(&instance, Some("shop")).unwrap();
        assert_eq!(settings.stream, "APPE");

        let instance = instance.with_setting("stream", "orders");
        let settings = JetStreamSettings::from_instance(&instance, Some("shop")).unwrap();
        assert_eq!(settings.stream, "ORDERSE");
    }

    #[test]
    fn test_empty_app_name_ignored() {
        let settings =
            JetStreamSettings::from_instance(&InstanceConfig::new("natsjs"), Some("")).unwrap();
        assert_eq!(settings.stream, "EVENTWIREE");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let instance = InstanceConfig::new("nats")
            .with_setting("password", "hunter2")
            .with_setting("token", "t0k");
        let printed = format!("{:?}", NatsSettings::from_instance(&instance).unwrap());
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("t0k"));
    }
}
