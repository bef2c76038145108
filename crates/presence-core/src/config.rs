use crate::document::DEFAULT_TEXT_NAME;
use crate::roster::{DedupKey, RosterConfig};
use crate::state::is_hex_color;
use serde::{Deserialize, Serialize};

/// Presence configuration.
///
/// Native hosts load it from environment variables; browser hosts pass the
/// same structure as a JS object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceConfig {
    /// Address of the presence transport
    pub endpoint: String,
    /// Room shared by every participant of one document
    pub room: String,
    pub display_name: String,
    /// `#rrggbb`; a random color is generated when absent
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_text_name")]
    pub text_name: String,
    #[serde(default)]
    pub roster: RosterConfig,
}

fn default_text_name() -> String {
    DEFAULT_TEXT_NAME.to_string()
}

impl PresenceConfig {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            display_name: display_name.into(),
            color: None,
            text_name: default_text_name(),
            roster: RosterConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `PRESENCE_ENDPOINT`: transport address
    /// - `PRESENCE_ROOM`: room name
    /// - `PRESENCE_DISPLAY_NAME`: name shown to other participants
    ///
    /// Optional:
    /// - `PRESENCE_COLOR`: `#rrggbb`
    /// - `PRESENCE_TEXT_NAME`: shared text container (default `monaco`)
    /// - `PRESENCE_ROSTER_EXCLUDE`: comma-separated names hidden from the roster
    /// - `PRESENCE_ROSTER_DEDUP`: `name-and-color`, `name` or `none`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let mut config = Self::new(
            required("PRESENCE_ENDPOINT")?,
            required("PRESENCE_ROOM")?,
            required("PRESENCE_DISPLAY_NAME")?,
        );

        config.color = lookup("PRESENCE_COLOR").filter(|v| !v.is_empty());
        if let Some(name) = lookup("PRESENCE_TEXT_NAME").filter(|v| !v.is_empty()) {
            config.text_name = name;
        }
        if let Some(names) = lookup("PRESENCE_ROSTER_EXCLUDE") {
            config.roster.exclude_names = names
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(dedup) = lookup("PRESENCE_ROSTER_DEDUP") {
            config.roster.dedup = dedup
                .parse::<DedupKey>()
                .map_err(|e| ConfigError::Invalid("PRESENCE_ROSTER_DEDUP", e.to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check required values and the color form.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if self.room.trim().is_empty() {
            return Err(ConfigError::Missing("room"));
        }
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::Missing("displayName"));
        }
        if self.text_name.is_empty() {
            return Err(ConfigError::Missing("textName"));
        }
        if let Some(color) = &self.color {
            if !is_hex_color(color) {
                return Err(ConfigError::Invalid("color", format!("{} is not #rrggbb", color)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("Invalid {0}: {1}")]
    Invalid(&'static str, String),
}
