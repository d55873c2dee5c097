//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ChannelRef;

/// Default overlay gateway port.
pub const DEFAULT_PORT: u16 = 3001;

/// Environment variable holding the bot token when none is configured.
pub const DEFAULT_TOKEN_ENV: &str = "DISCORD_TOKEN";

/// Top-level VoxBridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Discord bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token_env: Option<String>,
    /// Voice channel to join as soon as the bot is connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_join: Option<AutoJoinConfig>,
    /// REST API base, overridable for proxies.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            bot_token_env: None,
            auto_join: None,
            api_base: default_api_base(),
        }
    }
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

impl DiscordConfig {
    /// Resolve the bot token: `bot_token` first, then `bot_token_env`
    /// (defaulting to `DISCORD_TOKEN`).
    pub fn resolve_bot_token(&self) -> Option<String> {
        let env = self
            .bot_token_env
            .clone()
            .or_else(|| Some(DEFAULT_TOKEN_ENV.to_string()));
        resolve_secret_field(&self.bot_token, &env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoJoinConfig {
    pub guild_id: String,
    pub channel_id: String,
}

impl AutoJoinConfig {
    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef::new(self.guild_id.clone(), self.channel_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Voice link timing and self-state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// How long a join waits for the link to become ready.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// How long a disconnected link may take to start reconnecting.
    #[serde(default = "default_reconnect_window_ms")]
    pub reconnect_window_ms: u64,

    #[serde(default = "default_true")]
    pub self_mute: bool,

    #[serde(default)]
    pub self_deaf: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            reconnect_window_ms: default_reconnect_window_ms(),
            self_mute: true,
            self_deaf: false,
        }
    }
}

impl VoiceConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }
}

fn default_ready_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_window_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxbridge_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

/// Resolve a secret from a direct value, falling back to an environment variable.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxBridgeError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(DEFAULT_PORT)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn voice(&self) -> VoiceConfig {
        self.voice.clone().unwrap_or_default()
    }

    pub fn discord(&self) -> DiscordConfig {
        self.discord.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.discord().resolve_bot_token().is_none() {
            warnings.push(format!(
                "No Discord bot token configured (set discord.bot_token or {})",
                self.discord
                    .as_ref()
                    .and_then(|d| d.bot_token_env.as_deref())
                    .unwrap_or(DEFAULT_TOKEN_ENV)
            ));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(voice) = &self.voice {
            if voice.ready_timeout_ms == 0 {
                errors.push("voice.ready_timeout_ms must be greater than 0".to_string());
            }
            if voice.reconnect_window_ms == 0 {
                errors.push("voice.reconnect_window_ms must be greater than 0".to_string());
            }
        }

        if let Some(logging) = &self.logging {
            if !matches!(logging.format.as_str(), "plain" | "json") {
                warnings.push(format!(
                    "Unknown logging.format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for VoxBridge data: `~/.voxbridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxbridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_VB_PORT_VALUE", "4100") };
        let input = r#"{"port": "${TEST_VB_PORT_VALUE}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("4100"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VB_PORT_VALUE") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VB_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 3001);
        assert_eq!(config.gateway_bind(), "0.0.0.0");
        let voice = config.voice();
        assert_eq!(voice.ready_timeout(), Duration::from_secs(20));
        assert_eq!(voice.reconnect_window(), Duration::from_secs(5));
        assert!(voice.self_mute);
        assert!(!voice.self_deaf);
    }

    #[test]
    fn test_discord_resolve_token_prefers_direct() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_VB_TOKEN_A", "from-env") };
        let discord = DiscordConfig {
            bot_token: Some("direct".into()),
            bot_token_env: Some("TEST_VB_TOKEN_A".into()),
            ..Default::default()
        };
        assert_eq!(discord.resolve_bot_token(), Some("direct".into()));

        let discord = DiscordConfig {
            bot_token: None,
            bot_token_env: Some("TEST_VB_TOKEN_A".into()),
            ..Default::default()
        };
        assert_eq!(discord.resolve_bot_token(), Some("from-env".into()));
        unsafe { std::env::remove_var("TEST_VB_TOKEN_A") };
    }

    #[test]
    fn test_discord_missing_token() {
        let discord = DiscordConfig {
            bot_token: Some(String::new()),
            bot_token_env: Some("TEST_VB_TOKEN_UNSET".into()),
            ..Default::default()
        };
        assert_eq!(discord.resolve_bot_token(), None);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.discord.is_none());
        assert_eq!(config.gateway_port(), 3001);
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // overlay bridge
                gateway: { port: 4000 },
                voice: { ready_timeout_ms: 1500 },
                discord: { auto_join: { guild_id: "g1", channel_id: "c37" } },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 4000);
        assert_eq!(config.voice().ready_timeout_ms, 1500);
        assert_eq!(config.voice().reconnect_window_ms, 5000);
        let discord = config.discord();
        assert_eq!(discord.api_base, "https://discord.com/api/v10");
        assert_eq!(
            discord.auto_join.map(|a| a.channel_ref()),
            Some(ChannelRef::new("g1", "c37"))
        );
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ gateway: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::VoxBridgeError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = Config {
            gateway: Some(GatewayConfig { port: 0, bind: None }),
            voice: Some(VoiceConfig {
                ready_timeout_ms: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (_, errors) = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }
}
