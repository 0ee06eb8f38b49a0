use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::{EnumeratorConfig, OrchestratorConfig, RetryPolicy, WELCOME_MESSAGE_KIND};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub slack: SlackConfig,
    pub broadcast: BroadcastConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub app_token: SecretString,
    pub bot_token: SecretString,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub welcome_channel_id: String,
    pub send_dm: bool,
    /// Slack user notified when someone presses "Falar com RH/DP".
    pub rh_user_id: Option<String>,
    pub message_kind: String,
    pub send_interval_ms: u64,
    pub cache_ttl_hours: u64,
    pub sweep_interval_minutes: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub page_size: u32,
    pub lookup_batch_size: usize,
    pub lookup_batch_pause_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub slack_app_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_api_base_url: Option<String>,
    pub welcome_channel_id: Option<String>,
    pub send_dm: Option<bool>,
    pub rh_user_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slack: SlackConfig {
                app_token: String::new().into(),
                bot_token: String::new().into(),
                api_base_url: "https://slack.com/api".to_string(),
                request_timeout_secs: 30,
            },
            broadcast: BroadcastConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            welcome_channel_id: String::new(),
            send_dm: true,
            rh_user_id: None,
            message_kind: WELCOME_MESSAGE_KIND.to_string(),
            send_interval_ms: 1_000,
            cache_ttl_hours: 24,
            sweep_interval_minutes: 60,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            page_size: 1_000,
            lookup_batch_size: 10,
            lookup_batch_pause_ms: 200,
        }
    }
}

impl BroadcastConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_retries: self.max_retries, base_delay_ms: self.retry_base_delay_ms }
    }

    pub fn enumerator_config(&self) -> EnumeratorConfig {
        EnumeratorConfig {
            page_size: self.page_size,
            batch_size: self.lookup_batch_size,
            batch_pause: Duration::from_millis(self.lookup_batch_pause_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            message_kind: self.message_kind.clone(),
            send_interval: Duration::from_millis(self.send_interval_ms),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours.saturating_mul(60 * 60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.saturating_mul(60))
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("perkbot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(slack) = patch.slack {
            if let Some(slack_app_token_value) = slack.app_token {
                self.slack.app_token = secret_value(slack_app_token_value);
            }
            if let Some(slack_bot_token_value) = slack.bot_token {
                self.slack.bot_token = secret_value(slack_bot_token_value);
            }
            if let Some(api_base_url) = slack.api_base_url {
                self.slack.api_base_url = api_base_url;
            }
            if let Some(request_timeout_secs) = slack.request_timeout_secs {
                self.slack.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(broadcast) = patch.broadcast {
            let target = &mut self.broadcast;
            if let Some(welcome_channel_id) = broadcast.welcome_channel_id {
                target.welcome_channel_id = welcome_channel_id;
            }
            if let Some(send_dm) = broadcast.send_dm {
                target.send_dm = send_dm;
            }
            if let Some(rh_user_id) = broadcast.rh_user_id {
                target.rh_user_id = non_blank(rh_user_id);
            }
            if let Some(message_kind) = broadcast.message_kind {
                target.message_kind = message_kind;
            }
            if let Some(send_interval_ms) = broadcast.send_interval_ms {
                target.send_interval_ms = send_interval_ms;
            }
            if let Some(cache_ttl_hours) = broadcast.cache_ttl_hours {
                target.cache_ttl_hours = cache_ttl_hours;
            }
            if let Some(sweep_interval_minutes) = broadcast.sweep_interval_minutes {
                target.sweep_interval_minutes = sweep_interval_minutes;
            }
            if let Some(max_retries) = broadcast.max_retries {
                target.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = broadcast.retry_base_delay_ms {
                target.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(page_size) = broadcast.page_size {
                target.page_size = page_size;
            }
            if let Some(lookup_batch_size) = broadcast.lookup_batch_size {
                target.lookup_batch_size = lookup_batch_size;
            }
            if let Some(lookup_batch_pause_ms) = broadcast.lookup_batch_pause_ms {
                target.lookup_batch_pause_ms = lookup_batch_pause_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // the unprefixed names are what existing deployments export
        let app_token =
            read_env("PERKBOT_SLACK_APP_TOKEN").or_else(|| read_env("SLACK_APP_TOKEN"));
        if let Some(value) = app_token {
            self.slack.app_token = secret_value(value);
        }
        let bot_token =
            read_env("PERKBOT_SLACK_BOT_TOKEN").or_else(|| read_env("SLACK_BOT_TOKEN"));
        if let Some(value) = bot_token {
            self.slack.bot_token = secret_value(value);
        }
        if let Some(value) = read_env("PERKBOT_SLACK_API_BASE_URL") {
            self.slack.api_base_url = value;
        }
        if let Some(value) = read_env("PERKBOT_SLACK_REQUEST_TIMEOUT_SECS") {
            self.slack.request_timeout_secs =
                parse_u64("PERKBOT_SLACK_REQUEST_TIMEOUT_SECS", &value)?;
        }

        let welcome_channel = read_env("PERKBOT_BROADCAST_WELCOME_CHANNEL_ID")
            .or_else(|| read_env("WELCOME_CHANNEL_ID"));
        if let Some(value) = welcome_channel {
            self.broadcast.welcome_channel_id = value;
        }
        if let Some((key, value)) = read_env_pair("PERKBOT_BROADCAST_SEND_DM", "SEND_DM") {
            self.broadcast.send_dm = parse_bool(key, &value)?;
        }
        if let Some(value) =
            read_env("PERKBOT_BROADCAST_RH_USER_ID").or_else(|| read_env("RH_USER_ID"))
        {
            self.broadcast.rh_user_id = non_blank(value);
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_MESSAGE_KIND") {
            self.broadcast.message_kind = value;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_SEND_INTERVAL_MS") {
            self.broadcast.send_interval_ms =
                parse_u64("PERKBOT_BROADCAST_SEND_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_CACHE_TTL_HOURS") {
            self.broadcast.cache_ttl_hours =
                parse_u64("PERKBOT_BROADCAST_CACHE_TTL_HOURS", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_SWEEP_INTERVAL_MINUTES") {
            self.broadcast.sweep_interval_minutes =
                parse_u64("PERKBOT_BROADCAST_SWEEP_INTERVAL_MINUTES", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_MAX_RETRIES") {
            self.broadcast.max_retries = parse_u32("PERKBOT_BROADCAST_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_RETRY_BASE_DELAY_MS") {
            self.broadcast.retry_base_delay_ms =
                parse_u64("PERKBOT_BROADCAST_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_PAGE_SIZE") {
            self.broadcast.page_size = parse_u32("PERKBOT_BROADCAST_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_LOOKUP_BATCH_SIZE") {
            self.broadcast.lookup_batch_size =
                parse_usize("PERKBOT_BROADCAST_LOOKUP_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_BROADCAST_LOOKUP_BATCH_PAUSE_MS") {
            self.broadcast.lookup_batch_pause_ms =
                parse_u64("PERKBOT_BROADCAST_LOOKUP_BATCH_PAUSE_MS", &value)?;
        }

        if let Some(value) = read_env("PERKBOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PERKBOT_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("PERKBOT_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("PERKBOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PERKBOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("PERKBOT_LOGGING_LEVEL").or_else(|| read_env("PERKBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PERKBOT_LOGGING_FORMAT").or_else(|| read_env("PERKBOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(slack_app_token) = overrides.slack_app_token {
            self.slack.app_token = secret_value(slack_app_token);
        }
        if let Some(slack_bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = secret_value(slack_bot_token);
        }
        if let Some(api_base_url) = overrides.slack_api_base_url {
            self.slack.api_base_url = api_base_url;
        }
        if let Some(welcome_channel_id) = overrides.welcome_channel_id {
            self.broadcast.welcome_channel_id = welcome_channel_id;
        }
        if let Some(send_dm) = overrides.send_dm {
            self.broadcast.send_dm = send_dm;
        }
        if let Some(rh_user_id) = overrides.rh_user_id {
            self.broadcast.rh_user_id = non_blank(rh_user_id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_slack(&self.slack)?;
        validate_broadcast(&self.broadcast)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Non-fatal findings. Returned instead of logged because configuration
    /// loads before the subscriber is installed.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let channel = self.broadcast.welcome_channel_id.trim();
        if !looks_like_channel_id(channel) {
            warnings.push(format!(
                "broadcast.welcome_channel_id `{channel}` does not look like a channel id (expected `C` followed by uppercase letters or digits)"
            ));
        }
        if !self.broadcast.send_dm {
            warnings.push(
                "broadcast.send_dm is false; welcome messages will be recorded but not sent"
                    .to_string(),
            );
        }
        warnings
    }
}

fn looks_like_channel_id(value: &str) -> bool {
    value
        .strip_prefix('C')
        .is_some_and(|rest| {
            !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
        })
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("perkbot.toml"), PathBuf::from("config/perkbot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let app_token = slack.app_token.expose_secret();
    if app_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.app_token is required. Get it from https://api.slack.com/apps > Your App > Basic Information > App-Level Tokens".to_string()
        ));
    }
    if !app_token.starts_with("xapp-") {
        let hint = if app_token.starts_with("xoxb-") {
            " (hint: you may have used the bot token instead of the app token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.app_token must start with `xapp-`{hint}. Get it from https://api.slack.com/apps"
        )));
    }

    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used the app token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-`{hint}. Get it from https://api.slack.com/apps"
        )));
    }

    let base_url = slack.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "slack.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if slack.request_timeout_secs == 0 || slack.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "slack.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_broadcast(broadcast: &BroadcastConfig) -> Result<(), ConfigError> {
    if broadcast.welcome_channel_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "broadcast.welcome_channel_id is required (right-click the channel in Slack > View channel details > copy the ID)".to_string(),
        ));
    }

    if broadcast.message_kind.trim().is_empty() {
        return Err(ConfigError::Validation(
            "broadcast.message_kind must not be empty".to_string(),
        ));
    }

    if broadcast.cache_ttl_hours == 0 {
        return Err(ConfigError::Validation(
            "broadcast.cache_ttl_hours must be greater than zero".to_string(),
        ));
    }

    if broadcast.sweep_interval_minutes == 0 {
        return Err(ConfigError::Validation(
            "broadcast.sweep_interval_minutes must be greater than zero".to_string(),
        ));
    }

    if broadcast.page_size == 0 || broadcast.page_size > crate::broadcast::enumerator::MAX_PAGE_SIZE {
        return Err(ConfigError::Validation(
            "broadcast.page_size must be in range 1..=1000".to_string(),
        ));
    }

    if broadcast.lookup_batch_size == 0 {
        return Err(ConfigError::Validation(
            "broadcast.lookup_batch_size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_pair(primary: &'static str, fallback: &'static str) -> Option<(&'static str, String)> {
    read_env(primary)
        .map(|value| (primary, value))
        .or_else(|| read_env(fallback).map(|value| (fallback, value)))
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().to_ascii_lowercase().parse::<bool>().map_err(|_| {
        ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    slack: Option<SlackPatch>,
    broadcast: Option<BroadcastPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    app_token: Option<String>,
    bot_token: Option<String>,
    api_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BroadcastPatch {
    welcome_channel_id: Option<String>,
    send_dm: Option<bool>,
    rh_user_id: Option<String>,
    message_kind: Option<String>,
    send_interval_ms: Option<u64>,
    cache_ttl_hours: Option<u64>,
    sweep_interval_minutes: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    page_size: Option<u32>,
    lookup_batch_size: Option<usize>,
    lookup_batch_pause_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
