use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub slack: SlackConfig,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub signing_secret: Option<SecretString>,
    pub app_level_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Explicitly requested mode. `None` means infer from the configured tokens.
    pub mode: Option<TransportMode>,
    pub listen_address: String,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub ack_window_ms: u64,
    pub handler_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `0` disables the health endpoint.
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Session,
    Listener,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Listener => "listener",
        }
    }
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
    pub bot_token: Option<String>,
    pub signing_secret: Option<String>,
    pub app_level_token: Option<String>,
    pub transport_mode: Option<TransportMode>,
    pub listen_address: Option<String>,
    pub handler_timeout_ms: Option<u64>,
    pub health_check_port: Option<u16>,
    pub log_level: Option<String>,
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
                bot_token: String::new().into(),
                signing_secret: None,
                app_level_token: None,
            },
            transport: TransportConfig { mode: None, listen_address: "0.0.0.0:3000".to_string() },
            dispatch: DispatchConfig {
                ack_window_ms: 3_000,
                handler_timeout_ms: 2_500,
                shutdown_grace_secs: 5,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "listener" => Ok(Self::Listener),
            other => Err(ConfigError::Validation(format!(
                "unsupported transport mode `{other}` (expected session|listener)"
            ))),
        }
    }
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("greeter.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// The mode the process runs in: the explicit setting, or session mode
    /// whenever an app-level token is present and listener mode otherwise.
    pub fn transport_mode(&self) -> TransportMode {
        if let Some(mode) = self.transport.mode {
            return mode;
        }

        let has_app_token = self
            .slack
            .app_level_token
            .as_ref()
            .map(|token| !token.expose_secret().trim().is_empty())
            .unwrap_or(false);
        if has_app_token {
            TransportMode::Session
        } else {
            TransportMode::Listener
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(slack) = patch.slack {
            if let Some(bot_token) = slack.bot_token {
                self.slack.bot_token = secret_value(bot_token);
            }
            if let Some(signing_secret) = slack.signing_secret {
                self.slack.signing_secret = Some(secret_value(signing_secret));
            }
            if let Some(app_level_token) = slack.app_level_token {
                self.slack.app_level_token = Some(secret_value(app_level_token));
            }
        }

        if let Some(transport) = patch.transport {
            if let Some(mode) = transport.mode {
                self.transport.mode = Some(mode);
            }
            if let Some(listen_address) = transport.listen_address {
                self.transport.listen_address = listen_address;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(ack_window_ms) = dispatch.ack_window_ms {
                self.dispatch.ack_window_ms = ack_window_ms;
            }
            if let Some(handler_timeout_ms) = dispatch.handler_timeout_ms {
                self.dispatch.handler_timeout_ms = handler_timeout_ms;
            }
            if let Some(shutdown_grace_secs) = dispatch.shutdown_grace_secs {
                self.dispatch.shutdown_grace_secs = shutdown_grace_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
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
        if let Some(value) = read_env("BOT_TOKEN").or_else(|| read_env("SLACK_BOT_TOKEN")) {
            self.slack.bot_token = secret_value(value);
        }
        if let Some(value) =
            read_env("SIGNING_SECRET").or_else(|| read_env("SLACK_SIGNING_SECRET"))
        {
            self.slack.signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("APP_LEVEL_TOKEN").or_else(|| read_env("SLACK_APP_TOKEN")) {
            self.slack.app_level_token = Some(secret_value(value));
        }

        if let Some(value) = read_env("TRANSPORT_MODE") {
            self.transport.mode = Some(value.parse()?);
        }
        if let Some(value) = read_env("LISTEN_ADDRESS") {
            self.transport.listen_address = value;
        } else if let Some(value) = read_env("PORT") {
            let port = parse_u16("PORT", &value)?;
            self.transport.listen_address = format!("0.0.0.0:{port}");
        }

        if let Some(value) = read_env("GREETER_ACK_WINDOW_MS") {
            self.dispatch.ack_window_ms = parse_u64("GREETER_ACK_WINDOW_MS", &value)?;
        }
        if let Some(value) = read_env("GREETER_HANDLER_TIMEOUT_MS") {
            self.dispatch.handler_timeout_ms = parse_u64("GREETER_HANDLER_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("GREETER_SHUTDOWN_GRACE_SECS") {
            self.dispatch.shutdown_grace_secs = parse_u64("GREETER_SHUTDOWN_GRACE_SECS", &value)?;
        }

        if let Some(value) = read_env("GREETER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("GREETER_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("GREETER_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level =
            read_env("GREETER_LOGGING_LEVEL").or_else(|| read_env("GREETER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("GREETER_LOGGING_FORMAT").or_else(|| read_env("GREETER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bot_token) = overrides.bot_token {
            self.slack.bot_token = secret_value(bot_token);
        }
        if let Some(signing_secret) = overrides.signing_secret {
            self.slack.signing_secret = Some(secret_value(signing_secret));
        }
        if let Some(app_level_token) = overrides.app_level_token {
            self.slack.app_level_token = Some(secret_value(app_level_token));
        }
        if let Some(mode) = overrides.transport_mode {
            self.transport.mode = Some(mode);
        }
        if let Some(listen_address) = overrides.listen_address {
            self.transport.listen_address = listen_address;
        }
        if let Some(handler_timeout_ms) = overrides.handler_timeout_ms {
            self.dispatch.handler_timeout_ms = handler_timeout_ms;
        }
        if let Some(health_check_port) = overrides.health_check_port {
            self.server.health_check_port = health_check_port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_slack(&self.slack, self.transport_mode())?;
        validate_transport(&self.transport, self.transport_mode())?;
        validate_dispatch(&self.dispatch)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("greeter.toml"), PathBuf::from("config/greeter.toml")]
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

fn validate_slack(slack: &SlackConfig, mode: TransportMode) -> Result<(), ConfigError> {
    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required (env `BOT_TOKEN`). Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used the app-level token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-`{hint}"
        )));
    }

    match mode {
        TransportMode::Session => {
            let app_token =
                slack.app_level_token.as_ref().map(|token| token.expose_secret()).unwrap_or("");
            if app_token.is_empty() {
                return Err(ConfigError::Validation(
                    "slack.app_level_token is required in session mode (env `APP_LEVEL_TOKEN`). Get it from https://api.slack.com/apps > Your App > Basic Information > App-Level Tokens".to_string()
                ));
            }
            if !app_token.starts_with("xapp-") {
                let hint = if app_token.starts_with("xoxb-") {
                    " (hint: you may have used the bot token instead of the app-level token)"
                } else {
                    ""
                };
                return Err(ConfigError::Validation(format!(
                    "slack.app_level_token must start with `xapp-`{hint}"
                )));
            }
        }
        TransportMode::Listener => {
            let missing = slack
                .signing_secret
                .as_ref()
                .map(|secret| secret.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "slack.signing_secret is required in listener mode (env `SIGNING_SECRET`)"
                        .to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_transport(transport: &TransportConfig, mode: TransportMode) -> Result<(), ConfigError> {
    if mode == TransportMode::Listener
        && transport.listen_address.trim().parse::<SocketAddr>().is_err()
    {
        return Err(ConfigError::Validation(format!(
            "transport.listen_address `{}` must be a socket address such as `0.0.0.0:3000`",
            transport.listen_address
        )));
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.ack_window_ms == 0 || dispatch.ack_window_ms > 60_000 {
        return Err(ConfigError::Validation(
            "dispatch.ack_window_ms must be in range 1..=60000".to_string(),
        ));
    }

    if dispatch.handler_timeout_ms == 0 || dispatch.handler_timeout_ms >= dispatch.ack_window_ms {
        return Err(ConfigError::Validation(format!(
            "dispatch.handler_timeout_ms must be greater than zero and below dispatch.ack_window_ms ({})",
            dispatch.ack_window_ms
        )));
    }

    if dispatch.shutdown_grace_secs == 0 {
        return Err(ConfigError::Validation(
            "dispatch.shutdown_grace_secs must be greater than zero".to_string(),
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

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    slack: Option<SlackPatch>,
    transport: Option<TransportPatch>,
    dispatch: Option<DispatchPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    bot_token: Option<String>,
    signing_secret: Option<String>,
    app_level_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TransportPatch {
    mode: Option<TransportMode>,
    listen_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    ack_window_ms: Option<u64>,
    handler_timeout_ms: Option<u64>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
