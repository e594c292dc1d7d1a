// Configuration loading and parsing (bot.toml, credentials.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime};
use groupquiz_core::PollSettings;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable that overrides `credentials.toml: bot_token`.
pub const TOKEN_ENV_VAR: &str = "BOT_TOKEN";

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub bot: BotConfig,
    pub schedule: ScheduleConfig,
    pub delivery: PollSettings,
    /// Absent until set in credentials.toml or `BOT_TOKEN`; only the bot
    /// itself needs it.
    pub bot_token: Option<String>,
    pub db_path: String,
    pub questions_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_true")]
    pub ask_now_enabled: bool,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

/// Daily schedule, parsed and ready for the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub time: NaiveTime,
    pub offset: FixedOffset,
    pub pause_between_groups: Duration,
}

impl Config {
    /// The bot token, or a validation error naming where to set it.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.bot_token
            .as_deref()
            .ok_or_else(|| ConfigError::ValidationError {
                field: "credentials.bot_token".into(),
                message: format!(
                    "must be set in credentials.toml or the {TOKEN_ENV_VAR} environment variable"
                ),
            })
    }
}

// ---------------------------------------------------------------------------
// bot.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire bot.toml file.
#[derive(Debug, Clone, Deserialize)]
struct BotFile {
    bot: BotConfig,
    schedule: ScheduleSection,
    #[serde(default)]
    delivery: DeliverySection,
    database: DatabaseSection,
    seed: SeedSection,
}

#[derive(Debug, Clone, Deserialize)]
struct ScheduleSection {
    #[serde(default = "default_true")]
    enabled: bool,
    time: String,
    #[serde(default)]
    utc_offset_minutes: i32,
    #[serde(default = "default_pause_ms")]
    pause_between_groups_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct DeliverySection {
    #[serde(default)]
    topic_id: Option<i64>,
    #[serde(default)]
    anonymous: bool,
    #[serde(default = "default_true")]
    multiple_answers: bool,
}

impl Default for DeliverySection {
    fn default() -> Self {
        let defaults = PollSettings::default();
        Self {
            topic_id: defaults.topic_id,
            anonymous: defaults.anonymous,
            multiple_answers: defaults.multiple_answers,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedSection {
    questions_path: String,
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".into()
}

fn default_pause_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub bot_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/bot.toml` and (optionally)
/// `config/credentials.toml`, relative to `base_dir`. A non-empty
/// `token_override` replaces the token from credentials.toml.
///
/// This does not auto-copy defaults; prefer `load_config()`.
pub fn load_config_from(
    base_dir: &Path,
    token_override: Option<String>,
) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- bot.toml (required) ---
    let bot_path = config_dir.join("bot.toml");
    let bot_text = read_file(&bot_path)?;
    let file: BotFile = toml::from_str(&bot_text).map_err(|e| ConfigError::ParseError {
        path: bot_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials: CredentialsConfig = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let bot_token = token_override
        .filter(|t| !t.trim().is_empty())
        .or(credentials.bot_token)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    validate_bot(&file.bot)?;
    let schedule = parse_schedule(&file.schedule)?;

    Ok(Config {
        bot: file.bot,
        schedule,
        delivery: PollSettings {
            topic_id: file.delivery.topic_id,
            anonymous: file.delivery.anonymous,
            multiple_answers: file.delivery.multiple_answers,
        },
        bot_token,
        db_path: file.database.path,
        questions_path: file.seed.questions_path,
    })
}

/// Copy `defaults/bot.toml` to `config/bot.toml` unless the latter already
/// exists. Returns the path written, if any. Credentials are never copied.
pub fn ensure_bot_config(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join("bot.toml");
    if target.exists() {
        return Ok(None);
    }

    let source = base_dir.join("defaults").join("bot.toml");
    if !source.is_file() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither {} nor {} found; run from the bot directory",
                target.display(),
                source.display()
            ),
        });
    }

    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", dir.display()),
        })?;
    }
    std::fs::copy(&source, &target).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to copy {} to {}: {e}", source.display(), target.display()),
    })?;

    Ok(Some(target))
}

/// Loads config relative to the current working directory, copying defaults
/// first and honoring the `BOT_TOKEN` environment variable.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_bot_config(&cwd)?;
    load_config_from(&cwd, std::env::var(TOKEN_ENV_VAR).ok())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_bot(bot: &BotConfig) -> Result<(), ConfigError> {
    // getUpdates caps the long-poll timeout at 50 seconds.
    if !(1..=50).contains(&bot.poll_timeout_secs) {
        return Err(ConfigError::ValidationError {
            field: "bot.poll_timeout_secs".into(),
            message: format!("must be between 1 and 50, got {}", bot.poll_timeout_secs),
        });
    }
    if bot.api_base_url.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "bot.api_base_url".into(),
            message: "must not be empty".into(),
        });
    }
    Ok(())
}

fn parse_schedule(section: &ScheduleSection) -> Result<ScheduleConfig, ConfigError> {
    let time = NaiveTime::parse_from_str(section.time.trim(), "%H:%M").map_err(|e| {
        ConfigError::ValidationError {
            field: "schedule.time".into(),
            message: format!("expected HH:MM, got {:?} ({e})", section.time),
        }
    })?;

    let minutes = section.utc_offset_minutes;
    let offset = (minutes.abs() <= MAX_UTC_OFFSET_MINUTES)
        .then(|| FixedOffset::east_opt(minutes * 60))
        .flatten()
        .ok_or_else(|| ConfigError::ValidationError {
            field: "schedule.utc_offset_minutes".into(),
            message: format!("must be within ±{MAX_UTC_OFFSET_MINUTES}, got {minutes}"),
        })?;

    Ok(ScheduleConfig {
        enabled: section.enabled,
        time,
        offset,
        pause_between_groups: Duration::from_millis(section.pause_between_groups_ms),
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
