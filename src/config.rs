use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use teloxide::types::{ChatId, Recipient};

pub const PLACEHOLDER_TOKEN: &str = "dummy_token_for_development";
pub const PLACEHOLDER_AI_KEY: &str = "dummy_key_for_development";
pub const PLACEHOLDER_CHANNEL: &str = "@your_channel";

/// Telegram treats restrictions longer than 366 days as permanent.
pub const MAX_RESTRICT_SECS: i64 = 366 * 86400;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub ai: AiConfig,
    pub admission: AdmissionConfig,
    pub moderation: ModerationConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BotConfig {
    pub token: String,
    pub log_level: Option<String>,
    pub persona_name: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            log_level: None,
            persona_name: "Apex".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub request_timeout_secs: u64,
    pub system_prompt: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-1.5-flash".into(),
            temperature: 0.7,
            max_output_tokens: 800,
            request_timeout_secs: 30,
            system_prompt: None,
        }
    }
}

impl AiConfig {
    /// Key usable against the real backend, if any.
    pub fn usable_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != PLACEHOLDER_AI_KEY)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdmissionConfig {
    pub required_channel: String,
    pub required_channel_id: Option<i64>,
    pub join_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            required_channel: String::new(),
            required_channel_id: None,
            join_timeout_secs: 300,
        }
    }
}

impl AdmissionConfig {
    /// Where membership is checked. A numeric id wins over the username.
    pub fn channel_recipient(&self) -> Recipient {
        match self.required_channel_id {
            Some(id) => Recipient::Id(ChatId(id)),
            None => Recipient::ChannelUsername(format!("@{}", self.channel_name())),
        }
    }

    pub fn channel_name(&self) -> &str {
        self.required_channel.trim().trim_start_matches('@')
    }

    pub fn channel_link(&self) -> String {
        format!("https://t.me/{}", self.channel_name())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModerationConfig {
    pub max_flood_messages: usize,
    pub flood_time_window_secs: i64,
    pub flood_mute_secs: i64,
    pub slow_mode_interval_secs: i64,
    pub warning_expire_hours: i64,
    pub max_warnings: usize,
    pub banned_content_types: Vec<ContentType>,
    pub default_mute_secs: i64,
    pub welcome_delete_after_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_flood_messages: 5,
            flood_time_window_secs: 5,
            flood_mute_secs: 60,
            slow_mode_interval_secs: 3,
            warning_expire_hours: 24,
            max_warnings: 3,
            banned_content_types: vec![ContentType::Url],
            default_mute_secs: 3600,
            welcome_delete_after_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Url,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:5000".into(),
        }
    }
}

/// Reads the YAML file if it exists; a missing file means all defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

/// Environment variables override the file.
pub fn apply_env<F>(cfg: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
        cfg.bot.token = v;
    }
    if let Some(v) = var("GEMINI_API_KEY") {
        cfg.ai.api_key = Some(v);
    }
    if let Some(v) = var("REQUIRED_CHANNEL") {
        cfg.admission.required_channel = v;
    }
    if let Some(v) = var("REQUIRED_CHANNEL_ID") {
        let id = v
            .trim()
            .parse::<i64>()
            .with_context(|| format!("REQUIRED_CHANNEL_ID is not a chat id: {v:?}"))?;
        cfg.admission.required_channel_id = Some(id);
    }
    if let Some(v) = var("STATUS_BIND") {
        cfg.status.bind = v;
    }
    Ok(())
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    let token = cfg.bot.token.trim();
    if token.is_empty() || token == PLACEHOLDER_TOKEN {
        return Err(anyhow!(
            "bot token missing: set TELEGRAM_BOT_TOKEN or bot.token"
        ));
    }

    // the username is needed for the join link even when the id is known
    let channel = cfg.admission.required_channel.trim();
    if cfg.admission.channel_name().is_empty() || channel == PLACEHOLDER_CHANNEL {
        return Err(anyhow!(
            "required channel missing: set REQUIRED_CHANNEL or admission.required_channel"
        ));
    }

    let t = cfg.admission.join_timeout_secs;
    if !(5..=86400).contains(&t) {
        return Err(anyhow!("join_timeout_secs={} out of range (5..=86400)", t));
    }

    let m = &cfg.moderation;
    if m.max_flood_messages == 0 {
        return Err(anyhow!("max_flood_messages must be > 0"));
    }
    if m.flood_time_window_secs <= 0 {
        return Err(anyhow!("flood_time_window_secs must be > 0"));
    }
    if m.flood_time_window_secs > 86400 {
        return Err(anyhow!("flood_time_window_secs must be <= 86400"));
    }
    for (key, secs) in [
        ("flood_mute_secs", m.flood_mute_secs),
        ("default_mute_secs", m.default_mute_secs),
    ] {
        if !(1..=MAX_RESTRICT_SECS).contains(&secs) {
            return Err(anyhow!(
                "{}={} out of range (1..={})",
                key,
                secs,
                MAX_RESTRICT_SECS
            ));
        }
    }
    if !(1..=366 * 24).contains(&m.warning_expire_hours) {
        return Err(anyhow!(
            "warning_expire_hours={} out of range (1..=8784)",
            m.warning_expire_hours
        ));
    }
    if m.max_warnings == 0 {
        return Err(anyhow!("max_warnings must be > 0"));
    }
    if !(0..=86400).contains(&m.slow_mode_interval_secs) {
        return Err(anyhow!(
            "slow_mode_interval_secs={} out of range (0..=86400)",
            m.slow_mode_interval_secs
        ));
    }
    Ok(())
}
