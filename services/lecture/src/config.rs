//! Application Configuration Module
//!
//! Settings for the lecture player come from environment variables (optionally seeded
//! from a `.env` file) and are gathered into one struct at startup.

use lecture_core::PlaybackSettings;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REALTIME_BASE_URL: &str = "wss://api.openai.com/v1";
pub const DEFAULT_PROGRESS_FILE: &str = ".lecture-progress.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub realtime_base_url: String,
    pub progress_file: PathBuf,
    pub resume_phrase: String,
    pub question_debounce: Duration,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `LECTURE_API_BASE_URL`: (Optional) Lecture content service. Defaults to "http://127.0.0.1:8000".
    // *   `REALTIME_BASE_URL`: (Optional) Realtime WebSocket endpoint. Defaults to "wss://api.openai.com/v1".
    // *   `PROGRESS_FILE`: (Optional) Where playback progress is kept. Defaults to ".lecture-progress.json".
    // *   `RESUME_PHRASE`: (Optional) Spoken phrase that continues the lecture. Defaults to "forge ahead".
    // *   `QUESTION_DEBOUNCE_MS`: (Optional) Quiet period before a spoken question is sent. Defaults to 600.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PlaybackSettings::default();
        let var = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let api_base_url = var("LECTURE_API_BASE_URL", DEFAULT_API_BASE_URL);
        if !api_base_url.starts_with("http://") && !api_base_url.starts_with("https://") {
            return Err(invalid("LECTURE_API_BASE_URL", api_base_url));
        }

        let realtime_base_url = var("REALTIME_BASE_URL", DEFAULT_REALTIME_BASE_URL);
        if !realtime_base_url.starts_with("ws://") && !realtime_base_url.starts_with("wss://") {
            return Err(invalid("REALTIME_BASE_URL", realtime_base_url));
        }

        let progress_file = PathBuf::from(var("PROGRESS_FILE", DEFAULT_PROGRESS_FILE));
        let resume_phrase = var("RESUME_PHRASE", &defaults.resume_phrase);

        let debounce_raw = var(
            "QUESTION_DEBOUNCE_MS",
            &defaults.question_debounce.as_millis().to_string(),
        );
        let question_debounce = debounce_raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| invalid("QUESTION_DEBOUNCE_MS", debounce_raw.clone()))?;

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = var("RUST_LOG", "INFO");
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| invalid("RUST_LOG", log_level_str.clone()))?;

        Ok(Self {
            api_base_url,
            realtime_base_url,
            progress_file,
            resume_phrase,
            question_debounce,
            log_level,
        })
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings::default()
            .with_resume_phrase(&self.resume_phrase)
            .with_question_debounce(self.question_debounce)
    }
}

fn invalid(var: &str, value: String) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.realtime_base_url, DEFAULT_REALTIME_BASE_URL);
        assert_eq!(config.progress_file, PathBuf::from(DEFAULT_PROGRESS_FILE));
        assert_eq!(config.resume_phrase, "forge ahead");
        assert_eq!(config.question_debounce, Duration::from_millis(600));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn overrides_flow_into_playback_settings() {
        let config = Config::from_lookup(lookup(&[
            ("RESUME_PHRASE", "carry on"),
            ("QUESTION_DEBOUNCE_MS", "250"),
            ("RUST_LOG", "debug"),
        ]))
        .unwrap();
        let settings = config.playback_settings();
        assert_eq!(settings.resume_phrase, "carry on");
        assert_eq!(settings.question_debounce, Duration::from_millis(250));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(
            Config::from_lookup(lookup(&[("QUESTION_DEBOUNCE_MS", "soon")])).unwrap_err(),
            ConfigError::InvalidValue {
                var: "QUESTION_DEBOUNCE_MS".into(),
                value: "soon".into()
            }
        );
        assert!(Config::from_lookup(lookup(&[("RUST_LOG", "chatty")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REALTIME_BASE_URL", "https://x")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LECTURE_API_BASE_URL", "localhost")])).is_err());
    }
}
