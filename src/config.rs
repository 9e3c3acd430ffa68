use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid player url: {0}")]
    InvalidPlayerUrl(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The media-player page to attach to.
    pub player_url: String,
    pub auth_token: String,
    pub listen_addr: String,
    pub chromium_path: Option<String>,
    /// Run browser in headless mode (default false; use xvfb-run on servers)
    pub headless: bool,
    /// Synced-settings analogue: JSON file holding the settings snapshot.
    pub settings_file: PathBuf,
    /// Local (non-synced) persistence: last series identity, overlay position.
    pub state_file: PathBuf,
    /// JSONL log of dispatched automation actions.
    pub action_log: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let player_url = required_env("SKIPJACK_PLAYER_URL")?;
        if !player_url.starts_with("http://") && !player_url.starts_with("https://") {
            return Err(ConfigError::InvalidPlayerUrl(player_url));
        }

        let auth_token = required_env("SKIPJACK_AUTH_TOKEN")?;

        let listen_addr =
            std::env::var("SKIPJACK_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8091".into());

        let chromium_path = std::env::var("SKIPJACK_CHROMIUM_PATH").ok();

        let headless = std::env::var("SKIPJACK_HEADLESS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let settings_file = std::env::var("SKIPJACK_SETTINGS_FILE")
            .unwrap_or_else(|_| "skipjack_settings.json".into())
            .into();

        let state_file = std::env::var("SKIPJACK_STATE_FILE")
            .unwrap_or_else(|_| "skipjack_state.json".into())
            .into();

        let action_log = std::env::var("SKIPJACK_ACTION_LOG")
            .unwrap_or_else(|_| "skipjack_actions.jsonl".into())
            .into();

        Ok(Config {
            player_url,
            auth_token,
            listen_addr,
            chromium_path,
            headless,
            settings_file,
            state_file,
            action_log,
        })
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.into()))
}
