use crate::error::{ChatError, ChatResult};
use crate::realtime::ReconnectPolicy;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub ws_url: Option<String>,
    pub token: Option<String>,
    pub recruiter_id: Option<String>,
    pub page_size: u32,
    pub handshake_timeout_ms: u64,
    pub cache_enabled: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            ws_url: None,
            token: None,
            recruiter_id: None,
            page_size: 50,
            handshake_timeout_ms: 10_000,
            cache_enabled: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("recruit-chat.toml"))
    }

    /// Load from the platform config file, then apply environment overrides.
    pub fn load() -> ChatResult<Self> {
        let mut config = match Self::config_path() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file is not an error; a malformed one is.
    pub fn load_from(path: &Path) -> ChatResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> ChatResult<()> {
        let path = Self::config_path()
            .ok_or_else(|| ChatError::Config("no config directory on this platform".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> ChatResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("RECRUIT_CHAT_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("RECRUIT_CHAT_WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = get("RECRUIT_CHAT_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = get("RECRUIT_CHAT_RECRUITER_ID") {
            self.recruiter_id = Some(v);
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(ChatError::Config("base_url is not set".into()));
        }
        if self.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
            return Err(ChatError::Config("token is not set".into()));
        }
        if self.page_size == 0 {
            return Err(ChatError::Config("page_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("recruit-chat.toml");
        let mut config = AppConfig {
            base_url: "https://chat.example.com".into(),
            token: Some("secret".into()),
            page_size: 20,
            ..AppConfig::default()
        };
        config.reconnect.max_attempts = 3;
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recruit-chat.toml");
        fs::write(
            &path,
            "base_url = \"http://localhost:8080\"\n[reconnect]\nmax_attempts = 2\n",
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_backoff_ms, 500);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recruit-chat.toml");
        fs::write(&path, "page_size = \"lots\"").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ChatError::Toml(_))));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = AppConfig {
            base_url: "http://file".into(),
            ..AppConfig::default()
        };
        config.apply_env(|key| match key {
            "RECRUIT_CHAT_BASE_URL" => Some("http://env".into()),
            "RECRUIT_CHAT_TOKEN" => Some("tok".into()),
            "RECRUIT_CHAT_WS_URL" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config.base_url, "http://env");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.ws_url, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_url_and_token() {
        assert!(AppConfig::default().validate().is_err());
        let config = AppConfig {
            base_url: "http://x".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
