use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";
const DEFAULT_WS_BASE: &str = "http://localhost:5000";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    /// Realtime server origin. Derived from `api_url` when unset.
    pub ws_base: Option<String>,
    /// Web client origin, used to open a conversation in the browser.
    pub web_url: String,
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub session_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// How long a send may stay pending after the fallback path before it is
    /// shown as failed.
    pub pending_timeout_secs: u64,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_base: None,
            web_url: "http://localhost:5173".to_string(),
            token: None,
            user_id: None,
            session_file: None,
            request_timeout_secs: 10,
            connect_timeout_secs: 10,
            pending_timeout_secs: 15,
            log_file: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gigchat").join("config.toml"))
    }

    /// Defaults, then the TOML file, then `GIGCHAT_*` environment variables.
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_url) = lookup("GIGCHAT_API_URL") {
            self.api_url = api_url;
        }
        if let Some(ws_base) = lookup("GIGCHAT_WS_BASE") {
            self.ws_base = Some(ws_base);
        }
        if let Some(web_url) = lookup("GIGCHAT_WEB_URL") {
            self.web_url = web_url;
        }
        if let Some(token) = lookup("GIGCHAT_TOKEN") {
            self.token = Some(token);
        }
        if let Some(user_id) = lookup("GIGCHAT_USER_ID") {
            self.user_id = Some(user_id);
        }
    }

    /// Realtime origin: explicit `ws_base`, else the API URL without its
    /// trailing `/api`.
    pub fn ws_base(&self) -> String {
        if let Some(ws_base) = self.ws_base.as_deref().filter(|s| !s.trim().is_empty()) {
            return ws_base.to_string();
        }

        let trimmed = self.api_url.trim_end_matches('/');
        let origin = trimmed.strip_suffix("/api").unwrap_or(trimmed);
        if origin.is_empty() {
            DEFAULT_WS_BASE.to_string()
        } else {
            origin.to_string()
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("gigchat")
                .join("gigchat.log")
        })
    }

    /// Browser URL of the full chat page for `peer`.
    pub fn full_chat_url(&self, peer: &str) -> String {
        format!("{}/chat/{}", self.web_url.trim_end_matches('/'), peer)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}
