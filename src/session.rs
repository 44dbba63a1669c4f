use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::config::Config;

/// Who the local user is, resolved once at startup and handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub username: Option<String>,
    pub token: Option<String>,
}

impl Session {
    pub fn new(user_id: &str, token: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: None,
            token,
        }
    }

    /// Parse the session blob the web client keeps: either the user object
    /// itself or `{ "token": ..., "user": {...} }`.
    pub fn from_stored_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).context("Session file is not valid JSON")?;
        let user = value
            .get("user")
            .filter(|user| user.is_object())
            .unwrap_or(&value);

        let user_id = ["id", "_id"]
            .iter()
            .filter_map(|key| user.get(*key))
            .find_map(|id| match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| anyhow!("Stored session has no user id"))?;

        let username = ["username", "name"]
            .iter()
            .filter_map(|key| user.get(*key).and_then(Value::as_str))
            .find(|name| !name.trim().is_empty())
            .map(str::to_string);

        let token = value
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            user_id,
            username,
            token,
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read session {}", path.display()))?;
        Self::from_stored_json(&raw)
    }

    /// Session file first, then explicit `user_id`/`token` settings on top.
    pub async fn resolve(config: &Config) -> Result<Self> {
        let mut session = match &config.session_file {
            Some(path) => Some(Self::from_file(path).await?),
            None => None,
        };

        if let Some(user_id) = config.user_id.as_deref().filter(|id| !id.is_empty()) {
            match session.as_mut() {
                Some(session) => session.user_id = user_id.to_string(),
                None => session = Some(Self::new(user_id, None)),
            }
        }

        let mut session = session
            .ok_or_else(|| anyhow!("No user id: pass --user-id, --session or set GIGCHAT_USER_ID"))?;
        if config.token.is_some() {
            session.token = config.token.clone();
        }
        Ok(session)
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.user_id)
    }
}
