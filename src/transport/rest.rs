use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{MessageApi, OutgoingMessage};
use crate::error::{ChatError, Result};

/// REST client for the marketplace API (`{api_url}/messages`, `{api_url}/users`).
#[derive(Debug, Clone)]
pub struct RestApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl RestApi {
    pub fn new(api_url: &str, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base: Url::parse(api_url)?,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Protocol(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json(&self, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments)?;
        debug!("GET {}", url);

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MessageApi for RestApi {
    async fn history(&self, peer: &str) -> Result<Vec<Value>> {
        match self.get_json(&["messages", peer]).await? {
            Value::Array(records) => Ok(records),
            other => {
                debug!("History response is not a list: {}", other);
                Ok(Vec::new())
            }
        }
    }

    async fn post_message(&self, message: &OutgoingMessage) -> Result<Option<Value>> {
        let url = self.endpoint(&["messages"])?;
        debug!("POST {} (tempId {})", url, message.temp_id);

        let response = self
            .authorized(self.client.post(url))
            .json(message)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    async fn peer_name(&self, peer: &str) -> Result<Option<String>> {
        let user = self.get_json(&["users", peer]).await?;

        Ok(["username", "name"]
            .iter()
            .filter_map(|key| user.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map(str::to_string))
    }
}
