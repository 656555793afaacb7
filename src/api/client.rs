use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use url::Url;

use crate::api::ChatApi;
use crate::api::models::{Conversation, Message, MessagePage, OutgoingMessage};
use crate::error::{ChatError, ChatResult};
use crate::utils::base_api;

pub struct ApiClient {
    http: HttpClient,
    base_api: String,
    token: Option<String>,
    page_size: u32,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, page_size: u32) -> Self {
        Self {
            http: HttpClient::new(),
            base_api: base_api(base_url),
            token,
            page_size,
        }
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_api, path.trim_start_matches('/'))
    }

    /// `{base}/conversations/{id}/messages`, with the id as one encoded segment.
    fn messages_url(&self, conversation_id: &str) -> ChatResult<Url> {
        let mut url = Url::parse(&self.base_api)?;
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("{} cannot be a base url", self.base_api)))?
            .pop_if_empty()
            .push("conversations")
            .push(conversation_id)
            .push("messages");
        Ok(url)
    }

    async fn read_json(resp: reqwest::Response) -> ChatResult<Value> {
        if !resp.status().is_success() {
            return Err(ChatError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json::<Value>().await?)
    }
}

/// Lists come back either bare or wrapped under one of a few keys.
fn extract_items(json: &Value, keys: &[&str]) -> Vec<Value> {
    if let Some(arr) = json.as_array() {
        return arr.clone();
    }
    keys.iter()
        .find_map(|k| json.get(*k).and_then(|v| v.as_array()))
        .cloned()
        .unwrap_or_default()
}

/// Items that fail to decode are skipped rather than failing the whole list.
fn decode_items<T: serde::de::DeserializeOwned>(items: Vec<Value>, what: &str) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("Skipping malformed {what}: {e}"),
        }
    }
    out
}

fn parse_page(json: &Value) -> MessagePage {
    let messages = decode_items::<Message>(extract_items(json, &["messages", "data"]), "message");
    let next_cursor = json
        .get("nextCursor")
        .or_else(|| json.get("next_cursor"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    MessagePage {
        messages,
        next_cursor,
    }
}

/// Some deployments wrap a single object under `data`.
fn unwrap_data(json: Value) -> Value {
    match json {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("id") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let req = self.with_auth(self.http.get(self.endpoint("conversations")));
        let json = Self::read_json(req.send().await?).await?;
        let items = extract_items(&json, &["conversations", "data"]);
        Ok(decode_items(items, "conversation"))
    }

    async fn create_conversation(&self, candidate_id: &str) -> ChatResult<Conversation> {
        let body = serde_json::json!({ "candidateId": candidate_id });
        let req = self.with_auth(self.http.post(self.endpoint("conversations")).json(&body));
        let json = Self::read_json(req.send().await?).await?;
        Ok(serde_json::from_value(unwrap_data(json))?)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> ChatResult<MessagePage> {
        let endpoint = self.messages_url(conversation_id)?;
        let limit = self.page_size.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(c) = cursor {
            query.push(("cursor", c));
        }
        let req = self.with_auth(self.http.get(endpoint).query(&query));
        let json = Self::read_json(req.send().await?).await?;
        Ok(parse_page(&json))
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> ChatResult<()> {
        let endpoint = self.messages_url(conversation_id)?;
        let resp = self
            .with_auth(self.http.post(endpoint).json(message))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ChatError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
