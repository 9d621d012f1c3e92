//! Table API for the `messages` relation.

use chat_core::{
    ChatError, ChatErrorCategory, Message, MessageId, MessagePatch, NewMessage,
};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::http::{SupabaseConfig, authorize, map_reqwest_error, read_json};

const MESSAGES_PATH: &str = "rest/v1/messages";

/// Query for one page of messages, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    /// Only rows with `id < before`.
    pub before: Option<MessageId>,
    pub limit: u16,
}

#[derive(Debug, Clone)]
pub struct MessagesApi {
    http: Client,
    config: SupabaseConfig,
}

impl MessagesApi {
    pub fn new(http: Client, config: SupabaseConfig) -> Self {
        Self { http, config }
    }

    pub async fn fetch_page(
        &self,
        query: PageQuery,
        access_token: Option<&str>,
    ) -> Result<Vec<Message>, ChatError> {
        let url = page_url(&self.config, query)?;
        debug!(before = ?query.before, limit = query.limit, "fetching message page");
        let response = authorize(self.http.get(url), &self.config, access_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_json(response).await
    }

    pub async fn fetch_one(
        &self,
        id: MessageId,
        access_token: Option<&str>,
    ) -> Result<Option<Message>, ChatError> {
        let url = single_url(&self.config, id)?;
        let response = authorize(self.http.get(url), &self.config, access_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let rows: Vec<Message> = read_json(response).await?;
        Ok(rows.into_iter().next())
    }

    /// Insert and return the stored row.
    pub async fn insert(
        &self,
        message: &NewMessage,
        access_token: Option<&str>,
    ) -> Result<Message, ChatError> {
        let url = self.config.endpoint(MESSAGES_PATH)?;
        let response = authorize(self.http.post(url), &self.config, access_token)
            .header("Prefer", "return=representation")
            .json(&[message])
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let rows: Vec<Message> = read_json(response).await?;
        rows.into_iter().next().ok_or_else(|| {
            ChatError::new(
                ChatErrorCategory::Internal,
                "insert_returned_nothing",
                "insert succeeded but no row was returned",
            )
        })
    }

    /// Patch one row. `author` restricts the write to rows owned by that
    /// username; a filter that matches nothing is reported as an error.
    pub async fn update(
        &self,
        id: MessageId,
        patch: &MessagePatch,
        author: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Message, ChatError> {
        let url = update_url(&self.config, id, author)?;
        let response = authorize(self.http.patch(url), &self.config, access_token)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let rows: Vec<Message> = read_json(response).await?;
        rows.into_iter().next().ok_or_else(|| {
            ChatError::new(
                ChatErrorCategory::Auth,
                "message_not_writable",
                format!("message {id} does not exist or belongs to someone else"),
            )
        })
    }
}

pub(crate) fn page_url(config: &SupabaseConfig, query: PageQuery) -> Result<Url, ChatError> {
    let mut url = config.endpoint(MESSAGES_PATH)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("select", "*");
        if let Some(before) = query.before {
            pairs.append_pair("id", &format!("lt.{before}"));
        }
        pairs.append_pair("order", "id.desc");
        pairs.append_pair("limit", &query.limit.max(1).to_string());
    }
    Ok(url)
}

pub(crate) fn single_url(config: &SupabaseConfig, id: MessageId) -> Result<Url, ChatError> {
    let mut url = config.endpoint(MESSAGES_PATH)?;
    url.query_pairs_mut()
        .append_pair("select", "*")
        .append_pair("id", &format!("eq.{id}"))
        .append_pair("limit", "1");
    Ok(url)
}

pub(crate) fn update_url(
    config: &SupabaseConfig,
    id: MessageId,
    author: Option<&str>,
) -> Result<Url, ChatError> {
    let mut url = config.endpoint(MESSAGES_PATH)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("id", &format!("eq.{id}"));
        if let Some(author) = author {
            pairs.append_pair("username", &format!("eq.{author}"));
        }
    }
    Ok(url)
}
