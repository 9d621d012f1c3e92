//! Tenor GIF search.

use chat_core::{ChatError, ChatErrorCategory, GifItem, GifMode};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::http::{map_reqwest_error, read_json};

pub const TENOR_BASE_URL: &str = "https://tenor.googleapis.com/v2/";
pub const DEFAULT_GIF_LIMIT: u8 = 12;

#[derive(Debug, Deserialize)]
struct TenorResponse {
    #[serde(default)]
    results: Vec<TenorResult>,
}

#[derive(Debug, Deserialize)]
struct TenorResult {
    id: String,
    media_formats: TenorMediaFormats,
}

#[derive(Debug, Deserialize)]
struct TenorMediaFormats {
    gif: Option<TenorMedia>,
    tinygif: Option<TenorMedia>,
}

#[derive(Debug, Deserialize)]
struct TenorMedia {
    url: String,
}

#[derive(Debug, Clone)]
pub struct TenorClient {
    http: Client,
    api_key: String,
    base_url: Url,
}

impl TenorClient {
    pub fn new(http: Client, api_key: impl Into<String>) -> Result<Self, ChatError> {
        Self::with_base_url(http, api_key, TENOR_BASE_URL)
    }

    pub fn with_base_url(
        http: Client,
        api_key: impl Into<String>,
        base_url: &str,
    ) -> Result<Self, ChatError> {
        let base_url = Url::parse(base_url).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_gif_url",
                format!("invalid gif provider url '{base_url}': {err}"),
            )
        })?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url,
        })
    }

    /// Trending list, or keyword search. A blank query means trending.
    pub async fn fetch(&self, mode: &GifMode, limit: u8) -> Result<Vec<GifItem>, ChatError> {
        let url = gif_url(&self.base_url, &self.api_key, mode, limit)?;
        debug!(?mode, limit, "fetching gifs");
        let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;
        let body: TenorResponse = read_json(response).await?;
        Ok(gif_items(body))
    }
}

pub(crate) fn gif_url(base: &Url, api_key: &str, mode: &GifMode, limit: u8) -> Result<Url, ChatError> {
    let query = match mode {
        GifMode::Search { query } if !query.trim().is_empty() => Some(query.trim()),
        _ => None,
    };
    let path = if query.is_some() { "search" } else { "featured" };
    let mut url = base.join(path).map_err(|err| {
        ChatError::new(ChatErrorCategory::Config, "invalid_gif_url", err.to_string())
    })?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(query) = query {
            pairs.append_pair("q", query);
        }
        pairs.append_pair("key", api_key);
        pairs.append_pair("limit", &limit.max(1).to_string());
    }
    Ok(url)
}

fn gif_items(body: TenorResponse) -> Vec<GifItem> {
    body.results
        .into_iter()
        .filter_map(|result| {
            let full = result.media_formats.gif?.url;
            let preview = result
                .media_formats
                .tinygif
                .map(|media| media.url)
                .unwrap_or_else(|| full.clone());
            Some(GifItem {
                id: result.id,
                url: full,
                preview_url: preview,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse(TENOR_BASE_URL).expect("base")
    }

    #[test]
    fn builds_trending_and_search_urls() {
        assert_eq!(
            gif_url(&base(), "k", &GifMode::Trending, 12).expect("url").as_str(),
            "https://tenor.googleapis.com/v2/featured?key=k&limit=12"
        );
        assert_eq!(
            gif_url(
                &base(),
                "k",
                &GifMode::Search {
                    query: " happy cat ".into()
                },
                12
            )
            .expect("url")
            .as_str(),
            "https://tenor.googleapis.com/v2/search?q=happy+cat&key=k&limit=12"
        );
        assert!(
            gif_url(&base(), "k", &GifMode::Search { query: "  ".into() }, 12)
                .expect("url")
                .path()
                .ends_with("/featured")
        );
    }

    #[test]
    fn maps_media_formats() {
        let body: TenorResponse = serde_json::from_str(
            r#"{"results":[
                {"id":"1","media_formats":{"gif":{"url":"https://m/1.gif"},"tinygif":{"url":"https://m/1s.gif"}}},
                {"id":"2","media_formats":{"gif":{"url":"https://m/2.gif"}}},
                {"id":"3","media_formats":{"tinygif":{"url":"https://m/3s.gif"}}}
            ],"next":"x"}"#,
        )
        .expect("decode");

        let items = gif_items(body);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].preview_url, "https://m/1s.gif");
        assert_eq!(items[1].preview_url, "https://m/2.gif");
    }
}
