//! Country lookup by IP address.

use chat_core::{ChatError, ChatErrorCategory};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::http::{map_reqwest_error, read_json};

pub const DEFAULT_GEO_URL: &str = "https://api.db-ip.com/v2/free/self";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeoClient {
    http: Client,
    url: Url,
}

impl GeoClient {
    pub fn new(http: Client, url: Url) -> Self {
        Self { http, url }
    }

    /// Lowercase ISO country code for the caller's IP.
    pub async fn country_code(&self) -> Result<Option<String>, ChatError> {
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let body: GeoResponse = read_json(response).await?;
        parse_country(body)
    }
}

fn parse_country(body: GeoResponse) -> Result<Option<String>, ChatError> {
    if let Some(error) = body.error {
        return Err(ChatError::new(
            ChatErrorCategory::Network,
            "geo_lookup_failed",
            error,
        ));
    }
    Ok(body
        .country_code
        .map(|code| code.trim().to_ascii_lowercase())
        .filter(|code| code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic())))
}
