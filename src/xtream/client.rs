//! Xtream Codes API client implementation
//!
//! All calls go through the shared [`HttpPool`] so the per-host limits and
//! retry policy apply. Category fetches are conditional: the caller passes
//! the ETag / Last-Modified validators it checkpointed last run and gets a
//! `NotModified` back when the panel honours them.

use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use url::Url;

use super::types::{Category, LiveStream, SeriesEntry, VodStream, XtreamAuthResponse};
use super::XtreamError;
use crate::cloudflare;
use crate::httpx::{HttpPool, RetryPolicy};

/// Result of an authenticated probe
#[derive(Debug)]
pub struct AuthProbe {
    pub auth: XtreamAuthResponse,
    /// The response carried Cloudflare markers even though it parsed
    pub cloudflare: bool,
}

/// Outcome of a conditional category fetch
#[derive(Debug)]
pub enum ConditionalBody {
    /// Panel answered 304; the checkpointed content is still current
    NotModified,
    /// Fresh body with its validators
    Fetched {
        body: bytes::Bytes,
        etag: Option<String>,
        last_modified: Option<String>,
        /// Response carried Cloudflare markers
        cloudflare: bool,
    },
}

/// Client for communicating with one Xtream Codes base
#[derive(Debug, Clone)]
pub struct XtreamClient {
    pool: HttpPool,
    base: Url,
    username: String,
    password: String,
    policy: RetryPolicy,
}

impl XtreamClient {
    /// Create a new Xtream client
    ///
    /// # Arguments
    /// * `pool` - Shared transport
    /// * `server_url` - Base URL of the panel (e.g., "http://example.com:8080")
    /// * `username` / `password` - Account credentials (never logged)
    /// * `policy` - Retry policy for API calls
    pub fn new(
        pool: HttpPool,
        server_url: &str,
        username: &str,
        password: &str,
        policy: RetryPolicy,
    ) -> Result<Self, XtreamError> {
        let trimmed = server_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(XtreamError::InvalidUrl);
        }
        let base = Url::parse(trimmed).map_err(|_| XtreamError::InvalidUrl)?;

        Ok(Self {
            pool,
            base,
            username: username.to_string(),
            password: password.to_string(),
            policy,
        })
    }

    /// The base URL this client talks to
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Build a `player_api.php` URL for an action
    fn player_api_url(&self, action: Option<&str>, extra: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/player_api.php", url.path().trim_end_matches('/')));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("username", &self.username);
            query.append_pair("password", &self.password);
            if let Some(action) = action {
                query.append_pair("action", action);
            }
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        url
    }

    /// The authenticated `get.php` playlist URL for this base
    pub fn playlist_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/get.php", url.path().trim_end_matches('/')));
        url.query_pairs_mut()
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .append_pair("type", "m3u_plus")
            .append_pair("output", "ts");
        url
    }

    /// The authenticated stream path for a live stream id, relative to a base
    ///
    /// Standard Xtream format: `/live/{username}/{password}/{stream_id}.ts`.
    /// Splicing this path onto each ranked base is how a channel gets its
    /// backup URLs.
    pub fn stream_path(&self, stream_id: i64) -> String {
        format!(
            "/live/{}/{}/{}.ts",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            stream_id
        )
    }

    /// Splice the stream path for `stream_id` onto an arbitrary base URL
    pub fn stream_url_on(&self, base: &Url, stream_id: i64) -> String {
        let trimmed = base.as_str().trim_end_matches('/');
        format!("{}{}", trimmed, self.stream_path(stream_id))
    }

    /// Authenticate against the panel
    ///
    /// # Returns
    /// * `Ok(AuthProbe)` - Parsed auth payload plus whether the response
    ///   carried Cloudflare markers
    /// * `Err(XtreamError)` - HTTP error or bad credentials
    pub async fn authenticate(&self) -> Result<AuthProbe, XtreamError> {
        let url = self.player_api_url(None, &[]);
        let response = self
            .pool
            .request_with_retry(Method::GET, url, HeaderMap::new(), &self.policy)
            .await?;

        let cloudflare = cloudflare::detect_cloudflare(response.status(), response.headers());

        if !response.status().is_success() {
            if cloudflare {
                return Err(XtreamError::Cloudflare);
            }
            return Err(XtreamError::HttpError(response.status().as_u16()));
        }

        let auth: XtreamAuthResponse = response
            .json()
            .await
            .map_err(|_| XtreamError::InvalidResponse)?;

        if auth.user_info.auth != 1 {
            return Err(XtreamError::AuthenticationFailed);
        }

        Ok(AuthProbe { auth, cloudflare })
    }

    /// Fetch the live category list
    pub async fn get_live_categories(&self) -> Result<Vec<Category>, XtreamError> {
        self.get_json(self.player_api_url(Some("get_live_categories"), &[]))
            .await
    }

    /// Fetch the VOD category list
    pub async fn get_vod_streams(&self) -> Result<Vec<VodStream>, XtreamError> {
        self.get_json(self.player_api_url(Some("get_vod_streams"), &[]))
            .await
    }

    /// Fetch the series list
    pub async fn get_series(&self) -> Result<Vec<SeriesEntry>, XtreamError> {
        self.get_json(self.player_api_url(Some("get_series"), &[]))
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, XtreamError> {
        let response = self
            .pool
            .request_with_retry(Method::GET, url, HeaderMap::new(), &self.policy)
            .await?;

        if !response.status().is_success() {
            return Err(XtreamError::HttpError(response.status().as_u16()));
        }

        response.json().await.map_err(|_| XtreamError::InvalidResponse)
    }

    /// Conditionally fetch the live streams of one category
    ///
    /// Sends `If-None-Match` / `If-Modified-Since` when validators are
    /// available. A 304 comes back as [`ConditionalBody::NotModified`] with
    /// no body read.
    pub async fn fetch_live_streams_conditional(
        &self,
        category_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<ConditionalBody, XtreamError> {
        let category = category_id.to_string();
        let url = self.player_api_url(
            Some("get_live_streams"),
            &[("category_id", category.as_str())],
        );

        let mut headers = HeaderMap::new();
        if let Some(etag) = etag {
            if let Ok(value) = etag.parse() {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_modified) = last_modified {
            if let Ok(value) = last_modified.parse() {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }

        let response = self
            .pool
            .request_with_retry(Method::GET, url, headers, &self.policy)
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(ConditionalBody::NotModified);
        }

        if !response.status().is_success() {
            return Err(XtreamError::HttpError(response.status().as_u16()));
        }

        let cloudflare = cloudflare::detect_cloudflare(response.status(), response.headers());
        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);
        let body = response.bytes().await?;

        Ok(ConditionalBody::Fetched {
            body,
            etag,
            last_modified,
            cloudflare,
        })
    }

    /// Parse a live-streams body
    pub fn parse_live_streams(body: &[u8]) -> Result<Vec<LiveStream>, XtreamError> {
        serde_json::from_slice(body).map_err(|_| XtreamError::InvalidResponse)
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> XtreamClient {
        XtreamClient::new(
            HttpPool::new("test-agent").unwrap(),
            "http://example.com:8080",
            "user",
            "pass",
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_client_strips_trailing_slashes() {
        let client = XtreamClient::new(
            HttpPool::new("test-agent").unwrap(),
            "http://example.com:8080///",
            "user",
            "pass",
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(client.base().as_str(), "http://example.com:8080/");
    }

    #[test]
    fn test_client_rejects_empty_url() {
        let result = XtreamClient::new(
            HttpPool::new("test-agent").unwrap(),
            "   ",
            "user",
            "pass",
            RetryPolicy::default(),
        );
        assert!(matches!(result.unwrap_err(), XtreamError::InvalidUrl));
    }

    #[test]
    fn test_player_api_url_carries_credentials_and_action() {
        let client = test_client();
        let url = client.player_api_url(Some("get_live_streams"), &[("category_id", "7")]);
        let query = url.query().unwrap();
        assert!(query.contains("username=user"));
        assert!(query.contains("password=pass"));
        assert!(query.contains("action=get_live_streams"));
        assert!(query.contains("category_id=7"));
        assert!(url.path().ends_with("/player_api.php"));
    }

    #[test]
    fn test_playlist_url() {
        let client = test_client();
        let url = client.playlist_url();
        assert!(url.path().ends_with("/get.php"));
        assert!(url.query().unwrap().contains("type=m3u_plus"));
    }

    #[test]
    fn test_stream_path_encodes_credentials() {
        let client = XtreamClient::new(
            HttpPool::new("test-agent").unwrap(),
            "http://example.com",
            "user@domain",
            "p@ss!",
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            client.stream_path(123),
            "/live/user%40domain/p%40ss%21/123.ts"
        );
    }

    #[test]
    fn test_stream_url_on_other_base() {
        let client = test_client();
        let backup = Url::parse("https://backup.example:9443/").unwrap();
        assert_eq!(
            client.stream_url_on(&backup, 55),
            "https://backup.example:9443/live/user/pass/55.ts"
        );
    }

    #[test]
    fn test_parse_live_streams() {
        let body = br#"[{"stream_id":"1","name":"A"},{"stream_id":2,"name":"B"}]"#;
        let streams = XtreamClient::parse_live_streams(body).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].stream_id, 1);
        assert_eq!(streams[1].name, "B");
    }

    #[test]
    fn test_parse_live_streams_rejects_garbage() {
        assert!(XtreamClient::parse_live_streams(b"<html>").is_err());
    }
}
