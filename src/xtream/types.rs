//! Xtream Codes API response types
//!
//! Defines the data structures for parsing Xtream Codes API responses.
//! Panels disagree about whether numeric fields are numbers or strings, so
//! every id and count goes through a tolerant deserializer.

use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;

/// Deserialize a number that may come as a string or int
pub(crate) fn deserialize_number_from_string<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
    }

    match StringOrNumber::<T>::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse::<T>().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

/// Deserialize an optional number that may come as a string, int, or null
pub(crate) fn deserialize_optional_number_from_string<'de, T, D>(
    deserializer: D,
) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber<T> {
        String(String),
        Number(T),
        Null,
    }

    match Option::<StringOrNumber<T>>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) if s.is_empty() => Ok(None),
        Some(StringOrNumber::String(s)) => {
            s.parse::<T>().map(Some).map_err(serde::de::Error::custom)
        }
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        Some(StringOrNumber::Null) | None => Ok(None),
    }
}

/// Raw authentication response from `player_api.php`
#[derive(Debug, Deserialize)]
pub struct XtreamAuthResponse {
    pub user_info: UserInfo,
    pub server_info: Option<ServerInfo>,
}

/// User information from the auth response
#[derive(Debug, Deserialize)]
pub struct UserInfo {
    pub username: Option<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub auth: i32,
    pub status: Option<String>,
    /// Number as string (e.g., "2")
    pub max_connections: Option<String>,
    /// Number as string (e.g., "0")
    pub active_cons: Option<String>,
}

/// Server information from the auth response
#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub url: Option<String>,
    pub port: Option<String>,
    pub server_protocol: Option<String>,
}

/// A live/VOD category from `get_live_categories`
#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub category_id: i64,
    pub category_name: String,
}

/// A live stream entry from `get_live_streams`
#[derive(Debug, Clone, Deserialize)]
pub struct LiveStream {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub stream_id: i64,
    pub name: String,
    #[serde(default)]
    pub stream_icon: Option<String>,
    /// External guide correlation key (tvg-id); often empty
    #[serde(default)]
    pub epg_channel_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_number_from_string")]
    pub num: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_number_from_string")]
    pub category_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_number_from_string")]
    pub tv_archive: Option<i64>,
}

/// A VOD stream entry from `get_vod_streams`
#[derive(Debug, Clone, Deserialize)]
pub struct VodStream {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub stream_id: i64,
    pub name: String,
    #[serde(default)]
    pub container_extension: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_number_from_string")]
    pub category_id: Option<i64>,
}

/// A series entry from `get_series`
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesEntry {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub series_id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_optional_number_from_string")]
    pub category_id: Option<i64>,
}
