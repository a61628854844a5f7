//! Catalog entities
//!
//! A [`CatalogSnapshot`] is immutable once published: the refresh loop
//! builds a new one, persists it, and swaps a pointer. In-flight stream
//! sessions keep the URLs they captured at open time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::xtream::QualityTier;

/// Error types for catalog construction and persistence
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate channel_id: {0}")]
    DuplicateChannelId(String),

    #[error("Channel {0} has no stream URL")]
    NoStreamUrl(String),

    #[error("Channel {channel}: stream URL is not http(s): {url}")]
    BadStreamUrl { channel: String, url: String },

    #[error("Channel {0}: stream_urls[0] differs from stream_url")]
    PrimaryMismatch(String),

    #[error("Failed to persist catalog: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Failed to decode catalog: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One live channel in the lineup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveChannel {
    /// Stable id, preferably the upstream stream id
    pub channel_id: String,
    /// Numeric-sort-friendly guide number advertised to the media server
    pub guide_number: String,
    pub guide_name: String,
    /// Primary stream URL; always equals `stream_urls[0]`
    pub stream_url: String,
    /// Primary first, then ranked backups on alternate provider bases
    pub stream_urls: Vec<String>,
    /// External guide correlation key; empty when the feed is unlinked
    #[serde(default)]
    pub tvg_id: String,
    pub quality_tier: QualityTier,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default)]
    pub source_tag: Option<String>,
    /// Provider category the channel came from; keys the fetch checkpoints
    #[serde(default)]
    pub category_id: Option<i64>,
}

impl LiveChannel {
    /// True when the channel correlates to an external guide entry
    pub fn epg_linked(&self) -> bool {
        !self.tvg_id.is_empty()
    }
}

/// Kind of a VOD entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VodKind {
    Movie,
    Series,
}

/// A movie or series carried alongside the live lineup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VodEntry {
    pub id: String,
    pub name: String,
    pub kind: VodKind,
    #[serde(default)]
    pub category_id: Option<i64>,
}

/// An immutable, validated catalog
///
/// Invariants enforced at construction:
/// - channel ids are unique
/// - every channel has at least one stream URL, all http(s)
/// - `stream_urls[0] == stream_url`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    channels: Vec<LiveChannel>,
    #[serde(default)]
    pub movies: Vec<VodEntry>,
    #[serde(default)]
    pub series: Vec<VodEntry>,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl CatalogSnapshot {
    /// Build a snapshot, validating the catalog invariants
    pub fn new(
        channels: Vec<LiveChannel>,
        movies: Vec<VodEntry>,
        series: Vec<VodEntry>,
    ) -> Result<Self, CatalogError> {
        let mut snapshot = Self {
            channels,
            movies,
            series,
            fetched_at: Utc::now(),
            index: HashMap::new(),
        };
        snapshot.validate_and_index()?;
        Ok(snapshot)
    }

    /// Validate invariants and rebuild the id index
    ///
    /// Called by the constructor and after deserialization.
    pub fn validate_and_index(&mut self) -> Result<(), CatalogError> {
        let mut index = HashMap::with_capacity(self.channels.len());

        for (position, channel) in self.channels.iter().enumerate() {
            if index
                .insert(channel.channel_id.clone(), position)
                .is_some()
            {
                return Err(CatalogError::DuplicateChannelId(channel.channel_id.clone()));
            }

            let Some(first) = channel.stream_urls.first() else {
                return Err(CatalogError::NoStreamUrl(channel.channel_id.clone()));
            };
            if first != &channel.stream_url {
                return Err(CatalogError::PrimaryMismatch(channel.channel_id.clone()));
            }
            for url in &channel.stream_urls {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(CatalogError::BadStreamUrl {
                        channel: channel.channel_id.clone(),
                        url: url.clone(),
                    });
                }
            }
        }

        self.index = index;
        Ok(())
    }

    /// Channels in lineup order
    pub fn channels(&self) -> &[LiveChannel] {
        &self.channels
    }

    /// Look up a channel by id
    pub fn get(&self, channel_id: &str) -> Option<&LiveChannel> {
        self.index.get(channel_id).map(|&i| &self.channels[i])
    }

    /// The set of tvg-ids present in the lineup (non-empty only)
    pub fn tvg_ids(&self) -> std::collections::HashSet<&str> {
        self.channels
            .iter()
            .filter(|c| c.epg_linked())
            .map(|c| c.tvg_id.as_str())
            .collect()
    }

    /// Map tvg-id to guide number for guide remapping
    pub fn tvg_to_guide_number(&self) -> HashMap<&str, &str> {
        self.channels
            .iter()
            .filter(|c| c.epg_linked())
            .map(|c| (c.tvg_id.as_str(), c.guide_number.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_channel(id: &str, url: &str) -> LiveChannel {
    LiveChannel {
        channel_id: id.to_string(),
        guide_number: id.to_string(),
        guide_name: format!("Channel {}", id),
        stream_url: url.to_string(),
        stream_urls: vec![url.to_string()],
        tvg_id: String::new(),
        quality_tier: QualityTier::Sd,
        group_title: None,
        source_tag: None,
        category_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accepts_valid_channels() {
        let snapshot = CatalogSnapshot::new(
            vec![
                test_channel("1", "http://a.example/live/u/p/1.ts"),
                test_channel("2", "https://a.example/live/u/p/2.ts"),
            ],
            vec![],
            vec![],
        )
        .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("2").unwrap().guide_name, "Channel 2");
        assert!(snapshot.get("3").is_none());
    }

    #[test]
    fn test_snapshot_rejects_duplicate_ids() {
        let result = CatalogSnapshot::new(
            vec![
                test_channel("1", "http://a.example/1.ts"),
                test_channel("1", "http://a.example/1b.ts"),
            ],
            vec![],
            vec![],
        );
        assert!(matches!(result, Err(CatalogError::DuplicateChannelId(_))));
    }

    #[test]
    fn test_snapshot_rejects_non_http_urls() {
        let mut channel = test_channel("1", "rtsp://a.example/1");
        channel.stream_urls = vec!["rtsp://a.example/1".to_string()];
        let result = CatalogSnapshot::new(vec![channel], vec![], vec![]);
        assert!(matches!(result, Err(CatalogError::BadStreamUrl { .. })));
    }

    #[test]
    fn test_snapshot_rejects_primary_mismatch() {
        let mut channel = test_channel("1", "http://a.example/1.ts");
        channel.stream_urls = vec![
            "http://b.example/1.ts".to_string(),
            "http://a.example/1.ts".to_string(),
        ];
        let result = CatalogSnapshot::new(vec![channel], vec![], vec![]);
        assert!(matches!(result, Err(CatalogError::PrimaryMismatch(_))));
    }

    #[test]
    fn test_snapshot_rejects_empty_stream_urls() {
        let mut channel = test_channel("1", "http://a.example/1.ts");
        channel.stream_urls = vec![];
        let result = CatalogSnapshot::new(vec![channel], vec![], vec![]);
        assert!(matches!(result, Err(CatalogError::NoStreamUrl(_))));
    }

    #[test]
    fn test_order_preserved() {
        let snapshot = CatalogSnapshot::new(
            vec![
                test_channel("9", "http://a.example/9.ts"),
                test_channel("1", "http://a.example/1.ts"),
                test_channel("5", "http://a.example/5.ts"),
            ],
            vec![],
            vec![],
        )
        .unwrap();
        let ids: Vec<&str> = snapshot.channels().iter().map(|c| c.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["9", "1", "5"]);
    }

    #[test]
    fn test_tvg_maps_skip_unlinked() {
        let mut linked = test_channel("1", "http://a.example/1.ts");
        linked.tvg_id = "BBC1.uk".to_string();
        linked.guide_number = "101".to_string();
        let unlinked = test_channel("2", "http://a.example/2.ts");

        let snapshot = CatalogSnapshot::new(vec![linked, unlinked], vec![], vec![]).unwrap();
        assert_eq!(snapshot.tvg_ids().len(), 1);
        assert_eq!(
            snapshot.tvg_to_guide_number().get("BBC1.uk").copied(),
            Some("101")
        );
    }

    #[test]
    fn test_epg_linked() {
        let mut channel = test_channel("1", "http://a.example/1.ts");
        assert!(!channel.epg_linked());
        channel.tvg_id = "X.uk".to_string();
        assert!(channel.epg_linked());
    }
}
