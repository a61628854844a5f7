//! HDHomeRun device emulation
//!
//! The media server discovers the tuner through `discover.json` and friends
//! and expects exact HDHomeRun field names (PascalCase, `DeviceID`,
//! `BaseURL`). The lineup advertised here, the playlist, and the guide all
//! agree on guide numbers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::catalog::CatalogSnapshot;
use crate::config::Config;

/// HDHomeRun discovery response for `GET /discover.json`
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    pub tuner_count: u32,
}

/// One lineup entry for `GET /lineup.json`
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// Static status for `GET /lineup_status.json`
///
/// IPTV sources are pre-configured; there is nothing to scan.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// Generate a stable DeviceID from the machine hostname
///
/// Persists across restarts without any stored state.
pub fn generate_device_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tunerforge".to_string());

    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    format!("TUNERFORGE{:08X}", hasher.finish() as u32)
}

/// The base URL advertised to the media server
///
/// `base_url` from config wins; otherwise the local IP is detected.
pub fn advertised_base_url(config: &Config) -> String {
    if let Some(base) = &config.base_url {
        return base.trim_end_matches('/').to_string();
    }
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    format!("http://{}:{}", ip, config.listen_port)
}

/// Build the discovery document
pub fn discover_response(config: &Config) -> DiscoverResponse {
    let base_url = advertised_base_url(config);
    DiscoverResponse {
        friendly_name: "TunerForge".to_string(),
        model_number: "HDHR5-4K".to_string(),
        firmware_name: "hdhomerun5_atsc".to_string(),
        firmware_version: "20200101".to_string(),
        device_id: generate_device_id(),
        device_auth: "tunerforge".to_string(),
        lineup_url: format!("{}/lineup.json", base_url),
        base_url,
        tuner_count: config.tuner_count,
    }
}

/// Build the lineup, truncated to the configured cap
///
/// Channels keep catalog order; truncation drops from the tail, with a
/// warning, because media servers reject oversized lineups outright.
pub fn lineup(config: &Config, catalog: &CatalogSnapshot) -> Vec<LineupEntry> {
    let base_url = advertised_base_url(config);
    let cap = config.lineup_max_channels;

    if catalog.len() > cap {
        tracing::warn!(
            channels = catalog.len(),
            cap,
            "lineup exceeds cap, truncating from the end"
        );
    }

    catalog
        .channels()
        .iter()
        .take(cap)
        .map(|channel| LineupEntry {
            guide_number: channel.guide_number.clone(),
            guide_name: channel.guide_name.clone(),
            url: format!("{}/stream/{}", base_url, channel.channel_id),
        })
        .collect()
}

/// Build the lineup status document
pub fn lineup_status() -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 0,
        source: "Antenna".to_string(),
        source_list: vec!["Antenna".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::test_channel;
    use crate::config::GateTimeoutPolicy;

    fn test_config() -> Config {
        let mut config = Config::new(GateTimeoutPolicy::Stream);
        config.base_url = Some("http://192.0.2.10:5004".to_string());
        config
    }

    fn catalog_of(n: usize) -> CatalogSnapshot {
        let channels = (0..n)
            .map(|i| test_channel(&i.to_string(), &format!("http://h/{}.ts", i)))
            .collect();
        CatalogSnapshot::new(channels, vec![], vec![]).unwrap()
    }

    #[test]
    fn test_device_id_is_stable() {
        let one = generate_device_id();
        let two = generate_device_id();
        assert_eq!(one, two);
        assert!(one.starts_with("TUNERFORGE"));
    }

    #[test]
    fn test_discover_uses_configured_base_url() {
        let response = discover_response(&test_config());
        assert_eq!(response.base_url, "http://192.0.2.10:5004");
        assert_eq!(response.lineup_url, "http://192.0.2.10:5004/lineup.json");
        assert_eq!(response.tuner_count, 2);
    }

    #[test]
    fn test_discover_serializes_hdhr_field_names() {
        let json = serde_json::to_value(discover_response(&test_config())).unwrap();
        for field in [
            "FriendlyName",
            "ModelNumber",
            "DeviceID",
            "DeviceAuth",
            "BaseURL",
            "LineupURL",
            "TunerCount",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_lineup_entry_field_names() {
        let entries = lineup(&test_config(), &catalog_of(1));
        let json = serde_json::to_value(&entries[0]).unwrap();
        assert!(json.get("GuideNumber").is_some());
        assert!(json.get("GuideName").is_some());
        assert!(json.get("URL").is_some());
        assert_eq!(
            json["URL"].as_str().unwrap(),
            "http://192.0.2.10:5004/stream/0"
        );
    }

    #[test]
    fn test_lineup_truncates_from_tail_preserving_order() {
        let mut config = test_config();
        config.lineup_max_channels = 3;
        let entries = lineup(&config, &catalog_of(5));
        assert_eq!(entries.len(), 3);
        let numbers: Vec<&str> = entries.iter().map(|e| e.guide_number.as_str()).collect();
        assert_eq!(numbers, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_lineup_under_cap_is_untouched() {
        let entries = lineup(&test_config(), &catalog_of(5));
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_lineup_status_shape() {
        let status = lineup_status();
        assert_eq!(status.scan_in_progress, 0);
        assert_eq!(status.source, "Antenna");
        assert_eq!(status.source_list, vec!["Antenna".to_string()]);
    }
}
