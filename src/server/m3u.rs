//! M3U playlist generation
//!
//! `GET /live.m3u` renders the lineup as an extended M3U for clients that
//! prefer a playlist over HDHomeRun discovery. The tvg-ids and guide
//! numbers here match `guide.xml`, so EPG correlation works either way.

use crate::catalog::CatalogSnapshot;
use crate::config::Config;
use crate::server::hdhr::advertised_base_url;

/// Render the playlist, honouring the lineup cap
pub fn generate_playlist(config: &Config, catalog: &CatalogSnapshot) -> String {
    let base_url = advertised_base_url(config);
    let mut out = String::with_capacity(catalog.len() * 128 + 16);
    out.push_str("#EXTM3U\n");

    for channel in catalog.channels().iter().take(config.lineup_max_channels) {
        out.push_str("#EXTINF:-1");
        if channel.epg_linked() {
            out.push_str(&format!(" tvg-id=\"{}\"", channel.tvg_id));
        }
        out.push_str(&format!(" tvg-chno=\"{}\"", channel.guide_number));
        if let Some(group) = &channel.group_title {
            out.push_str(&format!(" group-title=\"{}\"", group.replace('"', "'")));
        }
        out.push(',');
        out.push_str(&channel.guide_name);
        out.push('\n');
        out.push_str(&format!("{}/stream/{}\n", base_url, channel.channel_id));
    }

    out
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

    #[test]
    fn test_playlist_header_and_entries() {
        let mut channel = test_channel("42", "http://h/42.ts");
        channel.tvg_id = "BBC1.uk".to_string();
        channel.guide_number = "101".to_string();
        channel.guide_name = "BBC One".to_string();
        channel.group_title = Some("UK".to_string());
        let catalog = CatalogSnapshot::new(vec![channel], vec![], vec![]).unwrap();

        let m3u = generate_playlist(&test_config(), &catalog);
        assert!(m3u.starts_with("#EXTM3U\n"));
        assert!(m3u.contains("tvg-id=\"BBC1.uk\""));
        assert!(m3u.contains("tvg-chno=\"101\""));
        assert!(m3u.contains("group-title=\"UK\""));
        assert!(m3u.contains(",BBC One\n"));
        assert!(m3u.contains("http://192.0.2.10:5004/stream/42\n"));
    }

    #[test]
    fn test_playlist_omits_empty_tvg_id() {
        let catalog =
            CatalogSnapshot::new(vec![test_channel("1", "http://h/1.ts")], vec![], vec![])
                .unwrap();
        let m3u = generate_playlist(&test_config(), &catalog);
        assert!(!m3u.contains("tvg-id="));
    }

    #[test]
    fn test_playlist_respects_lineup_cap() {
        let channels = (0..10)
            .map(|i| test_channel(&i.to_string(), &format!("http://h/{}.ts", i)))
            .collect();
        let catalog = CatalogSnapshot::new(channels, vec![], vec![]).unwrap();

        let mut config = test_config();
        config.lineup_max_channels = 4;
        let m3u = generate_playlist(&config, &catalog);
        assert_eq!(m3u.matches("#EXTINF").count(), 4);
    }
}
