//! Streaming M3U playlist parser
//!
//! Parses `#EXTM3U` playlists line by line as the body downloads, teeing
//! every byte through a rolling hash. The hash gives change detection even
//! when the origin sends no ETag or Last-Modified, which most playlist
//! origins don't.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};

/// Error types for playlist fetching and parsing
#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not an M3U playlist: {0}")]
    NotAPlaylist(String),
}

/// One `#EXTINF` entry
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub name: String,
    pub url: String,
    /// tvg-id attribute; empty when absent
    pub tvg_id: String,
    pub tvg_chno: Option<String>,
    pub group_title: Option<String>,
    pub tvg_logo: Option<String>,
}

/// A fully parsed playlist with its body hash
#[derive(Debug)]
pub struct ParsedPlaylist {
    pub entries: Vec<PlaylistEntry>,
    /// Hex sha256 over the raw body bytes
    pub content_hash: String,
}

/// Extract a quoted attribute value from an `#EXTINF` line
fn extinf_attr(line: &str, key: &str) -> Option<String> {
    let marker = format!("{}=\"", key);
    let start = line.find(&marker)? + marker.len();
    let end = line[start..].find('"')? + start;
    Some(line[start..end].to_string())
}

/// The display name after the last comma of an `#EXTINF` line
///
/// Attribute values may themselves contain commas, so the split point is
/// the first comma after the closing quote of the last attribute.
fn extinf_name(line: &str) -> String {
    let after_attrs = match line.rfind('"') {
        Some(q) => &line[q + 1..],
        None => line,
    };
    match after_attrs.find(',') {
        Some(c) => after_attrs[c + 1..].trim().to_string(),
        None => String::new(),
    }
}

/// Incremental line-oriented parser
#[derive(Debug, Default)]
pub struct PlaylistParser {
    entries: Vec<PlaylistEntry>,
    pending: Option<PlaylistEntry>,
    saw_header: bool,
    line_count: usize,
}

impl PlaylistParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one complete line
    pub fn feed_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            return;
        }
        self.line_count += 1;

        if line.starts_with("#EXTM3U") {
            self.saw_header = true;
            return;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            self.pending = Some(PlaylistEntry {
                name: extinf_name(rest),
                url: String::new(),
                tvg_id: extinf_attr(rest, "tvg-id").unwrap_or_default(),
                tvg_chno: extinf_attr(rest, "tvg-chno"),
                group_title: extinf_attr(rest, "group-title"),
                tvg_logo: extinf_attr(rest, "tvg-logo"),
            });
            return;
        }

        if line.starts_with('#') {
            // EXTGRP, EXTVLCOPT and friends are ignored
            return;
        }

        // A bare URL line closes the pending entry
        if let Some(mut entry) = self.pending.take() {
            entry.url = line.to_string();
            self.entries.push(entry);
        }
    }

    /// True once the `#EXTM3U` header was seen
    pub fn saw_header(&self) -> bool {
        self.saw_header
    }

    pub fn into_entries(self) -> Vec<PlaylistEntry> {
        self.entries
    }
}

/// Parse a playlist from a byte stream, hashing as it goes
///
/// Rejects bodies that never present an `#EXTM3U` header.
pub async fn parse_stream<S>(mut body: S) -> Result<ParsedPlaylist, PlaylistError>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut parser = PlaylistParser::new();
    let mut hasher = Sha256::new();
    let mut partial = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);

        partial.extend_from_slice(&chunk);
        // Drain complete lines, keep the trailing partial
        while let Some(newline) = partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = partial.drain(..=newline).collect();
            parser.feed_line(&String::from_utf8_lossy(&line[..line.len() - 1]));
        }
    }
    if !partial.is_empty() {
        parser.feed_line(&String::from_utf8_lossy(&partial));
    }

    if !parser.saw_header() {
        return Err(PlaylistError::NotAPlaylist(
            "body lacks an #EXTM3U header".to_string(),
        ));
    }

    let content_hash = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(ParsedPlaylist {
        entries: parser.into_entries(),
        content_hash,
    })
}

/// Derive a stable channel id from a playlist entry URL
///
/// Xtream-shaped URLs end in `/{stream_id}.ts`; for anything else the id is
/// a truncated hash of the URL.
pub fn channel_id_for_url(url: &str) -> String {
    let last = url.rsplit('/').next().unwrap_or("");
    let stem = last.split('.').next().unwrap_or("");
    if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) {
        return stem.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"BBC1.uk\" tvg-chno=\"101\" group-title=\"UK, News\" tvg-logo=\"http://logos.example/bbc1.png\",BBC One HD\n\
        http://host.example:8080/live/u/p/1234.ts\n\
        #EXTINF:-1,Bare Channel\n\
        http://host.example:8080/other/stream\n";

    fn parse_str(input: &str) -> PlaylistParser {
        let mut parser = PlaylistParser::new();
        for line in input.lines() {
            parser.feed_line(line);
        }
        parser
    }

    #[test]
    fn test_parse_attributes_and_name() {
        let parser = parse_str(SAMPLE);
        assert!(parser.saw_header());
        let entries = parser.into_entries();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.name, "BBC One HD");
        assert_eq!(first.tvg_id, "BBC1.uk");
        assert_eq!(first.tvg_chno.as_deref(), Some("101"));
        // group-title values may contain commas; the name split must not eat them
        assert_eq!(first.group_title.as_deref(), Some("UK, News"));
        assert_eq!(first.url, "http://host.example:8080/live/u/p/1234.ts");

        let second = &entries[1];
        assert_eq!(second.name, "Bare Channel");
        assert_eq!(second.tvg_id, "");
    }

    #[test]
    fn test_url_without_extinf_is_ignored() {
        let parser = parse_str("#EXTM3U\nhttp://host.example/naked.ts\n");
        assert!(parser.into_entries().is_empty());
    }

    #[test]
    fn test_crlf_lines() {
        let mut parser = PlaylistParser::new();
        parser.feed_line("#EXTM3U\r");
        parser.feed_line("#EXTINF:-1 tvg-id=\"X\",Name\r");
        parser.feed_line("http://h.example/1.ts\r");
        let entries = parser.into_entries();
        assert_eq!(entries[0].url, "http://h.example/1.ts");
    }

    #[tokio::test]
    async fn test_parse_stream_across_chunk_boundaries() {
        // Split mid-line to exercise the partial-line buffer
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"#EXTM3U\n#EXTINF:-1 tvg-id=\"A.uk\"")),
            Ok(Bytes::from_static(b",Alpha\nhttp://h.example/li")),
            Ok(Bytes::from_static(b"ve/u/p/77.ts\n")),
        ];
        let stream = futures_util::stream::iter(chunks);
        let parsed = parse_stream(stream).await.unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].url, "http://h.example/live/u/p/77.ts");
        assert_eq!(parsed.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_parse_stream_rejects_non_playlist() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b"<html>not a playlist</html>"))];
        let stream = futures_util::stream::iter(chunks);
        assert!(matches!(
            parse_stream(stream).await,
            Err(PlaylistError::NotAPlaylist(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_changes_with_body() {
        let one = parse_stream(futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(
            Bytes::from_static(b"#EXTM3U\n#EXTINF:-1,A\nhttp://h/1.ts\n"),
        )]))
        .await
        .unwrap();
        let two = parse_stream(futures_util::stream::iter(vec![Ok::<_, reqwest::Error>(
            Bytes::from_static(b"#EXTM3U\n#EXTINF:-1,A\nhttp://h/2.ts\n"),
        )]))
        .await
        .unwrap();
        assert_ne!(one.content_hash, two.content_hash);
    }

    #[test]
    fn test_channel_id_from_xtream_url() {
        assert_eq!(channel_id_for_url("http://h/live/u/p/1234.ts"), "1234");
    }

    #[test]
    fn test_channel_id_from_opaque_url() {
        let id = channel_id_for_url("http://h/other/stream");
        assert_eq!(id.len(), 16);
        assert_eq!(id, channel_id_for_url("http://h/other/stream"));
    }
}
