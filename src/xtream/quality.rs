//! Quality tier detection for channel names
//!
//! Providers encode the feed quality in the channel name ("ESPN 4K",
//! "BBC One FHD"). The detected tier drives per-tvg-id deduplication: when
//! several feeds correlate to the same guide channel, only the highest tier
//! is kept.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Feed quality tier, ordered so that `max()` picks the best feed
///
/// `Raw` marks feeds whose name carries no recognisable quality marker at
/// all; they lose against any recognised tier, explicit SD included.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityTier {
    Raw = -1,
    Sd = 0,
    Hd = 1,
    Uhd = 2,
}

impl QualityTier {
    /// Numeric value used in persisted catalogs
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            QualityTier::Uhd => "UHD",
            QualityTier::Hd => "HD",
            QualityTier::Sd => "SD",
            QualityTier::Raw => "RAW",
        };
        write!(f, "{}", label)
    }
}

/// Detect the quality tier from a channel name
///
/// # Detection patterns
/// - **UHD**: "4K", "UHD", "2160p"
/// - **HD**: "FHD", "1080p", "720p", or a standalone "HD" token
/// - **SD**: "SD", "480p", "576p"
/// - **RAW**: no recognisable marker at all
///
/// An explicit SD marker and the absence of any marker are different
/// signals: a feed that says nothing about its quality loses against any
/// tagged feed during per-tvg-id deduplication.
pub fn detect_tier(channel_name: &str) -> QualityTier {
    static UHD: OnceLock<Regex> = OnceLock::new();
    static HD: OnceLock<Regex> = OnceLock::new();
    static SD: OnceLock<Regex> = OnceLock::new();

    let uhd = UHD.get_or_init(|| {
        Regex::new(r"(?i)\b(4K|UHD|2160[pPi])\b").expect("Invalid UHD regex")
    });
    let hd = HD.get_or_init(|| {
        Regex::new(r"(?i)\b(FHD|1080[pPi]|720[pPi])\b").expect("Invalid HD regex")
    });
    let sd = SD.get_or_init(|| {
        Regex::new(r"(?i)\bSD\b|\b(480[pPi]|576[pPi])\b").expect("Invalid SD regex")
    });

    if uhd.is_match(channel_name) {
        return QualityTier::Uhd;
    }
    if hd.is_match(channel_name) || has_standalone_hd(channel_name) {
        return QualityTier::Hd;
    }
    if sd.is_match(channel_name) {
        return QualityTier::Sd;
    }
    QualityTier::Raw
}

/// Check for a standalone "HD" token that is not part of "FHD" or "UHD"
fn has_standalone_hd(name: &str) -> bool {
    let upper = name.to_uppercase();
    let bytes = upper.as_bytes();

    let mut idx = 0;
    while let Some(pos) = upper[idx..].find("HD") {
        let absolute = idx + pos;

        let preceded_by_f_or_u =
            absolute > 0 && matches!(bytes[absolute - 1], b'F' | b'U');
        let at_word_start = absolute == 0
            || !bytes[absolute - 1].is_ascii_alphanumeric();
        let after = absolute + 2;
        let at_word_end =
            after >= bytes.len() || !bytes[after].is_ascii_alphanumeric();

        if at_word_start && at_word_end && !preceded_by_f_or_u {
            return true;
        }

        idx = absolute + 2;
        if idx >= upper.len() {
            break;
        }
    }

    false
}
