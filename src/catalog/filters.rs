//! Catalog filters
//!
//! Applied after assembly, before the snapshot is built. Order matters:
//! EPG-link filtering first (it can only shrink the set), then quality
//! deduplication so the tier comparison sees every remaining feed.

use std::collections::HashMap;

use super::model::LiveChannel;

/// Keep only channels with a tvg-id correlation
pub fn epg_linked_only(channels: Vec<LiveChannel>) -> Vec<LiveChannel> {
    let before = channels.len();
    let kept: Vec<LiveChannel> = channels.into_iter().filter(|c| c.epg_linked()).collect();
    if kept.len() != before {
        tracing::info!(
            dropped = before - kept.len(),
            kept = kept.len(),
            "dropped channels without tvg-id"
        );
    }
    kept
}

/// For each tvg-id keep only the highest quality tier
///
/// Unlinked channels (empty tvg-id) pass through untouched. Among feeds
/// with the same tvg-id and tier, the first one listed wins. The winner
/// keeps its original position in the lineup.
pub fn dedup_by_quality(channels: Vec<LiveChannel>) -> Vec<LiveChannel> {
    // tvg_id -> (position of current winner, tier)
    let mut winners: HashMap<String, (usize, crate::xtream::QualityTier)> = HashMap::new();

    for (position, channel) in channels.iter().enumerate() {
        if !channel.epg_linked() {
            continue;
        }
        match winners.get(&channel.tvg_id) {
            Some((_, best)) if *best >= channel.quality_tier => {}
            _ => {
                winners.insert(channel.tvg_id.clone(), (position, channel.quality_tier));
            }
        }
    }

    let before = channels.len();
    let kept: Vec<LiveChannel> = channels
        .into_iter()
        .enumerate()
        .filter(|(position, channel)| {
            if !channel.epg_linked() {
                return true;
            }
            winners
                .get(&channel.tvg_id)
                .map(|(winner, _)| winner == position)
                .unwrap_or(true)
        })
        .map(|(_, channel)| channel)
        .collect();

    if kept.len() != before {
        tracing::info!(
            dropped = before - kept.len(),
            kept = kept.len(),
            "deduplicated feeds by quality tier"
        );
    }
    kept
}
