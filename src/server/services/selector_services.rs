// ranking is pure, no io anywhere in here
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::server::dtos::{ExtractorOutput, StreamDescriptor, StreamFormat, StreamSet};

static QUALITY_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("static quality regex should compile"));

/// labels extractors use for the master playlist of an adaptive stream
const MASTER_PLAYLIST_MARKERS: [&str; 2] = ["m3u8", "master"];

pub struct StreamSelector;

impl StreamSelector {
    /// first run of digits in the label, "1080p" is 1080 and "720p60" is 720
    pub fn quality_number(quality: &str) -> Option<u32> {
        QUALITY_DIGITS
            .find(quality)
            .and_then(|m| m.as_str().parse().ok())
    }

    /// labels without digits ("adaptive", "default", "unknown") rank at the bottom
    pub fn numeric_quality(quality: &str) -> u32 {
        Self::quality_number(quality).unwrap_or(0)
    }

    pub fn is_master_marker(quality: &str) -> bool {
        let quality = quality.trim();
        MASTER_PLAYLIST_MARKERS
            .iter()
            .any(|marker| quality.eq_ignore_ascii_case(marker))
    }

    /// dedupes by url (first one wins), sorts by descending quality keeping discovery order on
    /// ties and picks the default a player should start with
    pub fn rank(streams: Vec<StreamDescriptor>) -> StreamSet {
        if streams.is_empty() {
            return StreamSet::empty();
        }

        let mut seen = HashSet::new();
        let mut unique: Vec<StreamDescriptor> = streams
            .into_iter()
            .filter(|s| seen.insert(s.url().to_string()))
            .collect();

        // sort_by_key is stable so equal qualities stay in the order they were found
        unique.sort_by_key(|s| Reverse(Self::numeric_quality(s.quality())));

        let default = Self::pick_default(&unique).map(|s| s.url().to_string());
        debug!(
            "ranked {} streams, default: {:?}",
            unique.len(),
            default.as_deref()
        );

        StreamSet::new(unique, default)
    }

    /// master playlist marker first, then hls (adaptive labels before numbered renditions),
    /// then whatever ranked highest
    ///
    /// an mp4 carrying a master marker only wins when there is no hls at all, otherwise the
    /// default would not be adaptive even though an adaptive stream exists
    fn pick_default(ranked: &[StreamDescriptor]) -> Option<&StreamDescriptor> {
        let has_hls = ranked.iter().any(|s| s.is_hls());

        ranked
            .iter()
            .find(|s| Self::is_master_marker(s.quality()) && (s.is_hls() || !has_hls))
            .or_else(|| {
                ranked
                    .iter()
                    .find(|s| s.is_hls() && Self::quality_number(s.quality()).is_none())
            })
            .or_else(|| ranked.iter().find(|s| s.is_hls()))
            .or_else(|| ranked.first())
    }

    /// url for a specific quality label, the default when that label isn't there
    pub fn select<'a>(set: &'a StreamSet, quality: &str) -> Option<&'a str> {
        if quality.eq_ignore_ascii_case("default") {
            return set.default_url();
        }

        match set
            .streams()
            .iter()
            .find(|s| s.quality().eq_ignore_ascii_case(quality))
        {
            Some(stream) => Some(stream.url()),
            None => {
                debug!("quality {} not available, using default", quality);
                set.default_url()
            }
        }
    }

    /// turns what an extractor produced into descriptors and ranks them, streams that can't be
    /// made absolute are dropped with a warning instead of failing the whole set
    pub fn normalize(output: ExtractorOutput) -> StreamSet {
        let page_url = output.page_url.unwrap_or_default();

        let descriptors: Vec<StreamDescriptor> = output
            .streams
            .into_iter()
            .filter_map(|raw| {
                let format = raw.format.unwrap_or_else(|| StreamFormat::infer(&raw.url));
                match StreamDescriptor::resolve(raw.quality, format, &raw.url, &page_url) {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        warn!("dropping stream from extractor output: {}", e);
                        None
                    }
                }
            })
            .collect();

        Self::rank(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_number_takes_first_digit_run() {
        assert_eq!(StreamSelector::quality_number("1080p"), Some(1080));
        assert_eq!(StreamSelector::quality_number("720p60"), Some(720));
        assert_eq!(StreamSelector::quality_number("adaptive"), None);
        assert_eq!(StreamSelector::numeric_quality("unknown"), 0);
    }

    #[test]
    fn test_master_marker_is_case_insensitive() {
        assert!(StreamSelector::is_master_marker("M3U8"));
        assert!(StreamSelector::is_master_marker(" master "));
        assert!(!StreamSelector::is_master_marker("adaptive"));
    }
}
