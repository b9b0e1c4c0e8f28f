//! Trust filter deciding which registrations are worth announcing

use crate::reputation::TrustProfile;
use crate::scoring::TrustBucket;
use std::fmt;

/// Substrings that mark a registration as coming through the special channel
const SPECIAL_CHANNEL_MARKERS: &[&str] = &["chaoschain", "0xCHAOS"];

/// Marker looked for in metadata URIs
const SPECIAL_CHANNEL_URI_MARKER: &str = "chaoschain";

/// Configuration for trust-based filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustFilterConfig {
    /// Minimum average score to announce
    pub min_trust_score: u8,
    /// Always announce registrations made through the special channel
    pub announce_special_channel: bool,
    /// Announce any entity that already has feedback
    pub announce_with_any_reputation: bool,
}

impl Default for TrustFilterConfig {
    fn default() -> Self {
        Self {
            min_trust_score: 60,
            announce_special_channel: true,
            announce_with_any_reputation: true,
        }
    }
}

/// Which rule let a profile through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceReason {
    SpecialChannel,
    HasReputation,
    ScoreThreshold,
}

impl fmt::Display for AnnounceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnounceReason::SpecialChannel => write!(f, "special_channel"),
            AnnounceReason::HasReputation => write!(f, "has_reputation"),
            AnnounceReason::ScoreThreshold => write!(f, "score_threshold"),
        }
    }
}

/// Evaluate the announce rules in priority order, stopping at the first match.
pub fn evaluate(profile: &TrustProfile, config: &TrustFilterConfig) -> Option<AnnounceReason> {
    if config.announce_special_channel && profile.registered_via_special_channel {
        return Some(AnnounceReason::SpecialChannel);
    }

    if config.announce_with_any_reputation && profile.has_reputation {
        return Some(AnnounceReason::HasReputation);
    }

    if profile.average_score >= config.min_trust_score {
        return Some(AnnounceReason::ScoreThreshold);
    }

    None
}

pub fn should_announce(profile: &TrustProfile, config: &TrustFilterConfig) -> bool {
    evaluate(profile, config).is_some()
}

/// Detect a registration made through the special channel.
///
/// The transaction input is matched both as hex and as decoded bytes, since
/// ABI-encoded string arguments carry the marker text verbatim.
pub fn is_special_channel_registration(input: &[u8], uri: Option<&str>) -> bool {
    let hex_input = ethers::utils::hex::encode(input);
    let text_input = String::from_utf8_lossy(input).to_lowercase();

    for marker in SPECIAL_CHANNEL_MARKERS {
        let marker = marker.to_lowercase();
        if hex_input.contains(&marker) || text_input.contains(&marker) {
            return true;
        }
    }

    uri.map(|u| u.to_lowercase().contains(SPECIAL_CHANNEL_URI_MARKER))
        .unwrap_or(false)
}

pub fn filter_by_bucket(profile: &TrustProfile, bucket: TrustBucket) -> bool {
    TrustBucket::for_score(profile.average_score) == bucket
}
