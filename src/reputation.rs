//! Trust profile data model and reputation normalization
//!
//! Everything in this module is pure: no I/O, no clocks, no network.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Upper bound of every normalized score
pub const MAX_SCORE: u8 = 100;

/// The five reputation dimensions an entity can be scored on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustDimension {
    Quality,
    Reliability,
    Speed,
    Safety,
    Alignment,
}

impl TrustDimension {
    pub const ALL: [TrustDimension; 5] = [
        TrustDimension::Quality,
        TrustDimension::Reliability,
        TrustDimension::Speed,
        TrustDimension::Safety,
        TrustDimension::Alignment,
    ];

    /// Lowercase name, also used as the on-chain feedback tag
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustDimension::Quality => "quality",
            TrustDimension::Reliability => "reliability",
            TrustDimension::Speed => "speed",
            TrustDimension::Safety => "safety",
            TrustDimension::Alignment => "alignment",
        }
    }

    /// Three letter upper-case label used in announcements
    pub fn abbreviation(&self) -> &'static str {
        match self {
            TrustDimension::Quality => "QUA",
            TrustDimension::Reliability => "REL",
            TrustDimension::Speed => "SPE",
            TrustDimension::Safety => "SAF",
            TrustDimension::Alignment => "ALI",
        }
    }
}

impl fmt::Display for TrustDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale a raw fixed-point contract value down to the 0-100 range.
///
/// The value is divided by `10^decimals` with truncation and then clamped.
/// Negative values clamp to zero, and a scale that does not fit in `i128`
/// leaves nothing above zero.
pub fn normalize(raw_value: i128, decimals: u32) -> u8 {
    let scaled = if decimals > 0 {
        match 10i128.checked_pow(decimals) {
            Some(divisor) => raw_value / divisor,
            None => 0,
        }
    } else {
        raw_value
    };

    scaled.clamp(0, MAX_SCORE as i128) as u8
}

/// Floor of the mean of the present dimension values, 0 when empty
pub fn average(dimension_scores: &BTreeMap<TrustDimension, DimensionScore>) -> u8 {
    if dimension_scores.is_empty() {
        return 0;
    }

    let total: u32 = dimension_scores.values().map(|d| d.value as u32).sum();
    (total / dimension_scores.len() as u32) as u8
}

/// Score for a single reputation dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: TrustDimension,
    /// Normalized 0-100
    pub value: u8,
    pub raw_value: i128,
    pub decimals: u32,
}

impl DimensionScore {
    pub fn from_contract(dimension: TrustDimension, raw_value: i128, decimals: u32) -> Self {
        Self {
            dimension,
            value: normalize(raw_value, decimals),
            raw_value,
            decimals,
        }
    }
}

/// Aggregate reputation fetched for one entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReputationSummary {
    pub feedback_count: u64,
    /// Already normalized to 0-100
    pub average: u8,
    pub dimensions: Vec<DimensionScore>,
}

/// Complete trust profile for a registered entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustProfile {
    pub entity_id: u64,
    pub owner: String,
    pub uri: Option<String>,
    pub dimension_scores: BTreeMap<TrustDimension, DimensionScore>,
    pub feedback_count: u64,
    pub average_score: u8,
    pub registered_via_special_channel: bool,
    pub has_reputation: bool,
    pub registered_at_block: Option<u64>,
    pub tx_hash: Option<String>,
}

impl TrustProfile {
    /// Profile with no reputation data attached
    pub fn new(entity_id: u64, owner: impl Into<String>) -> Self {
        Self {
            entity_id,
            owner: owner.into(),
            uri: None,
            dimension_scores: BTreeMap::new(),
            feedback_count: 0,
            average_score: 0,
            registered_via_special_channel: false,
            has_reputation: false,
            registered_at_block: None,
            tx_hash: None,
        }
    }

    /// Build a profile from fetched reputation data.
    ///
    /// `has_reputation` is derived from the summary and never set directly.
    pub fn from_reputation(
        entity_id: u64,
        owner: impl Into<String>,
        reputation: Option<ReputationSummary>,
    ) -> Self {
        let mut profile = Self::new(entity_id, owner);

        if let Some(summary) = reputation {
            for score in summary.dimensions {
                profile.dimension_scores.insert(score.dimension, score);
            }
            profile.feedback_count = summary.feedback_count;
            profile.average_score = summary.average.min(MAX_SCORE);
            profile.has_reputation = profile.feedback_count > 0 || profile.average_score > 0;
        }

        profile
    }

    pub fn with_registration(mut self, block_number: Option<u64>, tx_hash: Option<String>) -> Self {
        self.registered_at_block = block_number;
        self.tx_hash = tx_hash;
        self
    }

    /// Present dimension scores in declaration order
    pub fn dimensions(&self) -> impl Iterator<Item = &DimensionScore> {
        self.dimension_scores.values()
    }

    /// Mean of the per-dimension scores, as opposed to the on-chain aggregate
    pub fn dimension_average(&self) -> u8 {
        average(&self.dimension_scores)
    }

    pub fn is_verified(&self) -> bool {
        self.has_reputation || self.feedback_count > 0
    }
}
