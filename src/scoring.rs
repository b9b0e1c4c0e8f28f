//! Trust buckets and announcement rendering

use crate::reputation::TrustProfile;
use std::fmt;

/// Hard length limit of a single feed post, in characters
pub const MAX_POST_CHARS: usize = 280;

/// Number of dimensions shown in an announcement
const ANNOUNCED_DIMENSIONS: usize = 3;

/// Named score range used for display and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustBucket {
    Exceptional,
    High,
    Moderate,
    Low,
    Minimal,
}

impl TrustBucket {
    pub fn for_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => TrustBucket::Exceptional,
            70..=89 => TrustBucket::High,
            50..=69 => TrustBucket::Moderate,
            25..=49 => TrustBucket::Low,
            _ => TrustBucket::Minimal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrustBucket::Exceptional => "exceptional",
            TrustBucket::High => "high",
            TrustBucket::Moderate => "moderate",
            TrustBucket::Low => "low",
            TrustBucket::Minimal => "minimal",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            TrustBucket::Exceptional => "🟢",
            TrustBucket::High => "🔵",
            TrustBucket::Moderate => "🟡",
            TrustBucket::Low => "🟠",
            TrustBucket::Minimal => "⚪",
        }
    }
}

impl fmt::Display for TrustBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TrustBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exceptional" => Ok(TrustBucket::Exceptional),
            "high" => Ok(TrustBucket::High),
            "moderate" => Ok(TrustBucket::Moderate),
            "low" => Ok(TrustBucket::Low),
            "minimal" => Ok(TrustBucket::Minimal),
            other => Err(format!("unknown trust bucket: {other}")),
        }
    }
}

pub fn trust_bucket(score: u8) -> TrustBucket {
    TrustBucket::for_score(score)
}

pub fn trust_emoji(score: u8) -> &'static str {
    TrustBucket::for_score(score).emoji()
}

/// Public explorer link for an entity
pub fn explorer_link(network: &str, entity_id: u64) -> String {
    format!("https://8004scan.io/agents/{network}/{entity_id}")
}

/// Render a profile as a feed announcement of at most [`MAX_POST_CHARS`] characters.
///
/// The full form carries the bucket name and up to three dimension scores.
/// When it does not fit, a short form without dimension detail is used.
pub fn format_announcement(profile: &TrustProfile, network: &str) -> String {
    let bucket = trust_bucket(profile.average_score);

    let dimension_line = {
        let parts: Vec<String> = profile
            .dimensions()
            .take(ANNOUNCED_DIMENSIONS)
            .map(|d| format!("{}:{}", d.dimension.abbreviation(), d.value))
            .collect();
        if parts.is_empty() {
            String::new()
        } else {
            format!("\n📊 {}", parts.join(" | "))
        }
    };

    let full = format!(
        "🦞 New AI agent registered on ERC-8004!\n\n\
         Agent #{id}\n\
         {emoji} Trust: {score}/100 ({bucket}){dimension_line}\n\n\
         🔗 {link}\n\n\
         #ERC8004 #AIAgents",
        id = profile.entity_id,
        emoji = bucket.emoji(),
        score = profile.average_score,
        bucket = bucket.name(),
        link = explorer_link(network, profile.entity_id),
    );

    if char_len(&full) <= MAX_POST_CHARS {
        return full;
    }

    let short = format!(
        "🦞 New AI agent on ERC-8004!\n\n\
         Agent #{id}\n\
         {emoji} Trust: {score}/100\n\n\
         🔗 8004scan.io/agents/{network}/{id}",
        id = profile.entity_id,
        emoji = bucket.emoji(),
        score = profile.average_score,
    );

    truncate_chars(short, MAX_POST_CHARS)
}

/// Multi-line human readable summary of a profile
pub fn format_trust_display(profile: &TrustProfile) -> String {
    let mut lines = vec![
        format!("Agent #{}", profile.entity_id),
        format!(
            "Trust: {}/100 {} ({})",
            profile.average_score,
            trust_emoji(profile.average_score),
            trust_bucket(profile.average_score)
        ),
    ];

    if profile.dimension_scores.is_empty() {
        lines.push("Dimensions: none reported".to_string());
    } else {
        lines.push("Dimensions:".to_string());
        for score in profile.dimensions() {
            lines.push(format!("  • {}: {}", capitalize(score.dimension.as_str()), score.value));
        }
    }

    if profile.feedback_count > 0 {
        lines.push(format!("Feedback count: {}", profile.feedback_count));
    }

    lines.join("\n")
}

/// Dimensions as ten-cell bars, one line each
pub fn format_dimension_bars(profile: &TrustProfile) -> String {
    if profile.dimension_scores.is_empty() {
        return "No reputation data".to_string();
    }

    profile
        .dimensions()
        .map(|score| {
            let filled = (score.value / 10).min(10) as usize;
            let bar = format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled));
            format!("{:<11} [{}] {:>3}", score.dimension.as_str(), bar, score.value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn truncate_chars(text: String, max: usize) -> String {
    if char_len(&text) <= max {
        return text;
    }
    text.chars().take(max).collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
