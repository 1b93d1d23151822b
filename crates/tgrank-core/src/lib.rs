//! Core domain model for the channel rating aggregator.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tgrank-core";

/// Which of the two fixed rating pages a draft came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Ranked by subscriber count (`?sort=members`).
    Members,
    /// Ranked by citation index (`?sort=ci`).
    Citation,
}

impl SourceKind {
    pub fn id(self) -> &'static str {
        match self {
            SourceKind::Members => "members",
            SourceKind::Citation => "ci",
        }
    }
}

/// One channel card as parsed from a rating page. Ephemeral: produced per
/// extraction call and consumed immediately by the merge stage.
///
/// `url` is the canonical profile URL and the merge identity. It is unique
/// within one source's output but may collide across the two sources for the
/// same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDraft {
    pub url: String,
    pub name: String,
    pub subscribers: u64,
    pub category: String,
    pub image: String,
    /// Position in the source's own ordering (the `#N` ribbon), 0 if absent.
    pub rank: u64,
    /// Citation index; only meaningful on the citation page, 0 otherwise.
    pub ci: u64,
}

/// Output of the merge stage: one entry per distinct `url` seen in either
/// source, with the per-field combination rules already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedChannel {
    pub url: String,
    pub name: String,
    pub subscribers: u64,
    pub category: String,
    pub image: String,
    /// Mean of the two sides' source ranks (1 decimal place) when the
    /// channel appears in both rankings, otherwise its single source rank.
    pub rating: f64,
    pub ci: u64,
}

/// A merged channel decorated with its engagement index and, after the
/// deviation stage, its category-relative delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChannel {
    pub url: String,
    pub name: String,
    pub subscribers: u64,
    pub category: String,
    pub image: String,
    pub rating: f64,
    pub ci: u64,
    /// Engagement index, rounded to 2 decimal places. Always finite.
    pub er: f64,
    /// Rounded percentage deviation from the category mean engagement index.
    pub category_delta_percent: i64,
}

/// Final record handed to persistence, notification, and presentation.
/// Immutable once the ranked sequence is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChannel {
    pub url: String,
    pub name: String,
    pub subscribers: u64,
    pub category: String,
    pub image: String,
    pub rating: f64,
    pub ci: u64,
    pub er: f64,
    /// Deviation from the category mean; the only field that gates alerts.
    pub category_delta_percent: i64,
    /// Deviation from the truncated pool's global mean. Computed for parity
    /// with the reference behavior but consumed by nothing; vestigial.
    pub mean_delta_percent: i64,
}

impl RankedChannel {
    pub fn from_scored(scored: ScoredChannel, mean_delta_percent: i64) -> Self {
        Self {
            url: scored.url,
            name: scored.name,
            subscribers: scored.subscribers,
            category: scored.category,
            image: scored.image,
            rating: scored.rating,
            ci: scored.ci,
            er: scored.er,
            category_delta_percent: scored.category_delta_percent,
            mean_delta_percent,
        }
    }
}

/// Round to 1 decimal place (rating).
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to 2 decimal places (engagement index).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Signed deltas stay numeric internally; the explicit `+` prefix is applied
/// only at presentation and notification boundaries, through this helper.
pub fn format_signed_percent(value: i64) -> String {
    if value > 0 {
        format!("+{value}%")
    } else {
        format!("{value}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_matches_reference_precision() {
        assert_eq!(round1((5.0 + 3.0) / 2.0), 4.0);
        assert_eq!(round1(4.25), 4.3);
        assert_eq!(round2(5.4000000001), 5.4);
        assert_eq!(round2(33.333), 33.33);
    }

    #[test]
    fn positive_deltas_carry_explicit_plus() {
        assert_eq!(format_signed_percent(33), "+33%");
        assert_eq!(format_signed_percent(-33), "-33%");
        assert_eq!(format_signed_percent(0), "0%");
    }
}
