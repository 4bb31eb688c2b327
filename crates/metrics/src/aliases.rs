//! Canonical metric names and the column aliases that resolve to them.
//!
//! Matching is exact and case-sensitive. Alias lists are ordered by priority:
//! when a table carries several aliases of the same metric, the first one in
//! the list wins.

use serde::{Deserialize, Serialize};

/// A numeric metric the normalizer aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalMetric {
    Impressions,
    Clicks,
    Spend,
    Conversions,
    Ctr,
    Cpc,
}

impl CanonicalMetric {
    /// All metrics in discovery order.
    pub const ALL: [CanonicalMetric; 6] = [
        CanonicalMetric::Impressions,
        CanonicalMetric::Clicks,
        CanonicalMetric::Spend,
        CanonicalMetric::Conversions,
        CanonicalMetric::Ctr,
        CanonicalMetric::Cpc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalMetric::Impressions => "impressions",
            CanonicalMetric::Clicks => "clicks",
            CanonicalMetric::Spend => "spend",
            CanonicalMetric::Conversions => "conversions",
            CanonicalMetric::Ctr => "ctr",
            CanonicalMetric::Cpc => "cpc",
        }
    }

    /// Column names accepted for this metric, highest priority first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            CanonicalMetric::Impressions => &["impressions", "Impressions", "Reach"],
            CanonicalMetric::Clicks => &["clicks", "Clicks", "Link Clicks"],
            CanonicalMetric::Spend => &["spend", "Spend", "Amount Spent", "amount_spent"],
            CanonicalMetric::Conversions => &["conversions", "Conversions", "Results"],
            CanonicalMetric::Ctr => &["ctr", "CTR", "Link Click-Through Rate"],
            CanonicalMetric::Cpc => &["cpc", "CPC", "Cost per Link Click"],
        }
    }
}

impl core::fmt::Display for CanonicalMetric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns holding the reporting date.
pub const DATE_ALIASES: &[&str] = &["date", "Date", "Reporting Starts", "reporting_starts"];

/// Columns naming the ranked entity (ad or campaign).
pub const LABEL_ALIASES: &[&str] = &["ad_name", "Ad Name", "Ad name", "Campaign Name", "campaign_name"];

/// Numeric columns the ranking pass may sort by, highest priority first.
pub const RANKING_COLUMNS: &[&str] = &["impressions", "Impressions", "spend", "Spend", "clicks", "Clicks"];

/// Return the first candidate present in `columns`.
pub fn first_present<'a>(candidates: &[&'a str], columns: &[String]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .find(|candidate| columns.iter().any(|c| c == candidate))
}
