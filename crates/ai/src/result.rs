use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Structured output of the analysis capability.
///
/// Every section is optional on the wire (missing sections deserialize to
/// their empty form) so a partially filled answer is still usable. The
/// aliases accept the field names older analyzers emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResults {
    #[serde(default, alias = "performance_report")]
    pub performance_summary: PerformanceSummary,

    #[serde(default, alias = "ai_insights")]
    pub insights: Vec<String>,

    #[serde(default, alias = "next_ad_plan")]
    pub recommended_plan: AdPlan,

    #[serde(default, alias = "content_strategy")]
    pub content_plan: ContentPlan,

    #[serde(default)]
    pub creative_prompts: Vec<String>,

    #[serde(default, alias = "captions_hashtags")]
    pub captions: Vec<CaptionWithHashtags>,

    #[serde(default, alias = "similar_businesses", skip_serializing_if = "Option::is_none")]
    pub similar_entities: Option<Vec<SimilarEntity>>,

    /// Short description of the business the data appears to come from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub key_metrics: BTreeMap<String, f64>,
}

/// Recommendations for the next campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdPlan {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Week-by-week content calendar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPlan {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub weeks: Vec<ContentWeek>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentWeek {
    pub week: u32,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub posts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionWithHashtags {
    pub caption: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEntity {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// What a notification carries about a finished job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub headline_insights: Vec<String>,
    pub plan_summary: Option<String>,
    pub insight_count: usize,
}

impl ResultsSummary {
    /// Insights carried in a notification.
    pub const MAX_INSIGHTS: usize = 5;
}

impl AnalysisResults {
    pub fn summary(&self) -> ResultsSummary {
        ResultsSummary {
            headline_insights: self
                .insights
                .iter()
                .take(ResultsSummary::MAX_INSIGHTS)
                .cloned()
                .collect(),
            plan_summary: self.recommended_plan.summary.clone(),
            insight_count: self.insights.len(),
        }
    }
}
