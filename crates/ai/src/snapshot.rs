use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use adsight_core::AccountId;

/// Point-in-time campaign data pulled from a connected ad account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub platform: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub campaigns: Vec<CampaignSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub campaign_id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub spend: Option<f64>,
    #[serde(default)]
    pub impressions: Option<u64>,
    #[serde(default)]
    pub clicks: Option<u64>,
    #[serde(default)]
    pub conversions: Option<u64>,
    #[serde(default)]
    pub ctr: Option<f64>,
    #[serde(default)]
    pub cpc: Option<f64>,
    #[serde(default)]
    pub cpm: Option<f64>,
}

impl AccountSnapshot {
    pub fn total_spend(&self) -> f64 {
        self.campaigns.iter().filter_map(|c| c.spend).sum()
    }

    pub fn total_impressions(&self) -> u64 {
        self.campaigns.iter().filter_map(|c| c.impressions).sum()
    }

    pub fn total_clicks(&self) -> u64 {
        self.campaigns.iter().filter_map(|c| c.clicks).sum()
    }
}
