//! Campaign catalog records.
//!
//! A campaign is a named batch of generated dispatch jobs. Job generation
//! itself happens outside the engine; only the metadata is tracked here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::CampaignId;

/// Lifecycle status of a campaign as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Metadata for one registered campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub campaign_id: CampaignId,
    pub created_at: DateTime<Utc>,
    pub status: CampaignStatus,
    /// Number of message templates in the campaign.
    pub total_messages: usize,
    /// Number of contacts the campaign fans out to.
    pub total_contacts: usize,
}

impl CampaignRecord {
    pub fn new(campaign_id: CampaignId, total_messages: usize, total_contacts: usize) -> Self {
        Self {
            campaign_id,
            created_at: Utc::now(),
            status: CampaignStatus::Pending,
            total_messages,
            total_contacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_starts_pending() {
        let record = CampaignRecord::new(CampaignId::from("c1"), 3, 25);
        assert_eq!(record.status, CampaignStatus::Pending);
        assert_eq!(record.total_messages, 3);
        assert_eq!(record.total_contacts, 25);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&CampaignStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
