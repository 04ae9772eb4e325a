//! Dispatch jobs and queued items.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CampaignId, ItemId};

/// One fully-formed outbound request targeting the messaging gateway.
///
/// Produced by the (external) job generator. The engine treats the payload
/// as opaque: it is handed to the dispatcher untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl DispatchJob {
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Execution status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting in the queue.
    Pending,
    /// Currently being dispatched.
    Executing,
    /// Dispatched successfully.
    Completed,
    /// Dispatch failed; the error is recorded on the item. Never retried.
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// A dispatch job queued on a session, with its outcome once executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: ItemId,
    pub job: DispatchJob,
    pub campaign_id: CampaignId,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl QueuedItem {
    /// Create a new pending item.
    pub fn new(job: DispatchJob, campaign_id: CampaignId) -> Self {
        Self {
            id: ItemId::new(),
            job,
            campaign_id,
            status: ItemStatus::Pending,
            error: None,
            executed_at: None,
            result: None,
        }
    }

    /// Mark the item as executing.
    ///
    /// Transitions are one-directional; a terminal item is left untouched.
    pub fn mark_executing(&mut self) {
        if self.status == ItemStatus::Pending {
            self.status = ItemStatus::Executing;
        }
    }

    /// Mark the item as completed, recording the gateway's response.
    pub fn mark_completed(&mut self, result: Option<serde_json::Value>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::Completed;
        self.executed_at = Some(Utc::now());
        self.result = result;
    }

    /// Mark the item as failed, recording the error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::Failed;
        self.executed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item() -> QueuedItem {
        QueuedItem::new(
            DispatchJob::new("POST", "http://gateway/send", serde_json::json!({"chatId": "x"})),
            CampaignId::from("camp-1"),
        )
    }

    #[test]
    fn item_lifecycle_success() {
        let mut item = test_item();
        assert_eq!(item.status, ItemStatus::Pending);

        item.mark_executing();
        assert_eq!(item.status, ItemStatus::Executing);

        item.mark_completed(Some(serde_json::json!({"ok": true})));
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.executed_at.is_some());
        assert!(item.error.is_none());
    }

    #[test]
    fn item_lifecycle_failure() {
        let mut item = test_item();
        item.mark_executing();
        item.mark_failed("gateway timeout");

        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("gateway timeout"));
        assert!(item.executed_at.is_some());
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut item = test_item();
        item.mark_executing();
        item.mark_completed(None);

        // Late failure callbacks must not move a terminal item backwards.
        item.mark_failed("late error");
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.error.is_none());
    }

    #[test]
    fn item_round_trips_through_json() {
        let mut item = test_item();
        item.mark_executing();
        item.mark_failed("boom");

        let json = serde_json::to_string(&item).unwrap();
        let back: QueuedItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }
}
