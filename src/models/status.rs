use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Where a job currently sits inside its queue. A stall is not a resting
/// state: a reclaimed job goes straight back to `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of a single dispatch through the send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    Received,
    Validated,
    PolicyChecked,
    Composed,
    Delivered,
    Rejected,
    DeliveryFailed,
    PermanentlyFailed,
}

impl Display for DispatchStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            DispatchStage::Received => write!(f, "received"),
            DispatchStage::Validated => write!(f, "validated"),
            DispatchStage::PolicyChecked => write!(f, "policy_checked"),
            DispatchStage::Composed => write!(f, "composed"),
            DispatchStage::Delivered => write!(f, "delivered"),
            DispatchStage::Rejected => write!(f, "rejected"),
            DispatchStage::DeliveryFailed => write!(f, "delivery_failed"),
            DispatchStage::PermanentlyFailed => write!(f, "permanently_failed"),
        }
    }
}
