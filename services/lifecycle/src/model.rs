use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Attribute names as they are persisted on a [`PhotoRecord`]
pub mod attr {
    pub const ID: &str = "id";
    pub const NAME: &str = "Name";
    pub const CAPTION: &str = "Caption";
    pub const DATE: &str = "Date";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
    pub const STATUS_UPDATED_AT: &str = "statusUpdatedAt";
}

/// Non-key attributes of a record, ordered for stable images and comparisons
pub type Attributes = BTreeMap<String, String>;

/// Review outcome written by the status updater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pass,
    Reject,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pass => "Pass",
            ReviewStatus::Reject => "Reject",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = PipelineError;

    /// Exact, case-sensitive match
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pass" => Ok(ReviewStatus::Pass),
            "Reject" => Ok(ReviewStatus::Reject),
            other => Err(PipelineError::InvalidEnumValue(other.to_string())),
        }
    }
}

/// Persisted state of one photo, keyed by the object's storage key.
///
/// Serializes flat: `{ "id": "...", "Name": "...", "status": "Pass", ... }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl PhotoRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(id: impl Into<String>, attributes: Attributes) -> Self {
        let mut record = Self::new(id);
        record.merge(attributes);
        record
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        if name == attr::ID {
            return Some(&self.id);
        }
        self.attributes.get(name).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(attr::NAME)
    }

    pub fn caption(&self) -> Option<&str> {
        self.get(attr::CAPTION)
    }

    pub fn date(&self) -> Option<&str> {
        self.get(attr::DATE)
    }

    /// Raw status attribute, as stored
    pub fn status_value(&self) -> Option<&str> {
        self.get(attr::STATUS)
    }

    /// Parsed status, `None` when absent or not a known value
    pub fn status(&self) -> Option<ReviewStatus> {
        self.status_value().and_then(|s| s.parse().ok())
    }

    pub fn reason(&self) -> Option<&str> {
        self.get(attr::REASON)
    }

    pub fn status_updated_at(&self) -> Option<&str> {
        self.get(attr::STATUS_UPDATED_AT)
    }

    /// Partial-attribute merge. The key attribute is immutable and ignored.
    ///
    /// Returns whether any attribute actually changed.
    pub fn merge(&mut self, partial: Attributes) -> bool {
        let mut changed = false;
        for (name, value) in partial {
            if name == attr::ID {
                continue;
            }
            if self.attributes.get(&name) != Some(&value) {
                self.attributes.insert(name, value);
                changed = true;
            }
        }
        changed
    }
}
