//! Core domain model for the deal archive pipeline: record identity, the
//! archive status state machine, archive outcomes and operator notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dap-core";

pub const ARCHIVED_SUBJECT: &str = "Deal Archived Successfully";
pub const ARCHIVE_ERROR_SUBJECT: &str = "Deal Archive Error";

/// Opaque identifier of a record owned by the external record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Semantic lifecycle states of a record as seen by the pipeline.
///
/// Any stored value that does not map onto one of these is "other" and never
/// eligible for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Pending,
    Archiving,
    Archived,
    Errored,
}

impl ArchiveStatus {
    pub const ALL: [ArchiveStatus; 4] = [
        ArchiveStatus::Pending,
        ArchiveStatus::Archiving,
        ArchiveStatus::Archived,
        ArchiveStatus::Errored,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, ArchiveStatus::Archived | ArchiveStatus::Errored)
    }

    /// Whether the pipeline itself ever moves a record from `self` to `next`.
    /// Resetting a terminal record back to `Pending` is an operator action and
    /// is not a pipeline transition.
    pub fn can_transition_to(self, next: ArchiveStatus) -> bool {
        matches!(
            (self, next),
            (ArchiveStatus::Pending, ArchiveStatus::Archiving)
                | (ArchiveStatus::Archiving, ArchiveStatus::Archived)
                | (ArchiveStatus::Archiving, ArchiveStatus::Errored)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ArchiveStatus::Pending => "pending",
            ArchiveStatus::Archiving => "archiving",
            ArchiveStatus::Archived => "archived",
            ArchiveStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusValuesError {
    #[error("status value for {0} is empty")]
    Empty(ArchiveStatus),
    #[error("status value {value:?} is used for both {first} and {second}")]
    Duplicate {
        value: String,
        first: ArchiveStatus,
        second: ArchiveStatus,
    },
}

/// The concrete strings the record store uses for each semantic status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusValues {
    pub pending: String,
    pub archiving: String,
    pub archived: String,
    pub errored: String,
}

impl Default for StatusValues {
    fn default() -> Self {
        Self {
            pending: "pending".to_string(),
            archiving: "archiving".to_string(),
            archived: "archived".to_string(),
            errored: "error".to_string(),
        }
    }
}

impl StatusValues {
    pub fn value_of(&self, status: ArchiveStatus) -> &str {
        match status {
            ArchiveStatus::Pending => &self.pending,
            ArchiveStatus::Archiving => &self.archiving,
            ArchiveStatus::Archived => &self.archived,
            ArchiveStatus::Errored => &self.errored,
        }
    }

    pub fn classify(&self, raw: &str) -> Option<ArchiveStatus> {
        ArchiveStatus::ALL
            .into_iter()
            .find(|status| self.value_of(*status) == raw)
    }

    /// Every status needs a distinct, non-blank string; otherwise a stored
    /// value would classify as the wrong status.
    pub fn validate(&self) -> Result<(), StatusValuesError> {
        for status in ArchiveStatus::ALL {
            let value = self.value_of(status);
            if value.trim().is_empty() {
                return Err(StatusValuesError::Empty(status));
            }
            match self.classify(value) {
                Some(first) if first != status => {
                    return Err(StatusValuesError::Duplicate {
                        value: value.to_string(),
                        first,
                        second: status,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Result of one archive attempt, consumed once by the record processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub success: bool,
    pub detail: String,
    pub file: String,
}

impl ArchiveOutcome {
    pub fn archived(file: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: String::new(),
            file: file.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            file: String::new(),
        }
    }
}

/// Human-readable operator message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn archived(id: &RecordId, file: &str) -> Self {
        Self {
            subject: ARCHIVED_SUBJECT.to_string(),
            body: format!("Deal ID: {id}\nArchive File: {file}"),
        }
    }

    pub fn failed(id: &RecordId, detail: &str) -> Self {
        Self {
            subject: ARCHIVE_ERROR_SUBJECT.to_string(),
            body: format!("Deal ID: {id}\nError: {detail}"),
        }
    }
}
