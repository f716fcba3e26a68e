/// Job status reported back to the remote queue once a document has printed.
pub const PRINTED: &str = "printed";

// =============================================================================
// Spooler status normalization
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical job status derived from the free-text status the host spooler
/// reports (e.g. "Printing, Retained", "Paused", "Normal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Printing,
    Paused,
    Retained,
    Deleting,
    /// Spooler "Normal": queued, not yet printing.
    Waiting,
    Unknown,
}

impl CanonicalStatus {
    /// Map raw spooler text to a canonical status.
    ///
    /// Matching is case-insensitive and substring based. The spooler joins
    /// several flags into one string, so the first rule that matches wins:
    ///   deleting > paused > printing|spooling|processing > retained > normal
    /// Empty or unmatched text is `Unknown`.
    pub fn normalize(raw: &str) -> Self {
        let text = raw.trim().to_lowercase();
        if text.is_empty() {
            CanonicalStatus::Unknown
        } else if text.contains("deleting") {
            CanonicalStatus::Deleting
        } else if text.contains("paused") {
            CanonicalStatus::Paused
        } else if text.contains("printing")
            || text.contains("spooling")
            || text.contains("processing")
        {
            CanonicalStatus::Printing
        } else if text.contains("retained") {
            CanonicalStatus::Retained
        } else if text.contains("normal") {
            CanonicalStatus::Waiting
        } else {
            CanonicalStatus::Unknown
        }
    }

    /// Whether a job that vanished from the spooler while in this status
    /// should be counted as deleted rather than printed.
    pub fn deleted_on_disappear(self) -> bool {
        matches!(
            self,
            CanonicalStatus::Deleting | CanonicalStatus::Paused | CanonicalStatus::Waiting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Printing => "Printing",
            CanonicalStatus::Paused => "Paused",
            CanonicalStatus::Retained => "Retained",
            CanonicalStatus::Deleting => "Deleting",
            CanonicalStatus::Waiting => "Waiting",
            CanonicalStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Printed,
    Deleted,
}

impl JobOutcome {
    /// Disappearance heuristic: decide the outcome of a job that is no longer
    /// in the spooler from the last status it was seen with. A job that was
    /// never observed counts as printed.
    pub fn on_disappear(last_known: Option<CanonicalStatus>) -> Self {
        match last_known {
            Some(status) if status.deleted_on_disappear() => JobOutcome::Deleted,
            _ => JobOutcome::Printed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Printed => "printed",
            JobOutcome::Deleted => "deleted",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flags() {
        assert_eq!(CanonicalStatus::normalize("Printing"), CanonicalStatus::Printing);
        assert_eq!(CanonicalStatus::normalize("Spooling"), CanonicalStatus::Printing);
        assert_eq!(CanonicalStatus::normalize("Processing"), CanonicalStatus::Printing);
        assert_eq!(CanonicalStatus::normalize("Paused"), CanonicalStatus::Paused);
        assert_eq!(CanonicalStatus::normalize("Retained"), CanonicalStatus::Retained);
        assert_eq!(CanonicalStatus::normalize("Normal"), CanonicalStatus::Waiting);
        assert_eq!(CanonicalStatus::normalize("Deleting"), CanonicalStatus::Deleting);
    }

    #[test]
    fn test_empty_and_unmatched_are_unknown() {
        assert_eq!(CanonicalStatus::normalize(""), CanonicalStatus::Unknown);
        assert_eq!(CanonicalStatus::normalize("   "), CanonicalStatus::Unknown);
        assert_eq!(CanonicalStatus::normalize("Offline"), CanonicalStatus::Unknown);
    }

    #[test]
    fn test_deleting_wins_in_any_combination() {
        let others = ["Paused", "Printing", "Spooling", "Retained", "Normal", "Error"];
        for other in others {
            for raw in [
                format!("Deleting, {}", other),
                format!("{}, deleting", other),
                format!("{}, DELETING, Retained", other.to_uppercase()),
                format!("{}|dElEtInG", other.to_lowercase()),
            ] {
                assert_eq!(
                    CanonicalStatus::normalize(&raw),
                    CanonicalStatus::Deleting,
                    "raw status {:?}",
                    raw
                );
            }
        }
    }

    #[test]
    fn test_pause_is_not_masked_by_retained() {
        assert_eq!(
            CanonicalStatus::normalize("Paused, Printing, Retained"),
            CanonicalStatus::Paused
        );
        assert_eq!(
            CanonicalStatus::normalize("Printing, Retained"),
            CanonicalStatus::Printing
        );
        assert_eq!(
            CanonicalStatus::normalize("Retained, Normal"),
            CanonicalStatus::Retained
        );
    }

    #[test]
    fn test_disappearance_heuristic() {
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Waiting)), JobOutcome::Deleted);
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Paused)), JobOutcome::Deleted);
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Deleting)), JobOutcome::Deleted);
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Printing)), JobOutcome::Printed);
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Retained)), JobOutcome::Printed);
        assert_eq!(JobOutcome::on_disappear(Some(CanonicalStatus::Unknown)), JobOutcome::Printed);
        assert_eq!(JobOutcome::on_disappear(None), JobOutcome::Printed);
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_string(&JobOutcome::Printed).unwrap(), "\"printed\"");
        assert_eq!(serde_json::to_string(&CanonicalStatus::Waiting).unwrap(), "\"waiting\"");
    }
}
