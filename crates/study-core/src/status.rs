use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a study request.
///
/// Variant order is the log-merge precedence order, not an outcome ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StudyStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl StudyStatus {
    pub const ALL: [StudyStatus; 4] = [
        StudyStatus::Queued,
        StudyStatus::Running,
        StudyStatus::Finished,
        StudyStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StudyStatus::Queued => "QUEUED",
            StudyStatus::Running => "RUNNING",
            StudyStatus::Finished => "FINISHED",
            StudyStatus::Failed => "FAILED",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            StudyStatus::Queued => 0,
            StudyStatus::Running => 1,
            StudyStatus::Finished => 2,
            StudyStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StudyStatus::Finished | StudyStatus::Failed)
    }

    /// Statuses that count as "already run" for duplicate detection.
    pub fn counts_as_run(&self) -> bool {
        matches!(self, StudyStatus::Running | StudyStatus::Finished)
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown study status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for StudyStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(StudyStatus::Queued),
            "RUNNING" => Ok(StudyStatus::Running),
            "FINISHED" => Ok(StudyStatus::Finished),
            "FAILED" => Ok(StudyStatus::Failed),
            _ => Err(UnknownStatus(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_follows_listed_sequence() {
        let mut shuffled = vec![
            StudyStatus::Failed,
            StudyStatus::Queued,
            StudyStatus::Finished,
            StudyStatus::Running,
        ];
        shuffled.sort();
        assert_eq!(shuffled, StudyStatus::ALL.to_vec());
        for pair in StudyStatus::ALL.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn parses_case_insensitively_and_rejects_unknown() {
        assert_eq!("finished".parse::<StudyStatus>(), Ok(StudyStatus::Finished));
        assert_eq!(" RUNNING ".parse::<StudyStatus>(), Ok(StudyStatus::Running));
        assert!("DONE".parse::<StudyStatus>().is_err());
    }

    #[test]
    fn serializes_uppercase() {
        let yaml = serde_yaml::to_string(&StudyStatus::Queued).expect("yaml");
        assert_eq!(yaml.trim(), "QUEUED");
        let parsed: StudyStatus = serde_yaml::from_str("FAILED").expect("parse");
        assert_eq!(parsed, StudyStatus::Failed);
    }
}
