use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckError;

/// Result of the latest status check of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub running: bool,
    pub details: String,
    pub last_checked: DateTime<Utc>,
    pub check_error: Option<CheckError>,
}

impl StatusEntry {
    pub fn checked(running: bool, details: String) -> Self {
        Self {
            running,
            details,
            last_checked: Utc::now(),
            check_error: None,
        }
    }

    pub fn failed(error: CheckError) -> Self {
        Self {
            running: false,
            details: String::new(),
            last_checked: Utc::now(),
            check_error: Some(error),
        }
    }

    /// A failed check is "unknown", never "stopped".
    pub fn state(&self) -> ServiceState {
        match &self.check_error {
            Some(CheckError::TimedOut { .. }) => ServiceState::TimedOut,
            Some(_) => ServiceState::Unknown,
            None if self.running => ServiceState::Running,
            None => ServiceState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    TimedOut,
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::TimedOut => "timed out",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Immutable status table. Each publication replaces the previous snapshot
/// wholesale; `sequence` increases by one per publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub entries: BTreeMap<String, StatusEntry>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            taken_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StatusEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the successor snapshot. Entries not mentioned carry over
    /// unchanged; an update never replaces an entry checked more recently.
    pub fn next(
        &self,
        updates: impl IntoIterator<Item = (String, StatusEntry)>,
        removed: &[String],
    ) -> Self {
        let mut entries = self.entries.clone();
        for id in removed {
            entries.remove(id);
        }
        for (id, entry) in updates {
            match entries.get(&id) {
                Some(existing) if existing.last_checked > entry.last_checked => {}
                _ => {
                    entries.insert(id, entry);
                }
            }
        }
        Self {
            sequence: self.sequence + 1,
            taken_at: Utc::now(),
            entries,
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_failed_check_is_not_stopped() {
        let entry = StatusEntry::failed(CheckError::Failed {
            message: "boom".into(),
        });
        assert_eq!(entry.state(), ServiceState::Unknown);

        let entry = StatusEntry::failed(CheckError::timed_out(std::time::Duration::from_secs(2)));
        assert_eq!(entry.state(), ServiceState::TimedOut);

        assert_eq!(
            StatusEntry::checked(false, String::new()).state(),
            ServiceState::Stopped
        );
    }

    #[test]
    fn test_next_carries_and_orders() {
        let first = StatusSnapshot::empty().next(
            vec![
                ("a".to_string(), StatusEntry::checked(true, "up".into())),
                ("b".to_string(), StatusEntry::checked(false, String::new())),
            ],
            &[],
        );
        assert_eq!(first.sequence, 1);

        let second = first.next(
            vec![("a".to_string(), StatusEntry::checked(false, String::new()))],
            &["b".to_string()],
        );
        assert_eq!(second.sequence, 2);
        assert!(!second.get("a").unwrap().running);
        assert!(second.get("b").is_none());
        // the previous snapshot is untouched
        assert!(first.get("a").unwrap().running);
    }

    #[test]
    fn test_older_result_does_not_overwrite_newer() {
        let fresh = StatusEntry::checked(true, "fresh".into());
        let mut stale = StatusEntry::checked(false, "stale".into());
        stale.last_checked = fresh.last_checked - Duration::seconds(5);

        let snapshot = StatusSnapshot::empty()
            .next(vec![("a".to_string(), fresh)], &[])
            .next(vec![("a".to_string(), stale)], &[]);

        assert_eq!(snapshot.get("a").unwrap().details, "fresh");
        assert_eq!(snapshot.sequence, 2);
    }
}
