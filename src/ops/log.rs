//! history walk for display

use crate::error::Result;
use crate::hash::Hash;
use crate::repo::Repo;
use crate::types::Commit;

/// commit with its hash for log output
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub hash: Hash,
    pub commit: Commit,
}

/// first-parent history from HEAD, newest first
pub fn log(repo: &Repo) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let mut current = repo.head()?;

    while !current.is_empty() {
        let commit = repo.get_commit(&current)?;
        let parent = commit.parent1;
        entries.push(LogEntry {
            hash: current,
            commit,
        });
        current = parent;
    }

    Ok(entries)
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "commit:  {}", self.hash)?;
        writeln!(f, "parents: {}", self.commit.parent1)?;
        writeln!(f, "user:    {}", self.commit.user)?;
        writeln!(f, "date:    {}", format_timestamp(self.commit.timestamp))?;
        if !self.commit.snapshot_name.is_empty() {
            writeln!(f, "snapshot: {}", self.commit.snapshot_name)?;
        }
        writeln!(f)?;
        for line in self.commit.message.lines() {
            writeln!(f, "    {}", line)?;
        }
        Ok(())
    }
}

/// basic ISO-8601 rendering without a calendar dependency
fn format_timestamp(timestamp: i64) -> String {
    let secs = timestamp.max(0) as u64;
    let (year, month, day) = civil_from_days(secs / 86400);

    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year, month, day, hours, minutes, seconds
    )
}

/// gregorian date from days since the unix epoch
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let mut year = 1970u64;
    let mut remaining = days;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }

    let month_lengths = [
        31,
        if is_leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 1u64;
    for len in month_lengths {
        if remaining < len {
            break;
        }
        remaining -= len;
        month += 1;
    }

    (year, month, remaining + 1)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::commit::commit;
    use std::fs;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_log_empty_repo() {
        let (_dir, repo) = test_repo();
        assert!(log(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_log_single_commit() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();
        let hash = commit(&repo, "first commit", None).unwrap();

        let entries = log(&repo).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hash, hash);
        assert_eq!(entries[0].commit.message, "first commit");
    }

    #[test]
    fn test_log_newest_first() {
        let (_dir, repo) = test_repo();
        for i in 0..3 {
            fs::write(repo.root().join("f"), format!("v{}", i)).unwrap();
            commit(&repo, &format!("commit {}", i), None).unwrap();
        }

        let entries = log(&repo).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].commit.message, "commit 2");
        assert_eq!(entries[2].commit.message, "commit 0");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        // last day of the year
        assert_eq!(format_timestamp(364 * 86400), "1970-12-31 00:00:00");
        // leap day
        assert_eq!(format_timestamp(1582977600), "2020-02-29 12:00:00");
        assert_eq!(format_timestamp(1700000000), "2023-11-14 22:13:20");
        // negative timestamps clamp to the epoch
        assert_eq!(format_timestamp(-5), "1970-01-01 00:00:00");
    }

    #[test]
    fn test_log_entry_display() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();
        commit(&repo, "display me", Some("snap-name")).unwrap();

        let entries = log(&repo).unwrap();
        let text = format!("{}", entries[0]);

        assert!(text.contains("commit:"));
        assert!(text.contains("snapshot: snap-name"));
        assert!(text.contains("    display me"));
    }
}
