use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// fsync discipline for journal records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JournalMode {
    /// no journal at all
    None,
    /// buffered appends, synced by the OS at its leisure
    #[default]
    Async,
    /// fdatasync after every record
    Sync,
}

impl JournalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(JournalMode::None),
            "async" => Some(JournalMode::Async),
            "sync" => Some(JournalMode::Sync),
            _ => None,
        }
    }
}

/// append-only operation journal, truncated on every commit
pub struct Journal {
    path: PathBuf,
    mode: JournalMode,
    file: Option<File>,
}

impl Journal {
    pub fn open(path: &Path, mode: JournalMode) -> Result<Self> {
        let file = if mode == JournalMode::None {
            None
        } else {
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_path(path)?,
            )
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            file,
        })
    }

    /// append one record
    pub fn record(&mut self, op: &str, arg: &str) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        writeln!(file, "{} {}", op, arg).with_path(&self.path)?;
        if self.mode == JournalMode::Sync {
            file.sync_data().with_path(&self.path)?;
        }
        Ok(())
    }

    /// drop all records after a successful commit
    pub fn truncate(&mut self) -> Result<()> {
        if self.mode == JournalMode::None {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_path(&self.path)?;
        file.sync_all().with_path(&self.path)?;
        self.file = Some(
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .with_path(&self.path)?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_journal_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = Journal::open(&path, JournalMode::Sync).unwrap();
        journal.record("create", "/a.txt").unwrap();
        journal.record("rename", "/a.txt:/b.txt").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "create /a.txt\nrename /a.txt:/b.txt\n");
    }

    #[test]
    fn test_journal_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = Journal::open(&path, JournalMode::Async).unwrap();
        journal.record("unlink", "/x").unwrap();
        journal.truncate().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        // still usable after truncation
        journal.record("create", "/y").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "create /y\n");
    }

    #[test]
    fn test_journal_mode_none_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = Journal::open(&path, JournalMode::None).unwrap();
        journal.record("create", "/a").unwrap();
        journal.truncate().unwrap();

        assert!(!path.exists());
    }

    #[test]
    fn test_journal_mode_parse() {
        assert_eq!(JournalMode::parse("none"), Some(JournalMode::None));
        assert_eq!(JournalMode::parse("async"), Some(JournalMode::Async));
        assert_eq!(JournalMode::parse("sync"), Some(JournalMode::Sync));
        assert_eq!(JournalMode::parse("bogus"), None);
    }
}
