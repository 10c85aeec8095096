use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::types::wire::{WireReader, WireWriter};

/// a commit object pointing to a tree with metadata
///
/// a commit has one or two parents; an empty second parent means
/// single-parent. the graft triple records provenance when the tree was
/// imported from another repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// root tree hash
    pub tree: Hash,
    /// first parent (ZERO for the initial commit)
    pub parent1: Hash,
    /// second parent (ZERO unless this is a merge)
    pub parent2: Hash,
    /// author identity
    pub user: String,
    /// unix timestamp (seconds since epoch)
    pub timestamp: i64,
    /// snapshot name (empty unless this commit is a named snapshot)
    pub snapshot_name: String,
    /// source repository identity of a graft (empty when not grafted)
    pub graft_repo: String,
    /// source path of a graft
    pub graft_path: String,
    /// source commit of a graft
    pub graft_commit: Hash,
    /// commit message
    pub message: String,
}

impl Commit {
    /// create a new commit with explicit timestamp
    pub fn new(
        tree: Hash,
        parent: Hash,
        user: impl Into<String>,
        timestamp: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parent1: parent,
            parent2: Hash::ZERO,
            user: user.into(),
            timestamp,
            snapshot_name: String::new(),
            graft_repo: String::new(),
            graft_path: String::new(),
            graft_commit: Hash::ZERO,
            message: message.into(),
        }
    }

    /// set both parents (merge commit)
    pub fn set_parents(&mut self, p1: Hash, p2: Hash) {
        self.parent1 = p1;
        self.parent2 = p2;
    }

    /// name this commit as a snapshot
    pub fn set_snapshot(&mut self, name: impl Into<String>) {
        self.snapshot_name = name.into();
    }

    /// record graft provenance
    pub fn set_graft(&mut self, repo: impl Into<String>, path: impl Into<String>, commit: Hash) {
        self.graft_repo = repo.into();
        self.graft_path = path.into();
        self.graft_commit = commit;
    }

    /// is this a merge commit (two parents)
    pub fn is_merge(&self) -> bool {
        !self.parent2.is_empty()
    }

    /// is this a graft commit
    pub fn is_graft(&self) -> bool {
        !self.graft_repo.is_empty()
    }

    /// the non-empty parents
    pub fn parents(&self) -> Vec<Hash> {
        let mut out = Vec::new();
        if !self.parent1.is_empty() {
            out.push(self.parent1);
        }
        if !self.parent2.is_empty() {
            out.push(self.parent2);
        }
        out
    }

    /// canonical byte encoding; the commit hash is the digest of these bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.graft_repo.is_empty() && (!self.graft_path.is_empty() || !self.graft_commit.is_empty())
        {
            return Err(Error::InvalidArgument(
                "graft path/commit set without graft repo".to_string(),
            ));
        }
        if !self.graft_repo.is_empty() && (self.graft_path.is_empty() || self.graft_commit.is_empty())
        {
            return Err(Error::InvalidArgument(
                "incomplete graft provenance".to_string(),
            ));
        }

        let mut w = WireWriter::new();
        w.write_hash(&self.tree);
        if self.parent2.is_empty() {
            w.write_u8(1);
            w.write_hash(&self.parent1);
        } else {
            w.write_u8(2);
            w.write_hash(&self.parent1);
            w.write_hash(&self.parent2);
        }
        w.write_pstr(&self.user);
        w.write_i64(self.timestamp);
        w.write_pstr(&self.snapshot_name);
        w.write_pstr(&self.graft_repo);
        w.write_pstr(&self.graft_path);
        w.write_hash(&self.graft_commit);
        w.write_pstr(&self.message);
        Ok(w.into_bytes())
    }

    /// decode from canonical bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);

        let tree = r.read_hash()?;
        let (parent1, parent2) = match r.read_u8()? {
            1 => (r.read_hash()?, Hash::ZERO),
            2 => (r.read_hash()?, r.read_hash()?),
            n => {
                return Err(Error::Malformed(format!("bad parent count: {}", n)));
            }
        };
        let user = r.read_pstr()?;
        let timestamp = r.read_i64()?;
        let snapshot_name = r.read_pstr()?;
        let graft_repo = r.read_pstr()?;
        let graft_path = r.read_pstr()?;
        let graft_commit = r.read_hash()?;
        let message = r.read_pstr()?;
        r.expect_end()?;

        if graft_repo.is_empty() && (!graft_path.is_empty() || !graft_commit.is_empty()) {
            return Err(Error::Malformed(
                "graft path/commit set without graft repo".to_string(),
            ));
        }

        Ok(Self {
            tree,
            parent1,
            parent2,
            user,
            timestamp,
            snapshot_name,
            graft_repo,
            graft_path,
            graft_commit,
            message,
        })
    }

    /// hash of the canonical bytes
    pub fn hash(&self) -> Result<Hash> {
        Ok(Hash::digest(&self.encode()?))
    }
}
