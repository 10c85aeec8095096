//! read-contract adapter over an on-disk repository

use crate::error::Result;
use crate::hash::Hash;
use crate::object::ObjectType;
use crate::repo::Repo;
use crate::transport::RemoteSource;

/// a pull source backed by a local repository
pub struct LocalSource {
    repo: Repo,
}

impl LocalSource {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }
}

impl RemoteSource for LocalSource {
    fn head(&mut self) -> Result<Hash> {
        self.repo.head()
    }

    fn list_heads(&mut self) -> Result<Vec<Hash>> {
        let mut heads = Vec::new();
        let head = self.repo.head()?;
        if !head.is_empty() {
            heads.push(head);
        }
        heads.extend(self.repo.find_lost_heads()?);
        Ok(heads)
    }

    fn has_object(&mut self, hash: &Hash) -> Result<bool> {
        Ok(self.repo.store().contains(hash))
    }

    fn object_type(&mut self, hash: &Hash) -> Result<ObjectType> {
        self.repo.store().type_of(hash)
    }

    fn get_object(&mut self, hash: &Hash) -> Result<Vec<u8>> {
        self.repo.store().get_bytes(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_source_contract() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        let blob = repo.add_blob(b"served bytes").unwrap();

        let mut src = LocalSource::new(repo);
        assert!(src.head().unwrap().is_empty());
        assert!(src.has_object(&blob).unwrap());
        assert!(!src.has_object(&Hash::digest(b"missing")).unwrap());
        assert_eq!(src.object_type(&blob).unwrap(), ObjectType::Blob);
        assert_eq!(src.get_object(&blob).unwrap(), b"served bytes");
    }
}
