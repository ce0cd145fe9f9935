//! The node's public data directory.
//!
//! Files here (rating index, rating records, and whatever else the node publishes) are served to other peers by an
//! external publishing collaborator, which periodically announces the directory's [`PublicData::root_hash`]. Writes go
//! through a store transaction so that a public file never describes state that was rolled back.
use std::path::{Component, Path, PathBuf};

use log::*;
use tokio::fs;

use crate::{db::StoreError, helpers::hashing::blake2b_256};

#[derive(Debug, Clone)]
pub struct PublicData {
    root: PathBuf,
}

impl PublicData {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative path inside the directory, refusing anything that would escape it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let path = Path::new(relative);
        let safe = !relative.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::PublicData(format!("{relative} is not a valid public file path")));
        }
        Ok(self.root.join(path))
    }

    pub async fn read(&self, relative: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve(relative)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to a sibling temp file and renames it into place.
    pub async fn write(&self, relative: &str, contents: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        trace!("🗃️ Wrote public file {relative} ({} bytes)", contents.len());
        Ok(())
    }

    /// blake2b over `relative path || blake2b(contents)` for every file, in sorted path order. An empty or missing
    /// directory hashes the empty string.
    pub async fn root_hash(&self) -> Result<String, StoreError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().map(|e| e != "tmp").unwrap_or(true) {
                    files.push(path);
                }
            }
        }
        files.sort();
        let mut preimage = Vec::new();
        for path in files {
            let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_string_lossy().to_string();
            let contents = fs::read(&path).await?;
            preimage.extend_from_slice(relative.as_bytes());
            preimage.extend_from_slice(&blake2b_256(&contents));
        }
        Ok(hex::encode(blake2b_256(&preimage)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_root() -> PublicData {
        let dir = std::env::temp_dir().join(format!("agora_public_{}", rand::random::<u64>()));
        PublicData::new(dir)
    }

    #[tokio::test]
    async fn read_write_and_hash() {
        let data = temp_root();
        let empty = data.root_hash().await.unwrap();
        assert_eq!(data.read("ratings/index.json").await.unwrap(), None);
        data.write("ratings/index.json", b"{}").await.unwrap();
        assert_eq!(data.read("ratings/index.json").await.unwrap(), Some(b"{}".to_vec()));
        let one = data.root_hash().await.unwrap();
        assert_ne!(one, empty);
        data.write("profile.json", b"{\"name\":\"x\"}").await.unwrap();
        let two = data.root_hash().await.unwrap();
        assert_ne!(two, one);
        assert_eq!(two, data.root_hash().await.unwrap());
        let _ = std::fs::remove_dir_all(data.root());
    }

    #[test]
    fn refuses_escaping_paths() {
        let data = temp_root();
        assert!(data.resolve("../secrets").is_err());
        assert!(data.resolve("/etc/passwd").is_err());
        assert!(data.resolve("").is_err());
        assert!(data.resolve("ratings/a.json").is_ok());
    }
}
