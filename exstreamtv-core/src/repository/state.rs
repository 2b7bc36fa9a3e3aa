//! File-backed state store.
//!
//! The streaming core reads channel and schedule records and writes playout
//! anchors. Documents are JSON files under a configurable state directory;
//! writes go through a temp file + rename so a crash never leaves a torn
//! document behind.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// JSON document store rooted at `state_dir`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read and deserialize a document. `Ok(None)` when the file is absent.
    pub fn read<T: DeserializeOwned>(&self, rel_path: &str) -> Result<Option<T>> {
        let path = self.root.join(rel_path);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::StateStore(e)),
        };
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }

    /// Serialize and write a document atomically (temp file + rename).
    pub fn write<T: Serialize>(&self, rel_path: &str, value: &T) -> Result<()> {
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Append one JSON line to a log file (best-effort audit trail).
    pub fn append_line<T: Serialize>(&self, rel_path: &str, value: &T) -> Result<()> {
        use std::io::Write;
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let doc: Option<Doc> = store.read("missing.json").unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let doc = Doc { name: "anchor".into(), count: 3 };
        store.write("nested/doc.json", &doc).unwrap();
        let back: Option<Doc> = store.read("nested/doc.json").unwrap();
        assert_eq!(back, Some(doc));
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        store.write("doc.json", &Doc { name: "x".into(), count: 1 }).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["doc.json"]);
    }

    #[test]
    fn append_line_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        store.append_line("audit.log", &Doc { name: "a".into(), count: 1 }).unwrap();
        store.append_line("audit.log", &Doc { name: "b".into(), count: 2 }).unwrap();
        let content = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
