//! Filesystem-backed configuration tree

use crate::domain::ports::ConfigTree;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Manifest tree rooted at a directory (e.g. `/etc/storage-operator/operatorconfig`)
#[derive(Debug, Clone)]
pub struct DirConfigTree {
    root: PathBuf,
}

impl DirConfigTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ConfigTree for DirConfigTree {
    fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        trace!(path = %path.display(), "Reading config file");
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ConfigNotFound {
                path: relative.to_string(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn exists(&self, relative: &str) -> bool {
        self.root.join(relative).is_file()
    }

    fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let full = self.root.join(pattern);
        let full = full
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("non UTF-8 path: {}", full.display())))?;

        let entries = glob::glob(full)
            .map_err(|e| Error::Configuration(format!("invalid pattern {}: {}", pattern, e)))?;

        let mut found = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::Io(e.into_error()))?;
            if let Ok(rel) = path.strip_prefix(&self.root) {
                found.push(rel.to_string_lossy().into_owned());
            }
        }
        found.sort();
        Ok(found)
    }
}
