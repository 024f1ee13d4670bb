use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Source of transaction code keyed by template file name.
pub trait TemplateStore: Send + Sync {
    fn load_template(&self, file_name: &str) -> Result<String>;
}

/// Reads templates from a directory of `.cdc` files.
#[derive(Debug, Clone)]
pub struct DirTemplateStore {
    root: PathBuf,
}

impl DirTemplateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemplateStore for DirTemplateStore {
    fn load_template(&self, file_name: &str) -> Result<String> {
        // Template names are plain file names; anything else could escape the root.
        if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
            return Err(anyhow!("invalid template name: {}", file_name));
        }
        let path = self.root.join(file_name);
        std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("transaction template not found: {} ({})", file_name, e))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTemplateStore {
    templates: HashMap<String, String>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_name: &str, code: &str) -> Self {
        self.insert(file_name, code);
        self
    }

    pub fn insert(&mut self, file_name: &str, code: &str) {
        self.templates.insert(file_name.to_string(), code.to_string());
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn load_template(&self, file_name: &str) -> Result<String> {
        self.templates
            .get(file_name)
            .cloned()
            .ok_or_else(|| anyhow!("transaction template not found: {}", file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_store_reads_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deposit.cdc"), "transaction {}").unwrap();
        let store = DirTemplateStore::new(dir.path());
        assert_eq!(store.load_template("deposit.cdc").unwrap(), "transaction {}");

        let err = store.load_template("withdraw.cdc").unwrap_err();
        assert!(err.to_string().contains("withdraw.cdc"));
        assert!(store.load_template("../deposit.cdc").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTemplateStore::new().with("rebalance.cdc", "transaction {}");
        assert!(store.load_template("rebalance.cdc").is_ok());
        assert!(store.load_template("deposit.cdc").is_err());
    }
}
