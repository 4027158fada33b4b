//! Local persistence
//!
//! The engine saves descriptor edits through [`DescriptorStore`] and never
//! touches storage directly. Drafts (locally entered values) are kept in a
//! separate TOML file used by the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::descriptor::{LocalValueCache, SecretDescriptor};

/// Persistence port for the descriptor list
#[async_trait::async_trait]
pub trait DescriptorStore: Send + Sync {
    async fn load_descriptors(&self) -> Result<Vec<SecretDescriptor>>;

    async fn save_descriptors(&self, descriptors: &[SecretDescriptor]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    secrets: Vec<SecretDescriptor>,
}

/// Descriptors stored as `[[secrets]]` tables in a TOML file
pub struct FileDescriptorStore {
    path: PathBuf,
}

impl FileDescriptorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DescriptorStore for FileDescriptorStore {
    async fn load_descriptors(&self) -> Result<Vec<SecretDescriptor>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!("No descriptor file at {:?}", self.path);
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read descriptor file: {:?}", self.path))?;
        let file: DescriptorFile =
            toml::from_str(&contents).context("Failed to parse descriptor file")?;
        Ok(file
            .secrets
            .into_iter()
            .map(SecretDescriptor::normalized)
            .collect())
    }

    async fn save_descriptors(&self, descriptors: &[SecretDescriptor]) -> Result<()> {
        let file = DescriptorFile {
            secrets: descriptors.to_vec(),
        };
        let contents =
            toml::to_string_pretty(&file).context("Failed to serialize descriptors")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write descriptor file: {:?}", self.path))?;
        info!("Saved {} descriptor(s) to {:?}", descriptors.len(), self.path);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DraftFile {
    #[serde(default)]
    values: LocalValueCache,
}

/// Load locally entered values; a missing file is an empty cache
pub fn load_drafts<P: AsRef<Path>>(path: P) -> Result<LocalValueCache> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(LocalValueCache::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read drafts file: {:?}", path))?;
    let file: DraftFile = toml::from_str(&contents).context("Failed to parse drafts file")?;
    Ok(file.values)
}

/// Save locally entered values, readable by the owner only on Unix
pub fn save_drafts<P: AsRef<Path>>(path: P, values: &LocalValueCache) -> Result<()> {
    let path = path.as_ref();
    let file = DraftFile {
        values: values.clone(),
    };
    let contents = toml::to_string_pretty(&file).context("Failed to serialize drafts")?;
    fs::write(path, contents).with_context(|| format!("Failed to write drafts file: {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_descriptor_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileDescriptorStore::new(dir.path().join("secrets.toml"));
        assert!(store.load_descriptors().await.unwrap().is_empty());

        let descriptors = vec![
            SecretDescriptor::new("DB_PASS", "kv/acme/dev/0/app", "db_pass"),
            SecretDescriptor::new("DRAFT", "", ""),
        ];
        store.save_descriptors(&descriptors).await.unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("[[secrets]]"));
        assert!(contents.contains("path = \"kv/acme/dev/0/app\""));
        assert_eq!(store.load_descriptors().await.unwrap(), descriptors);
    }

    #[tokio::test]
    async fn test_load_normalizes_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.toml");
        std::fs::write(
            &path,
            "[[secrets]]\nname = \"db_pass\"\npath = \"KV/Acme/App\"\nkey = \"DB_PASS\"\n",
        )
        .unwrap();

        let loaded = FileDescriptorStore::new(&path).load_descriptors().await.unwrap();
        assert_eq!(loaded, vec![SecretDescriptor::new("DB_PASS", "kv/acme/app", "db_pass")]);
    }

    #[test]
    fn test_drafts_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let drafts = load_drafts(dir.path().join("none.toml")).unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn test_drafts_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drafts.toml");
        let mut values = LocalValueCache::new();
        values.insert("DB_PASS", "abc");
        save_drafts(&path, &values).unwrap();

        assert_eq!(load_drafts(&path).unwrap(), values);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
