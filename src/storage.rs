//! External artifact store
//!
//! The orchestrator only assumes "write a named object". The default
//! implementation targets a local directory; artifacts are staged in a temp
//! file and persisted atomically so a crashed dump never leaves a
//! half-written object under its final name.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{QuarryError, Result};

#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Create (or replace) a named artifact with the given bytes
    async fn write_object(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// Directory-backed store
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    async fn write_object(&self, name: &str, data: &[u8]) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(QuarryError::Storage(format!(
                "invalid artifact name {:?}",
                name
            )));
        }
        let dir = self.dir.clone();
        let name = name.to_string();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.flush()?;
            tmp.persist(dir.join(&name))
                .map_err(|e| QuarryError::Storage(format!("persist {}: {}", name, e)))?;
            Ok(())
        })
        .await
        .map_err(|e| QuarryError::Internal(format!("storage task panicked: {}", e)))?
    }
}
