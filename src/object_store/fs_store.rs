use super::{ObjectStore, StoredObject};
use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

/// Object store laid out on a local filesystem: one directory per bucket
/// under `root`, keys are `/`-separated paths inside it.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create object store root {:?}", root))?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => bail!("Invalid bucket name '{}'", bucket),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("Invalid object key '{}'", key);
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }
}

fn key_for(bucket_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(bucket_dir).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

impl ObjectStore for FsObjectStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
        let bucket_dir = self.bucket_dir(bucket)?;
        if !bucket_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&bucket_dir).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk bucket {}", bucket))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = key_for(&bucket_dir, entry.path()) else {
                debug!("Skipping non UTF-8 path {:?}", entry.path());
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let modified = entry
                .metadata()
                .with_context(|| format!("Failed to stat {:?}", entry.path()))?
                .modified()?;
            let uploaded_at_ms = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            objects.push(StoredObject {
                key,
                uploaded_at_ms,
            });
        }
        Ok(objects)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}/{}", bucket, key)),
        }
    }
}
