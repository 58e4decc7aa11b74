//! Object store fixtures
//!
//! Tests place files straight into the object store directory, the same way
//! a worker uploading to the bucket would.

use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Writes an empty object whose upload time is `uploaded_at_secs`.
pub fn put_object(root: &Path, bucket: &str, key: &str, uploaded_at_secs: u64) {
    let path = root.join(bucket).join(key);
    std::fs::create_dir_all(path.parent().expect("object key has a parent"))
        .expect("Failed to create object directory");
    let file = File::create(&path).expect("Failed to create object");
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(uploaded_at_secs))
        .expect("Failed to set object upload time");
}

/// Sorted keys currently stored under `prefix` in `bucket`.
pub fn list_keys(root: &Path, bucket: &str, prefix: &str) -> Vec<String> {
    let bucket_dir = root.join(bucket);
    let mut keys: Vec<String> = walkdir::WalkDir::new(&bucket_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(&bucket_dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .filter(|key| key.starts_with(prefix))
        .collect();
    keys.sort();
    keys
}
