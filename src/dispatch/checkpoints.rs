//! Checkpoint lookup and retention.
//!
//! Checkpoints are written straight to the object store by workers. This
//! module only reads them back (to tell a worker where to resume) and
//! deletes the ones beyond the retention cap.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{DispatchError, DispatchResult};
use super::models::{GcReport, Job};
use crate::object_store::{ObjectStore, StoredObject};
use crate::server::metrics;

/// Newest upload first; equal upload times fall back to the key, descending.
fn newest_first(a: &StoredObject, b: &StoredObject) -> Ordering {
    b.uploaded_at_ms
        .cmp(&a.uploaded_at_ms)
        .then_with(|| b.key.cmp(&a.key))
}

/// Read-through view of a job's checkpoints and training inputs.
pub struct CheckpointIndex {
    objects: Arc<dyn ObjectStore>,
}

impl CheckpointIndex {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// The job's checkpoints, newest first.
    pub fn checkpoints(&self, job: &Job) -> DispatchResult<Vec<StoredObject>> {
        let mut checkpoints = self
            .objects
            .list(&job.checkpoint_bucket, &job.checkpoint_prefix)
            .map_err(DispatchError::StorageUnavailable)?;
        checkpoints.sort_by(newest_first);
        Ok(checkpoints)
    }

    /// Key of the most recent checkpoint, if any was uploaded.
    pub fn latest_checkpoint(&self, job: &Job) -> DispatchResult<Option<String>> {
        Ok(self.checkpoints(job)?.into_iter().next().map(|o| o.key))
    }

    /// Sorted keys of the job's instance images.
    pub fn instance_data_keys(&self, job: &Job) -> DispatchResult<Vec<String>> {
        self.data_keys(&job.data_bucket, &job.instance_data_prefix)
    }

    /// Sorted keys of the job's class images, when it has a class prefix.
    pub fn class_data_keys(&self, job: &Job) -> DispatchResult<Option<Vec<String>>> {
        match job.class_data_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => {
                Ok(Some(self.data_keys(&job.data_bucket, prefix)?))
            }
            _ => Ok(None),
        }
    }

    fn data_keys(&self, bucket: &str, prefix: &str) -> DispatchResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .list(bucket, prefix)
            .map_err(DispatchError::StorageUnavailable)?
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Keep the `max_stored` newest checkpoints of `job` and delete the rest,
    /// oldest first.
    ///
    /// Never fails: listing and deletion errors are logged and counted in the
    /// returned report.
    pub fn enforce_retention(&self, job: &Job, max_stored: usize) -> GcReport {
        let checkpoints = match self.checkpoints(job) {
            Ok(checkpoints) => checkpoints,
            Err(e) => {
                warn!("Failed to list checkpoints of job {}: {}", job.id, e);
                return GcReport::default();
            }
        };

        let mut report = GcReport {
            listed: checkpoints.len(),
            ..Default::default()
        };
        if checkpoints.len() <= max_stored {
            return report;
        }

        for stale in checkpoints.iter().skip(max_stored).rev() {
            match self.objects.delete(&job.checkpoint_bucket, &stale.key) {
                Ok(()) => {
                    debug!("Deleted old checkpoint {} of job {}", stale.key, job.id);
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to delete checkpoint {}/{}: {:#}",
                        job.checkpoint_bucket, stale.key, e
                    );
                    report.failed += 1;
                }
            }
        }

        metrics::record_checkpoint_gc(report.deleted, report.failed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::models::JobSpec;
    use crate::object_store::{MemoryObjectStore, MockObjectStore};
    use anyhow::anyhow;
    use mockall::Sequence;

    fn job() -> Job {
        let spec = JobSpec {
            instance_data_prefix: "dogs/".to_string(),
            class_data_prefix: Some("class/dog/".to_string()),
            ..Default::default()
        };
        Job::new("j1".to_string(), spec, "training-data", "checkpoints", 1)
    }

    fn object(key: &str, uploaded_at_ms: i64) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            uploaded_at_ms,
        }
    }

    #[test]
    fn test_latest_checkpoint_is_newest_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("checkpoints", "loras/j1/step-300", 300);
        store.put("checkpoints", "loras/j1/step-100", 100);
        store.put("checkpoints", "loras/j1/step-200", 200);
        store.put("checkpoints", "loras/other/step-900", 900);
        let index = CheckpointIndex::new(store);

        assert_eq!(
            index.latest_checkpoint(&job()).unwrap().as_deref(),
            Some("loras/j1/step-300")
        );
    }

    #[test]
    fn test_upload_time_ties_break_by_key() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("checkpoints", "loras/j1/a", 100);
        store.put("checkpoints", "loras/j1/b", 100);
        let index = CheckpointIndex::new(store);

        assert_eq!(
            index.latest_checkpoint(&job()).unwrap().as_deref(),
            Some("loras/j1/b")
        );
    }

    #[test]
    fn test_no_checkpoints_means_no_resume() {
        let index = CheckpointIndex::new(Arc::new(MemoryObjectStore::new()));
        assert_eq!(index.latest_checkpoint(&job()).unwrap(), None);
    }

    #[test]
    fn test_data_keys_from_training_bucket() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("training-data", "dogs/2.jpg", 1);
        store.put("training-data", "dogs/1.jpg", 2);
        store.put("training-data", "class/dog/a.jpg", 3);
        store.put("checkpoints", "dogs/ignored.jpg", 4);
        let index = CheckpointIndex::new(store);

        let job = job();
        assert_eq!(
            index.instance_data_keys(&job).unwrap(),
            vec!["dogs/1.jpg", "dogs/2.jpg"]
        );
        assert_eq!(
            index.class_data_keys(&job).unwrap(),
            Some(vec!["class/dog/a.jpg".to_string()])
        );
    }

    #[test]
    fn test_retention_keeps_newest() {
        let store = Arc::new(MemoryObjectStore::new());
        for step in 1..=5 {
            store.put("checkpoints", &format!("loras/j1/step-{}", step), step * 10);
        }
        let index = CheckpointIndex::new(store.clone());

        let report = index.enforce_retention(&job(), 2);

        assert_eq!(
            report,
            GcReport {
                listed: 5,
                deleted: 3,
                failed: 0
            }
        );
        assert_eq!(
            store.keys("checkpoints"),
            vec!["loras/j1/step-4", "loras/j1/step-5"]
        );
    }

    #[test]
    fn test_retention_under_cap_deletes_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("checkpoints", "loras/j1/step-1", 1);
        let index = CheckpointIndex::new(store.clone());

        let report = index.enforce_retention(&job(), 3);
        assert_eq!(report.deleted, 0);
        assert!(store.contains("checkpoints", "loras/j1/step-1"));

        // Running it again is harmless
        let again = index.enforce_retention(&job(), 3);
        assert_eq!(again, report);
    }

    #[test]
    fn test_retention_deletes_oldest_first_and_survives_failures() {
        let mut mock = MockObjectStore::new();
        mock.expect_list().returning(|_, _| {
            Ok(vec![
                object("loras/j1/c", 30),
                object("loras/j1/a", 10),
                object("loras/j1/b", 20),
            ])
        });
        let mut seq = Sequence::new();
        mock.expect_delete()
            .withf(|bucket, key| bucket == "checkpoints" && key == "loras/j1/a")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(anyhow!("bucket is read-only")));
        mock.expect_delete()
            .withf(|_, key| key == "loras/j1/b")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let index = CheckpointIndex::new(Arc::new(mock));

        let report = index.enforce_retention(&job(), 1);

        assert_eq!(
            report,
            GcReport {
                listed: 3,
                deleted: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_retention_listing_failure_is_not_fatal() {
        let mut mock = MockObjectStore::new();
        mock.expect_list()
            .returning(|_, _| Err(anyhow!("object store offline")));
        mock.expect_delete().never();
        let index = CheckpointIndex::new(Arc::new(mock));

        assert_eq!(index.enforce_retention(&job(), 1), GcReport::default());
    }

    #[test]
    fn test_listing_failure_surfaces_for_lookups() {
        let mut mock = MockObjectStore::new();
        mock.expect_list()
            .returning(|_, _| Err(anyhow!("object store offline")));
        let index = CheckpointIndex::new(Arc::new(mock));

        assert!(matches!(
            index.latest_checkpoint(&job()),
            Err(DispatchError::StorageUnavailable(_))
        ));
    }
}
