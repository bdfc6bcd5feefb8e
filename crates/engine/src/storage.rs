use std::time::Duration;

use diarist_store::{MetadataStore, StoreError};

use crate::error::StorageError;

/// [`MetadataStore`] handle whose calls run on the blocking pool and are
/// bounded by a timeout.  A timed-out call may still complete in the
/// background; callers treat it as transient and re-read before retrying.
#[derive(Debug, Clone)]
pub struct BoundedStore {
    store: MetadataStore,
    timeout: Duration,
    #[cfg(test)]
    faults: std::sync::Arc<crate::testing::StoreFaults>,
}

impl BoundedStore {
    pub fn new(store: MetadataStore, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            #[cfg(test)]
            faults: Default::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn faults(&self) -> &crate::testing::StoreFaults {
        &self.faults
    }

    pub async fn call<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&MetadataStore) -> Result<T, StoreError> + Send + 'static,
    {
        #[cfg(test)]
        if self.faults.trip() {
            return Err(StorageError::Worker("metadata store offline".to_string()));
        }

        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(StorageError::from),
            Ok(Err(join)) => Err(StorageError::Worker(join.to_string())),
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_returns_store_result() {
        let store = BoundedStore::new(MetadataStore::in_memory().unwrap(), Duration::from_secs(2));
        let docs = store
            .call(|db| db.documents_for_owner("ou_a"))
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let store = BoundedStore::new(
            MetadataStore::in_memory().unwrap(),
            Duration::from_millis(20),
        );
        let err = store
            .call(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)));
    }

    #[tokio::test]
    async fn outage_fails_calls_until_restored() {
        let store = BoundedStore::new(MetadataStore::in_memory().unwrap(), Duration::from_secs(2));
        let clone = store.clone();
        store.faults().fail_after(1);
        assert!(clone.call(|db| db.documents_for_owner("ou_a")).await.is_ok());
        let err = clone.call(|db| db.documents_for_owner("ou_a")).await.unwrap_err();
        assert!(matches!(err, StorageError::Worker(_)));
        store.faults().restore();
        assert!(clone.call(|db| db.documents_for_owner("ou_a")).await.is_ok());
    }
}
