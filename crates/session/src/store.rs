//! Credential store: the single source of truth for the current token pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::credential::Credential;
use crate::error::Result;
use crate::storage::SecureStorage;

/// Storage key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

#[derive(Debug, Clone)]
enum CacheSlot {
    /// Secure storage has not been consulted yet.
    Unloaded,
    Loaded(Option<Credential>),
}

/// Caches the credential in memory and mirrors it to secure storage.
///
/// The cache is filled lazily on the first read. Writes hit storage first and
/// only then replace the cache, so a failed write leaves the previous
/// credential in place. Only the two tokens are persisted; timestamps are
/// recomputed from the token claims when the credential is loaded.
pub struct CredentialStore {
    storage: Arc<dyn SecureStorage>,
    cache: RwLock<CacheSlot>,
    /// Serializes loads, writes and clears against each other.
    io_lock: tokio::sync::Mutex<()>,
    /// Bumped by every `clear()`.
    clear_epoch: AtomicU64,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(CacheSlot::Unloaded),
            io_lock: tokio::sync::Mutex::new(()),
            clear_epoch: AtomicU64::new(0),
        }
    }

    /// Current credential, loading it from storage on first use.
    ///
    /// # Returns
    /// * `Ok(None)` - No credential stored, or only half of one
    /// * `Err(StorageFailure)` - Storage could not be read
    pub async fn read(&self) -> Result<Option<Credential>> {
        if let CacheSlot::Loaded(credential) = &*self.cache.read() {
            return Ok(credential.clone());
        }

        let _guard = self.io_lock.lock().await;
        // Another task may have loaded while we waited.
        if let CacheSlot::Loaded(credential) = &*self.cache.read() {
            return Ok(credential.clone());
        }

        let loaded = self.load().await?;
        *self.cache.write() = CacheSlot::Loaded(loaded.clone());
        Ok(loaded)
    }

    async fn load(&self) -> Result<Option<Credential>> {
        let access = self.storage.get(ACCESS_TOKEN_KEY).await?;
        let refresh = self.storage.get(REFRESH_TOKEN_KEY).await?;

        match (access, refresh) {
            (Some(access), Some(refresh)) => {
                debug!("Loaded credential from secure storage");
                Ok(Some(Credential::from_tokens(access, refresh)))
            }
            (None, None) => Ok(None),
            (access, refresh) => {
                warn!(
                    has_access = access.is_some(),
                    has_refresh = refresh.is_some(),
                    "Secure storage holds half a credential, treating as signed out"
                );
                Ok(None)
            }
        }
    }

    /// Persist a credential and make it current.
    ///
    /// Called by the renewal coordinator and the sign-in flow only.
    ///
    /// # Returns
    /// * `Ok(())` - Both tokens are durable and cached
    /// * `Err(StorageFailure)` - Nothing changed, the previous credential stays current
    #[instrument(skip_all)]
    pub async fn write(&self, credential: Credential) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        self.persist(credential).await
    }

    /// Number of `clear()` calls so far.
    pub fn clear_epoch(&self) -> u64 {
        self.clear_epoch.load(Ordering::SeqCst)
    }

    /// Like [`write`](Self::write), but discards the credential when the store
    /// was cleared after `epoch` was observed. Returns whether it was written.
    #[instrument(skip_all)]
    pub async fn write_unless_cleared(&self, credential: Credential, epoch: u64) -> Result<bool> {
        let _guard = self.io_lock.lock().await;
        if self.clear_epoch() != epoch {
            debug!("Store cleared since the credential was requested, discarding it");
            return Ok(false);
        }
        self.persist(credential).await?;
        Ok(true)
    }

    /// Caller holds `io_lock`.
    async fn persist(&self, credential: Credential) -> Result<()> {
        self.storage
            .set_entries(&[
                (ACCESS_TOKEN_KEY, credential.access_token.as_str()),
                (REFRESH_TOKEN_KEY, credential.refresh_token.as_str()),
            ])
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to persist credential"))?;

        *self.cache.write() = CacheSlot::Loaded(Some(credential));
        debug!("Credential written");
        Ok(())
    }

    /// Forget the credential. Safe to call when nothing is stored.
    ///
    /// The cache is emptied before storage is touched, so no request issued
    /// after this call starts can observe the old tokens, even if the storage
    /// delete fails.
    #[instrument(skip_all)]
    pub async fn clear(&self) -> Result<()> {
        self.clear_epoch.fetch_add(1, Ordering::SeqCst);
        *self.cache.write() = CacheSlot::Loaded(None);

        let _guard = self.io_lock.lock().await;
        *self.cache.write() = CacheSlot::Loaded(None);
        self.storage
            .delete_entries(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to delete stored credential"))?;
        info!("Credential cleared");
        Ok(())
    }

    /// Load the stored credential ahead of the first request.
    ///
    /// Returns whether a credential is present.
    pub async fn warm(&self) -> Result<bool> {
        Ok(self.read().await?.is_some())
    }

    /// Cached credential without touching storage. `None` before the first load.
    pub fn cached(&self) -> Option<Credential> {
        match &*self.cache.read() {
            CacheSlot::Loaded(credential) => credential.clone(),
            CacheSlot::Unloaded => None,
        }
    }

    pub async fn access_token(&self) -> Result<Option<String>> {
        Ok(self.read().await?.map(|c| c.access_token))
    }

    pub async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(self.read().await?.map(|c| c.refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Wraps memory storage with switchable write failures and a read counter.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SecureStorage for FlakyStorage {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SessionError::storage("keychain locked"));
            }
            self.inner.set_entries(entries).await
        }

        async fn delete_entries(&self, keys: &[&str]) -> Result<()> {
            self.inner.delete_entries(keys).await
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = CredentialStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(store.read().await.unwrap(), None);

        let credential = Credential::from_tokens("access-1", "refresh-1");
        store.write(credential.clone()).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(credential));
    }

    #[tokio::test]
    async fn read_loads_from_storage_once() {
        let storage = Arc::new(FlakyStorage::default());
        storage
            .inner
            .set_entries(&[(ACCESS_TOKEN_KEY, "a"), (REFRESH_TOKEN_KEY, "r")])
            .await
            .unwrap();

        let store = CredentialStore::new(storage.clone());
        assert!(store.cached().is_none());
        assert!(store.warm().await.unwrap());
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.refresh_token().await.unwrap().as_deref(), Some("r"));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 2);
        assert!(store.cached().is_some());
    }

    #[tokio::test]
    async fn read_after_write_is_served_from_cache() {
        let storage = Arc::new(FlakyStorage::default());
        let store = CredentialStore::new(storage.clone());

        let credential = Credential::from_tokens("access-1", "refresh-1");
        store.write(credential.clone()).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(credential));
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("access-1"));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_after_clear_is_discarded() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(storage.clone());
        store
            .write(Credential::from_tokens("access-1", "refresh-1"))
            .await
            .unwrap();

        let epoch = store.clear_epoch();
        store.clear().await.unwrap();

        let written = store
            .write_unless_cleared(Credential::from_tokens("access-2", "refresh-2"), epoch)
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(store.read().await.unwrap(), None);
        assert!(storage.is_empty());

        let written = store
            .write_unless_cleared(
                Credential::from_tokens("access-3", "refresh-3"),
                store.clear_epoch(),
            )
            .await
            .unwrap();
        assert!(written);
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("access-3"));
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_credential() {
        let storage = Arc::new(FlakyStorage::default());
        let store = CredentialStore::new(storage.clone());
        let first = Credential::from_tokens("access-1", "refresh-1");
        store.write(first.clone()).await.unwrap();

        storage.fail_writes.store(true, Ordering::SeqCst);
        let err = store
            .write(Credential::from_tokens("access-2", "refresh-2"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::StorageFailure { .. }));
        assert_eq!(store.read().await.unwrap(), Some(first));
        assert_eq!(
            storage.inner.get(ACCESS_TOKEN_KEY).await.unwrap().as_deref(),
            Some("access-1")
        );
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(storage.clone());
        store
            .write(Credential::from_tokens("access", "refresh"))
            .await
            .unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.read().await.unwrap(), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn half_a_credential_reads_as_absent() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set_entries(&[(ACCESS_TOKEN_KEY, "orphan")])
            .await
            .unwrap();

        let store = CredentialStore::new(storage);
        assert_eq!(store.read().await.unwrap(), None);
        assert!(!store.warm().await.unwrap());
    }

    #[tokio::test]
    async fn loaded_credential_recomputes_timestamps() {
        use crate::credential::test_tokens::jwt;

        let storage = Arc::new(MemoryStorage::new());
        let access = jwt("u", 1_700_000_000, 1_700_003_600);
        let refresh = jwt("u", 1_700_000_000, 1_701_209_600);
        storage
            .set_entries(&[
                (ACCESS_TOKEN_KEY, access.as_str()),
                (REFRESH_TOKEN_KEY, refresh.as_str()),
            ])
            .await
            .unwrap();

        let credential = CredentialStore::new(storage).read().await.unwrap().unwrap();
        assert_eq!(
            credential.access_expires_at,
            chrono::DateTime::from_timestamp(1_700_003_600, 0)
        );
    }
}
