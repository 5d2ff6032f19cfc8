//! Durable Key-Value Storage
//!
//! The session record (access token, refresh token, identity, expiry) is
//! persisted through this trait so it survives a restart. Hosts choose the
//! backing: a JSON file, the OS keychain, or browser storage.

use async_trait::async_trait;

use crate::error::Result;

/// Durable string key-value store
///
/// # Requirements
///
/// Implementations MUST:
/// - Return `Ok(None)` for a key that was never written or was removed
/// - Treat `remove` of a missing key as success
/// - Make a completed `set_string` visible to every later `get_string`,
///   including after a process restart
///
/// Stored values are credentials. Implementations must never log them.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// async fn remember(store: &dyn KeyValueStore, token: &str) -> Result<()> {
///     store.set_string("accessToken", token).await
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key).await?.is_some())
    }

    /// Write several values.
    ///
    /// The default writes them one by one; adapters that can commit a batch
    /// atomically (e.g. a single file rewrite) should override this.
    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.set_string(key, value).await?;
        }
        Ok(())
    }

    /// Delete several values, attempting every key and reporting the first failure.
    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove(key).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        KeyValueStore {}

        #[async_trait]
        impl KeyValueStore for KeyValueStore {
            async fn get_string(&self, key: &str) -> Result<Option<String>>;
            async fn set_string(&self, key: &str, value: &str) -> Result<()>;
            async fn remove(&self, key: &str) -> Result<()>;
        }
    }

    #[tokio::test]
    async fn test_has_key_uses_get_string() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get_string()
            .with(eq("accessToken"))
            .returning(|_| Ok(Some("at-1".to_string())));
        store
            .expect_get_string()
            .with(eq("refreshToken"))
            .returning(|_| Ok(None));

        assert!(store.has_key("accessToken").await.unwrap());
        assert!(!store.has_key("refreshToken").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_many_writes_each_entry() {
        let mut store = MockKeyValueStore::new();
        store.expect_set_string().times(2).returning(|_, _| Ok(()));

        let entries = vec![
            ("accessToken".to_string(), "at-1".to_string()),
            ("refreshToken".to_string(), "rt-1".to_string()),
        ];
        store.set_many(&entries).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_many_attempts_all_keys() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_remove()
            .with(eq("accessToken"))
            .times(1)
            .returning(|_| Err(BridgeError::Storage("locked".to_string())));
        store
            .expect_remove()
            .with(eq("refreshToken"))
            .times(1)
            .returning(|_| Ok(()));

        let keys = vec!["accessToken".to_string(), "refreshToken".to_string()];
        let result = store.remove_many(&keys).await;
        assert!(matches!(result, Err(BridgeError::Storage(_))));
    }
}
