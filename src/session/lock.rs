//! Process-wide mutual exclusion for bulk inserts.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

static GLOBAL: OnceLock<BulkInsertLock> = OnceLock::new();

/// Serializes bulk inserts across every session that shares it.
///
/// Sessions use [`BulkInsertLock::global`] unless the builder was handed a
/// different lock. Sessions created through
/// [`Session::new_external_connection`] share their origin's lock.
///
/// [`Session::new_external_connection`]: super::Session::new_external_connection
#[derive(Clone)]
pub struct BulkInsertLock {
    inner: Arc<Mutex<()>>,
}

impl BulkInsertLock {
    /// A private lock, independent of the process-wide one.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
        }
    }

    /// The lock shared by every session in the process.
    pub fn global() -> Self {
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Waits for exclusive access. Released when the guard is dropped.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Whether both handles guard the same lock.
    pub fn is_shared_with(&self, other: &BulkInsertLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Same as [`BulkInsertLock::global`].
impl Default for BulkInsertLock {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for BulkInsertLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkInsertLock")
            .field("locked", &self.inner.try_lock().is_err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let lock = BulkInsertLock::new();
        let shared = lock.clone();
        assert!(lock.is_shared_with(&shared));
        assert!(!lock.is_shared_with(&BulkInsertLock::new()));

        let guard = lock.acquire().await;
        let waiter = tokio::spawn(async move {
            let _guard = shared.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn test_global_lock_is_one_instance() {
        assert!(BulkInsertLock::global().is_shared_with(&BulkInsertLock::global()));
        assert!(!BulkInsertLock::global().is_shared_with(&BulkInsertLock::new()));
    }
}
