//! Spend guard
//!
//! One async mutex per engine. Every operation that selects and spends
//! outputs holds the permit from selection until the ledger is updated; the
//! permit releases on drop, on every exit path.

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct SpendGuard {
    lock: Mutex<()>,
}

/// Held for the duration of one spend
pub struct SpendPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl SpendGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access
    pub async fn acquire(&self) -> SpendPermit<'_> {
        SpendPermit {
            _guard: self.lock.lock().await,
        }
    }

    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permit_serializes_holders() {
        let guard = Arc::new(SpendGuard::new());
        let permit = guard.acquire().await;
        assert!(guard.is_held());

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _permit = guard.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap();
        assert!(!guard.is_held());
    }

    #[tokio::test]
    async fn test_permit_released_on_error_path() {
        async fn failing(guard: &SpendGuard) -> Result<(), &'static str> {
            let _permit = guard.acquire().await;
            Err("boom")
        }

        let guard = SpendGuard::new();
        assert!(failing(&guard).await.is_err());
        assert!(!guard.is_held());
    }
}
